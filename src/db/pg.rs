// src/db/pg.rs

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Row, postgres::PgRow};
use tracing::debug;

use super::{Db, Store};
use crate::model::{
    ActionLogEntry, BlacklistEntry, ChatId, GroupRecord, GroupStatus, JoinRow, NewCluster,
    RiskLevel, UserId, UserRecord, UserStatus,
};

const USER_COLUMNS: &str = "user_id, risk_score, status, account_created_at, has_username, \
     has_profile_photo, profile_captured, is_observed, risk_level, last_decay_at, created_at, updated_at";

const GROUP_COLUMNS: &str = "chat_id, title, status, silent_mode, brand, location, created_at";

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &Db {
        &self.db
    }
}

fn user_from_row(row: &PgRow) -> Result<UserRecord> {
    Ok(UserRecord {
        id: row.try_get::<i64, _>("user_id")? as u64,
        risk_score: row.try_get("risk_score")?,
        status: UserStatus::parse(row.try_get::<String, _>("status")?.as_str()),
        account_created_at: row.try_get("account_created_at")?,
        has_username: row.try_get("has_username")?,
        has_profile_photo: row.try_get("has_profile_photo")?,
        profile_captured: row.try_get("profile_captured")?,
        is_observed: row.try_get("is_observed")?,
        risk_level: RiskLevel::from_i16(row.try_get("risk_level")?),
        last_decay_at: row.try_get("last_decay_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn group_from_row(row: &PgRow) -> Result<GroupRecord> {
    Ok(GroupRecord {
        id: row.try_get("chat_id")?,
        title: row.try_get("title")?,
        status: GroupStatus::parse(row.try_get::<String, _>("status")?.as_str()),
        silent_mode: row.try_get("silent_mode")?,
        brand: row.try_get("brand")?,
        location: row.try_get("location")?,
        created_at: row.try_get("created_at")?,
    })
}

fn join_from_row(row: &PgRow) -> Result<JoinRow> {
    Ok(JoinRow {
        user_id: row.try_get::<i64, _>("user_id")? as u64,
        chat_id: row.try_get("chat_id")?,
        joined_at: row.try_get("joined_at")?,
    })
}

fn ids_i64(ids: &[UserId]) -> Vec<i64> {
    ids.iter().map(|v| *v as i64).collect()
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_group_seen(
        &self,
        chat_id: ChatId,
        title: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<GroupRecord> {
        let q = format!(
            r#"
            INSERT INTO sentinel.groups (chat_id, title, status, created_at, updated_at)
            VALUES ($1, $2, 'known', $3, $3)
            ON CONFLICT (chat_id) DO UPDATE
               SET title = COALESCE(EXCLUDED.title, sentinel.groups.title),
                   updated_at = EXCLUDED.updated_at
            RETURNING {GROUP_COLUMNS}
            "#
        );
        let row = sqlx::query(&q)
            .bind(chat_id)
            .bind(title)
            .bind(now)
            .fetch_one(&self.db)
            .await?;
        group_from_row(&row)
    }

    async fn group(&self, chat_id: ChatId) -> Result<Option<GroupRecord>> {
        let q = format!("SELECT {GROUP_COLUMNS} FROM sentinel.groups WHERE chat_id = $1");
        let row = sqlx::query(&q).bind(chat_id).fetch_optional(&self.db).await?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn set_group_status(&self, chat_id: ChatId, status: GroupStatus) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sentinel.groups (chat_id, status) VALUES ($1, $2)
            ON CONFLICT (chat_id) DO UPDATE SET status = EXCLUDED.status, updated_at = now()
            "#,
        )
        .bind(chat_id)
        .bind(status.as_str())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn managed_group_ids(&self) -> Result<Vec<ChatId>> {
        let rows = sqlx::query("SELECT chat_id FROM sentinel.groups WHERE status = 'managed'")
            .fetch_all(&self.db)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(r.try_get::<i64, _>("chat_id")?);
        }
        Ok(out)
    }

    async fn group_policy(&self, chat_id: ChatId) -> Result<Option<Value>> {
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT config FROM sentinel.group_config WHERE chat_id = $1")
                .bind(chat_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_group_policy(&self, chat_id: ChatId, policy: &Value) -> Result<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("INSERT INTO sentinel.groups (chat_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO sentinel.group_config (chat_id, config) VALUES ($1, $2)
            ON CONFLICT (chat_id) DO UPDATE SET config = EXCLUDED.config, updated_at = now()
            "#,
        )
        .bind(chat_id)
        .bind(policy)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        let q = format!("SELECT {USER_COLUMNS} FROM sentinel.users WHERE user_id = $1");
        let row = sqlx::query(&q)
            .bind(user_id as i64)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn save_user(&self, u: &UserRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sentinel.users
                (user_id, risk_score, status, account_created_at, has_username, has_profile_photo,
                 profile_captured, is_observed, risk_level, last_decay_at, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
            ON CONFLICT (user_id) DO UPDATE SET
                risk_score         = EXCLUDED.risk_score,
                status             = EXCLUDED.status,
                account_created_at = COALESCE(EXCLUDED.account_created_at, sentinel.users.account_created_at),
                has_username       = EXCLUDED.has_username,
                has_profile_photo  = EXCLUDED.has_profile_photo,
                profile_captured   = sentinel.users.profile_captured OR EXCLUDED.profile_captured,
                is_observed        = sentinel.users.is_observed OR EXCLUDED.is_observed,
                risk_level         = GREATEST(sentinel.users.risk_level, EXCLUDED.risk_level),
                last_decay_at      = EXCLUDED.last_decay_at,
                updated_at         = EXCLUDED.updated_at
            "#,
        )
        .bind(u.id as i64)
        .bind(u.risk_score.max(0))
        .bind(u.status.as_str())
        .bind(u.account_created_at)
        .bind(u.has_username)
        .bind(u.has_profile_photo)
        .bind(u.profile_captured)
        .bind(u.is_observed)
        .bind(u.risk_level.as_i16())
        .bind(u.last_decay_at)
        .bind(u.created_at)
        .bind(u.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn users_with_positive_score(&self) -> Result<Vec<UserRecord>> {
        let q = format!("SELECT {USER_COLUMNS} FROM sentinel.users WHERE risk_score > 0");
        let rows = sqlx::query(&q).fetch_all(&self.db).await?;
        rows.iter().map(user_from_row).collect()
    }

    async fn mark_observed(&self, user_ids: &[UserId], now: DateTime<Utc>) -> Result<u64> {
        if user_ids.is_empty() {
            return Ok(0);
        }
        // xmax = 0 → wiersz wstawiony; dla UPDATE liczymy tylko zmianę false → true
        let res = sqlx::query(
            r#"
            INSERT INTO sentinel.users (user_id, is_observed, created_at, updated_at)
            SELECT u, TRUE, $2, $2 FROM UNNEST($1::BIGINT[]) AS u
            ON CONFLICT (user_id) DO UPDATE
               SET is_observed = TRUE, updated_at = EXCLUDED.updated_at
             WHERE sentinel.users.is_observed = FALSE
            "#,
        )
        .bind(ids_i64(user_ids))
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected())
    }

    async fn observed_user_ids(&self) -> Result<HashSet<UserId>> {
        let rows = sqlx::query("SELECT user_id FROM sentinel.users WHERE is_observed")
            .fetch_all(&self.db)
            .await?;
        let mut out = HashSet::with_capacity(rows.len());
        for r in rows {
            out.insert(r.try_get::<i64, _>("user_id")? as u64);
        }
        Ok(out)
    }

    async fn raise_risk_level(
        &self,
        user_id: UserId,
        level: RiskLevel,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sentinel.users (user_id, risk_level, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (user_id) DO UPDATE
               SET risk_level = GREATEST(sentinel.users.risk_level, EXCLUDED.risk_level),
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(user_id as i64)
        .bind(level.as_i16())
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn record_join(&self, join: &JoinRow) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO sentinel.joins (user_id, chat_id, joined_at, minute_bucket)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, chat_id, minute_bucket) DO NOTHING
            "#,
        )
        .bind(join.user_id as i64)
        .bind(join.chat_id)
        .bind(join.joined_at)
        .bind(join.minute_bucket())
        .execute(&self.db)
        .await?;
        let inserted = res.rows_affected() > 0;
        if !inserted {
            debug!(user_id = join.user_id, chat_id = join.chat_id, "duplicate join row ignored");
        }
        Ok(inserted)
    }

    async fn count_joins_since(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u32> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)::bigint FROM sentinel.joins WHERE user_id = $1 AND joined_at >= $2",
        )
        .bind(user_id as i64)
        .bind(since)
        .fetch_one(&self.db)
        .await?;
        Ok(n.max(0) as u32)
    }

    async fn managed_joins_since(&self, since: DateTime<Utc>) -> Result<Vec<JoinRow>> {
        let rows = sqlx::query(
            r#"
            SELECT j.user_id, j.chat_id, j.joined_at
              FROM sentinel.joins j
              JOIN sentinel.groups g ON g.chat_id = j.chat_id
             WHERE g.status = 'managed' AND j.joined_at >= $1
            "#,
        )
        .bind(since)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(join_from_row).collect()
    }

    async fn user_managed_joins_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<JoinRow>> {
        let rows = sqlx::query(
            r#"
            SELECT j.user_id, j.chat_id, j.joined_at
              FROM sentinel.joins j
              JOIN sentinel.groups g ON g.chat_id = j.chat_id
             WHERE g.status = 'managed' AND j.user_id = $1 AND j.joined_at >= $2
             ORDER BY j.joined_at
            "#,
        )
        .bind(user_id as i64)
        .bind(since)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(join_from_row).collect()
    }

    async fn is_blacklisted(&self, user_id: UserId) -> Result<bool> {
        let hit: Option<i64> =
            sqlx::query_scalar("SELECT user_id FROM sentinel.blacklist WHERE user_id = $1")
                .bind(user_id as i64)
                .fetch_optional(&self.db)
                .await?;
        Ok(hit.is_some())
    }

    async fn blacklisted_among(&self, user_ids: &[UserId]) -> Result<HashSet<UserId>> {
        if user_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT user_id FROM sentinel.blacklist WHERE user_id = ANY($1)")
                .bind(ids_i64(user_ids))
                .fetch_all(&self.db)
                .await?;
        Ok(ids.into_iter().map(|v| v as u64).collect())
    }

    async fn add_to_blacklist(&self, e: &BlacklistEntry) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO sentinel.blacklist (user_id, banned_by, banned_at, reason)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(e.user_id as i64)
        .bind(e.banned_by.map(|v| v as i64))
        .bind(e.banned_at)
        .bind(&e.reason)
        .execute(&self.db)
        .await?;
        let inserted = res.rows_affected() > 0;
        if !inserted {
            debug!(user_id = e.user_id, "blacklist entry already present");
        }
        Ok(inserted)
    }

    async fn insert_cluster(&self, c: &NewCluster, now: DateTime<Utc>) -> Result<i64> {
        let mut tx = self.db.begin().await?;
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sentinel.clusters (level, created_at, group_ids, banned, reason, source)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(c.level.as_i16())
        .bind(now)
        .bind(&c.group_ids)
        .bind(c.banned)
        .bind(&c.reason)
        .bind(c.source.as_str())
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO sentinel.cluster_members (cluster_id, user_id)
            SELECT $1, u FROM UNNEST($2::BIGINT[]) AS u
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id)
        .bind(ids_i64(&c.user_ids))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn log_action(&self, e: &ActionLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sentinel.actions
                (created_at, chat_id, user_id, action, severity, outcome, reason, detail, dry_run)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            "#,
        )
        .bind(e.at)
        .bind(e.chat_id)
        .bind(e.user_id as i64)
        .bind(&e.action)
        .bind(e.severity.as_deref())
        .bind(&e.outcome)
        .bind(e.reason.as_deref())
        .bind(e.detail.as_deref())
        .bind(e.dry_run)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn successful_actions_since(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u32> {
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::bigint FROM sentinel.actions
             WHERE user_id = $1 AND outcome = 'success' AND created_at >= $2
            "#,
        )
        .bind(user_id as i64)
        .bind(since)
        .fetch_one(&self.db)
        .await?;
        Ok(n.max(0) as u32)
    }
}
