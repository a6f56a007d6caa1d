// src/db/mod.rs
//! Trwały magazyn: users, groups, group_config, joins, blacklist, clusters, actions.
//! [`Store`] to jedyny punkt styku komponentów z bazą; `pg` to produkcja, `memory` – proces/testy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use tracing::{info, warn};

use crate::config::Database;
use crate::model::{
    ActionLogEntry, BlacklistEntry, ChatId, GroupRecord, GroupStatus, JoinRow, NewCluster,
    RiskLevel, UserId, UserRecord,
};

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

pub type Db = Pool<Postgres>;

#[async_trait]
pub trait Store: Send + Sync {
    /* --------- groups --------- */

    /// Tworzy grupę jako `known` przy pierwszym kontakcie; aktualizuje tytuł.
    async fn upsert_group_seen(
        &self,
        chat_id: ChatId,
        title: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<GroupRecord>;
    async fn group(&self, chat_id: ChatId) -> Result<Option<GroupRecord>>;
    async fn set_group_status(&self, chat_id: ChatId, status: GroupStatus) -> Result<()>;
    async fn managed_group_ids(&self) -> Result<Vec<ChatId>>;
    async fn group_policy(&self, chat_id: ChatId) -> Result<Option<Value>>;
    async fn set_group_policy(&self, chat_id: ChatId, policy: &Value) -> Result<()>;

    /* --------- users --------- */

    async fn user(&self, user_id: UserId) -> Result<Option<UserRecord>>;
    /// Zapis pełnego rekordu; `is_observed` i `risk_level` nigdy nie schodzą w dół.
    async fn save_user(&self, user: &UserRecord) -> Result<()>;
    async fn users_with_positive_score(&self) -> Result<Vec<UserRecord>>;
    /// Oznacza (i w razie potrzeby tworzy) użytkowników; zwraca liczbę nowo oznaczonych.
    async fn mark_observed(&self, user_ids: &[UserId], now: DateTime<Utc>) -> Result<u64>;
    async fn observed_user_ids(&self) -> Result<HashSet<UserId>>;
    async fn raise_risk_level(
        &self,
        user_id: UserId,
        level: RiskLevel,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /* --------- joins --------- */

    /// `false` = duplikat (user, chat, minuta) – no-op.
    async fn record_join(&self, join: &JoinRow) -> Result<bool>;
    async fn count_joins_since(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u32>;
    async fn managed_joins_since(&self, since: DateTime<Utc>) -> Result<Vec<JoinRow>>;
    async fn user_managed_joins_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<JoinRow>>;

    /* --------- blacklist --------- */

    async fn is_blacklisted(&self, user_id: UserId) -> Result<bool>;
    async fn blacklisted_among(&self, user_ids: &[UserId]) -> Result<HashSet<UserId>>;
    /// `false` = już był na liście – no-op.
    async fn add_to_blacklist(&self, entry: &BlacklistEntry) -> Result<bool>;

    /* --------- clusters / audit --------- */

    async fn insert_cluster(&self, cluster: &NewCluster, now: DateTime<Utc>) -> Result<i64>;
    async fn log_action(&self, entry: &ActionLogEntry) -> Result<()>;
    async fn successful_actions_since(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u32>;
}

/* ==============================
   Połączenie + migracje
   ============================== */

pub async fn connect(url: &str, max: Option<u32>, statement_timeout_ms: Option<u64>) -> Result<Db> {
    let mut opts = PgPoolOptions::new()
        .max_connections(max.unwrap_or(10))
        .acquire_timeout(Duration::from_secs(10));

    if let Some(ms) = statement_timeout_ms {
        opts = opts.after_connect(move |conn, _meta| {
            Box::pin(async move {
                sqlx::query(&format!("SET statement_timeout = {}", ms))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        });
    }

    let pool = opts.connect(url).await?;
    Ok(pool)
}

/// Wersjonowany schemat – lista migracji z `./migrations`, stan w `_sqlx_migrations`.
pub async fn migrate(pool: &Db) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

async fn connect_and_migrate(cfg: &Database) -> Result<Db> {
    let pool = connect(&cfg.url, cfg.max_connections, cfg.statement_timeout_ms).await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Otwiera magazyn wg URL. Dla Postgresa: jedna próba naprawcza (ponowne połączenie + migracje),
/// potem błąd – proces ma się zakończyć.
pub async fn open(cfg: &Database) -> Result<Arc<dyn Store>> {
    if cfg.url.starts_with("memory://") {
        info!("using in-process memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let pool = match connect_and_migrate(cfg).await {
        Ok(pool) => pool,
        Err(first) => {
            warn!(error=?first, "store init failed, retrying once");
            tokio::time::sleep(Duration::from_secs(2)).await;
            connect_and_migrate(cfg)
                .await
                .context("store initialisation failed after retry")?
        }
    };

    info!("postgres store ready (migrations applied)");
    Ok(Arc::new(PgStore::new(pool)))
}
