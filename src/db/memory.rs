// src/db/memory.rs
//! Magazyn w pamięci procesu – te same reguły co w Postgresie (unikalność joinów,
//! blacklist bez duplikatów, risk_level/is_observed tylko w górę).

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::Store;
use crate::model::{
    ActionLogEntry, BlacklistEntry, ChatId, ClusterRecord, GroupRecord, GroupStatus, JoinRow,
    NewCluster, RiskLevel, UserId, UserRecord,
};

#[derive(Default)]
struct State {
    users: HashMap<UserId, UserRecord>,
    groups: HashMap<ChatId, GroupRecord>,
    policies: HashMap<ChatId, Value>,
    joins: Vec<JoinRow>,
    join_keys: HashSet<(UserId, ChatId, i64)>,
    blacklist: HashMap<UserId, BlacklistEntry>,
    clusters: Vec<ClusterRecord>,
    actions: Vec<ActionLogEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    /* --------- podgląd (testy, diagnostyka) --------- */

    pub fn clusters(&self) -> Vec<ClusterRecord> {
        self.lock().map(|s| s.clusters.clone()).unwrap_or_default()
    }

    pub fn actions(&self) -> Vec<ActionLogEntry> {
        self.lock().map(|s| s.actions.clone()).unwrap_or_default()
    }

    pub fn blacklist(&self) -> Vec<BlacklistEntry> {
        let mut out: Vec<_> = self
            .lock()
            .map(|s| s.blacklist.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|e| e.user_id);
        out
    }

    pub fn joins(&self) -> Vec<JoinRow> {
        self.lock().map(|s| s.joins.clone()).unwrap_or_default()
    }
}

fn new_group(chat_id: ChatId, now: DateTime<Utc>) -> GroupRecord {
    GroupRecord {
        id: chat_id,
        title: None,
        status: GroupStatus::Known,
        silent_mode: false,
        brand: None,
        location: None,
        created_at: now,
    }
}

fn managed_ids(s: &State) -> HashSet<ChatId> {
    s.groups
        .values()
        .filter(|g| g.is_managed())
        .map(|g| g.id)
        .collect()
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_group_seen(
        &self,
        chat_id: ChatId,
        title: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<GroupRecord> {
        let mut s = self.lock()?;
        let g = s
            .groups
            .entry(chat_id)
            .or_insert_with(|| new_group(chat_id, now));
        if let Some(t) = title {
            g.title = Some(t.to_string());
        }
        Ok(g.clone())
    }

    async fn group(&self, chat_id: ChatId) -> Result<Option<GroupRecord>> {
        Ok(self.lock()?.groups.get(&chat_id).cloned())
    }

    async fn set_group_status(&self, chat_id: ChatId, status: GroupStatus) -> Result<()> {
        let mut s = self.lock()?;
        s.groups
            .entry(chat_id)
            .or_insert_with(|| new_group(chat_id, Utc::now()))
            .status = status;
        Ok(())
    }

    async fn managed_group_ids(&self) -> Result<Vec<ChatId>> {
        let mut ids: Vec<_> = managed_ids(&*self.lock()?).into_iter().collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn group_policy(&self, chat_id: ChatId) -> Result<Option<Value>> {
        Ok(self.lock()?.policies.get(&chat_id).cloned())
    }

    async fn set_group_policy(&self, chat_id: ChatId, policy: &Value) -> Result<()> {
        let mut s = self.lock()?;
        s.groups
            .entry(chat_id)
            .or_insert_with(|| new_group(chat_id, Utc::now()));
        s.policies.insert(chat_id, policy.clone());
        Ok(())
    }

    async fn user(&self, user_id: UserId) -> Result<Option<UserRecord>> {
        Ok(self.lock()?.users.get(&user_id).cloned())
    }

    async fn save_user(&self, user: &UserRecord) -> Result<()> {
        let mut s = self.lock()?;
        let mut next = user.clone();
        next.risk_score = next.risk_score.max(0);
        if let Some(prev) = s.users.get(&user.id) {
            next.is_observed |= prev.is_observed;
            next.profile_captured |= prev.profile_captured;
            next.risk_level = next.risk_level.max(prev.risk_level);
            if next.account_created_at.is_none() {
                next.account_created_at = prev.account_created_at;
            }
        }
        s.users.insert(user.id, next);
        Ok(())
    }

    async fn users_with_positive_score(&self) -> Result<Vec<UserRecord>> {
        let mut out: Vec<_> = self
            .lock()?
            .users
            .values()
            .filter(|u| u.risk_score > 0)
            .cloned()
            .collect();
        out.sort_by_key(|u| u.id);
        Ok(out)
    }

    async fn mark_observed(&self, user_ids: &[UserId], now: DateTime<Utc>) -> Result<u64> {
        let mut s = self.lock()?;
        let mut changed = 0;
        for id in user_ids {
            let u = s
                .users
                .entry(*id)
                .or_insert_with(|| UserRecord::new(*id, now));
            if !u.is_observed {
                u.is_observed = true;
                u.updated_at = now;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn observed_user_ids(&self) -> Result<HashSet<UserId>> {
        Ok(self
            .lock()?
            .users
            .values()
            .filter(|u| u.is_observed)
            .map(|u| u.id)
            .collect())
    }

    async fn raise_risk_level(
        &self,
        user_id: UserId,
        level: RiskLevel,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut s = self.lock()?;
        let u = s
            .users
            .entry(user_id)
            .or_insert_with(|| UserRecord::new(user_id, now));
        if level > u.risk_level {
            u.risk_level = level;
            u.updated_at = now;
        }
        Ok(())
    }

    async fn record_join(&self, join: &JoinRow) -> Result<bool> {
        let mut s = self.lock()?;
        let key = (join.user_id, join.chat_id, join.minute_bucket());
        if !s.join_keys.insert(key) {
            return Ok(false);
        }
        s.joins.push(*join);
        Ok(true)
    }

    async fn count_joins_since(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u32> {
        Ok(self
            .lock()?
            .joins
            .iter()
            .filter(|j| j.user_id == user_id && j.joined_at >= since)
            .count() as u32)
    }

    async fn managed_joins_since(&self, since: DateTime<Utc>) -> Result<Vec<JoinRow>> {
        let s = self.lock()?;
        let managed = managed_ids(&s);
        Ok(s.joins
            .iter()
            .filter(|j| j.joined_at >= since && managed.contains(&j.chat_id))
            .copied()
            .collect())
    }

    async fn user_managed_joins_since(
        &self,
        user_id: UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<JoinRow>> {
        let s = self.lock()?;
        let managed = managed_ids(&s);
        let mut out: Vec<_> = s
            .joins
            .iter()
            .filter(|j| {
                j.user_id == user_id && j.joined_at >= since && managed.contains(&j.chat_id)
            })
            .copied()
            .collect();
        out.sort_by_key(|j| j.joined_at);
        Ok(out)
    }

    async fn is_blacklisted(&self, user_id: UserId) -> Result<bool> {
        Ok(self.lock()?.blacklist.contains_key(&user_id))
    }

    async fn blacklisted_among(&self, user_ids: &[UserId]) -> Result<HashSet<UserId>> {
        let s = self.lock()?;
        Ok(user_ids
            .iter()
            .filter(|id| s.blacklist.contains_key(id))
            .copied()
            .collect())
    }

    async fn add_to_blacklist(&self, entry: &BlacklistEntry) -> Result<bool> {
        let mut s = self.lock()?;
        if s.blacklist.contains_key(&entry.user_id) {
            return Ok(false);
        }
        s.blacklist.insert(entry.user_id, entry.clone());
        Ok(true)
    }

    async fn insert_cluster(&self, cluster: &NewCluster, now: DateTime<Utc>) -> Result<i64> {
        let mut s = self.lock()?;
        let id = s.clusters.len() as i64 + 1;
        let mut user_ids = cluster.user_ids.clone();
        user_ids.sort_unstable();
        user_ids.dedup();
        s.clusters.push(ClusterRecord {
            id,
            level: cluster.level,
            created_at: now,
            user_ids,
            group_ids: cluster.group_ids.clone(),
            banned: cluster.banned,
            reason: cluster.reason.clone(),
            source: cluster.source,
        });
        Ok(id)
    }

    async fn log_action(&self, entry: &ActionLogEntry) -> Result<()> {
        self.lock()?.actions.push(entry.clone());
        Ok(())
    }

    async fn successful_actions_since(&self, user_id: UserId, since: DateTime<Utc>) -> Result<u32> {
        Ok(self
            .lock()?
            .actions
            .iter()
            .filter(|a| a.user_id == user_id && a.outcome == "success" && a.at >= since)
            .count() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn duplicate_join_in_same_minute_is_ignored() {
        let st = MemoryStore::new();
        let t = Utc::now();
        let j = JoinRow { user_id: 1, chat_id: -10, joined_at: t };
        assert!(st.record_join(&j).await.unwrap());
        assert!(!st.record_join(&j).await.unwrap());
        let later = JoinRow { joined_at: t + Duration::minutes(2), ..j };
        assert!(st.record_join(&later).await.unwrap());
        assert_eq!(st.count_joins_since(1, t - Duration::hours(1)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn observed_flag_and_risk_level_never_drop() {
        let st = MemoryStore::new();
        let now = Utc::now();
        assert_eq!(st.mark_observed(&[7, 8], now).await.unwrap(), 2);
        assert_eq!(st.mark_observed(&[7], now).await.unwrap(), 0);
        st.raise_risk_level(7, RiskLevel::Medium, now).await.unwrap();

        let mut u = st.user(7).await.unwrap().unwrap();
        u.is_observed = false;
        u.risk_level = RiskLevel::Low;
        st.save_user(&u).await.unwrap();

        let u = st.user(7).await.unwrap().unwrap();
        assert!(u.is_observed);
        assert_eq!(u.risk_level, RiskLevel::Medium);
    }

    #[tokio::test]
    async fn blacklist_insert_is_idempotent() {
        let st = MemoryStore::new();
        let e = BlacklistEntry {
            user_id: 5,
            banned_by: None,
            banned_at: Utc::now(),
            reason: "test".into(),
        };
        assert!(st.add_to_blacklist(&e).await.unwrap());
        assert!(!st.add_to_blacklist(&e).await.unwrap());
        assert_eq!(st.blacklist().len(), 1);
    }

    #[tokio::test]
    async fn managed_joins_filter_out_unmanaged_groups() {
        let st = MemoryStore::new();
        let now = Utc::now();
        st.set_group_status(-1, GroupStatus::Managed).await.unwrap();
        st.upsert_group_seen(-2, Some("other"), now).await.unwrap();
        for chat in [-1, -2] {
            st.record_join(&JoinRow { user_id: 3, chat_id: chat, joined_at: now })
                .await
                .unwrap();
        }
        let rows = st.managed_joins_since(now - Duration::hours(1)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chat_id, -1);
    }
}
