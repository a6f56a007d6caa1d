// src/groups.rs
//! Rejestr grup: zakładanie przy pierwszym kontakcie (`known`), status `managed`,
//! polityka per grupa (group_config JSONB nałożony na domyślne) z krótkim cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ScamDefaults;
use crate::db::Store;
use crate::model::{ChatId, GroupRecord, GroupStatus};
use crate::scam::ScamPolicy;

const POLICY_TTL: Duration = Duration::from_secs(60);

pub struct GroupRegistry {
    store: Arc<dyn Store>,
    defaults: ScamDefaults,
    policies: Cache<ChatId, Arc<ScamPolicy>>,
}

/// Nakłada klucze z `group_config.scam` na domyślne. Nieznane klucze są ignorowane,
/// błędny typ wartości → domyślna polityka (z ostrzeżeniem).
pub fn merge_policy(defaults: &ScamDefaults, group: Option<&Value>) -> ScamPolicy {
    let Some(Value::Object(overrides)) = group.and_then(|v| v.get("scam")) else {
        return defaults.clone();
    };
    let mut base = match serde_json::to_value(defaults) {
        Ok(Value::Object(m)) => m,
        _ => return defaults.clone(),
    };
    for (k, v) in overrides {
        base.insert(k.clone(), v.clone());
    }
    match serde_json::from_value(Value::Object(base)) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "invalid group scam policy, using defaults");
            defaults.clone()
        }
    }
}

impl GroupRegistry {
    pub fn new(store: Arc<dyn Store>, defaults: ScamDefaults) -> Arc<Self> {
        Arc::new(Self {
            store,
            defaults,
            policies: Cache::builder()
                .time_to_live(POLICY_TTL)
                .max_capacity(10_000)
                .build(),
        })
    }

    /// Pierwszy kontakt zakłada grupę jako `known`; kolejne odświeżają tytuł.
    pub async fn ensure_group(
        &self,
        chat_id: ChatId,
        title: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<GroupRecord> {
        let g = self.store.upsert_group_seen(chat_id, title, now).await?;
        debug!(chat_id, status = g.status.as_str(), "group seen");
        Ok(g)
    }

    pub async fn is_managed(&self, chat_id: ChatId) -> Result<bool> {
        Ok(self
            .store
            .group(chat_id)
            .await?
            .is_some_and(|g| g.is_managed()))
    }

    /// Zmiana statusu (strona administracyjna).
    pub async fn set_status(&self, chat_id: ChatId, status: GroupStatus) -> Result<()> {
        self.store.set_group_status(chat_id, status).await?;
        info!(chat_id, status = status.as_str(), "group status changed");
        Ok(())
    }

    pub async fn scam_policy(&self, chat_id: ChatId) -> Result<Arc<ScamPolicy>> {
        let store = self.store.clone();
        let defaults = self.defaults.clone();
        self.policies
            .try_get_with(chat_id, async move {
                let raw = store.group_policy(chat_id).await?;
                Ok::<_, anyhow::Error>(Arc::new(merge_policy(&defaults, raw.as_ref())))
            })
            .await
            .map_err(|e| anyhow!("group policy load failed: {e}"))
    }

    pub async fn set_policy(&self, chat_id: ChatId, policy: &Value) -> Result<()> {
        self.store.set_group_policy(chat_id, policy).await?;
        self.policies.invalidate(&chat_id).await;
        info!(chat_id, "group policy updated");
        Ok(())
    }
}
