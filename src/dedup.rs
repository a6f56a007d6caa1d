// src/dedup.rs
//! Odsiewanie powtórnie dostarczonych joinów: odcisk (user, chat, minuta) z TTL.
//! Tylko pamięć procesu; baza ma własną unikalność na tym samym kluczu.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::debug;

use crate::config::DedupConfig;
use crate::model::{ChatId, UserId, minute_bucket};

type Fingerprint = (UserId, ChatId, i64);

#[derive(Debug)]
pub struct EventDedup {
    seen: DashMap<Fingerprint, Instant>,
    ttl: Duration,
    sweep_every: Duration,
}

impl EventDedup {
    pub fn new(cfg: &DedupConfig) -> Arc<Self> {
        Arc::new(Self {
            seen: DashMap::new(),
            ttl: Duration::from_secs(cfg.ttl_secs),
            sweep_every: Duration::from_secs(cfg.sweep_secs),
        })
    }

    /// `true`, jeśli ten sam odcisk był już widziany w oknie TTL.
    /// Pierwsze wywołanie rejestruje odcisk i zwraca `false`.
    pub fn is_duplicate(&self, user_id: UserId, chat_id: ChatId, at: DateTime<Utc>) -> bool {
        let key = (user_id, chat_id, minute_bucket(at));
        let now = Instant::now();

        // entry() trzyma blokadę shardu – dwa równoległe wywołania nie wstawią podwójnie
        match self.seen.entry(key) {
            Entry::Occupied(mut e) => {
                if now.duration_since(*e.get()) <= self.ttl {
                    debug!(user_id, chat_id, "duplicate join event dropped");
                    true
                } else {
                    e.insert(now);
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(now);
                false
            }
        }
    }

    /// Usuwa odciski starsze niż TTL; zwraca ile usunięto.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen
            .retain(|_, at| now.duration_since(*at) <= self.ttl);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_every
    }
}
