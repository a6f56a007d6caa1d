// src/guardrails.rs
//! Guardrails – bezpieczniki automatu:
//! - okno przesuwne akcji per czat i globalne (1 min),
//! - cooldown czatu po przekroczeniu limitu albo po flood-wait,
//! - ochrona adminów / zespołu / administratorów grupy,
//! - przełączniki panic / dry-run (konfiguracja + nadpisanie w locie).
//!
//! Stan jest lokalny dla procesu; restart go zeruje.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use moka::sync::Cache;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::GuardrailsConfig;
use crate::error::MAX_FLOOD_WAIT;
use crate::model::{ChatId, UserId};
use crate::permissions::Trust;
use crate::platform::Platform;

const WINDOW: Duration = Duration::from_secs(60);

/* ==============================
   Typy publiczne
   ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Delete,
    Restrict,
    Ban,
    GlobalBan,
    Unrestrict,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Delete => "delete",
            ActionKind::Restrict => "restrict",
            ActionKind::Ban => "ban",
            ActionKind::GlobalBan => "global_ban",
            ActionKind::Unrestrict => "unrestrict",
        }
    }
}

/// Powód odmowy limitera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    Cooldown,
    GroupRateLimit,
    GlobalRateLimit,
}

impl Denial {
    pub fn as_str(&self) -> &'static str {
        match self {
            Denial::Cooldown => "cooldown",
            Denial::GroupRateLimit => "group_rate_limit",
            Denial::GlobalRateLimit => "global_rate_limit",
        }
    }
}

/// Klucz cooldownu: konkretny czat albo akcje globalne (ban w całej federacji).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CooldownKey {
    Chat(ChatId),
    Global,
}

impl From<Option<ChatId>> for CooldownKey {
    fn from(chat: Option<ChatId>) -> Self {
        chat.map(CooldownKey::Chat).unwrap_or(CooldownKey::Global)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CooldownView {
    pub chat_id: Option<ChatId>,
    pub remaining_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardrailSnapshot {
    pub panic_mode: bool,
    pub dry_run: bool,
    pub panic_override: Option<bool>,
    pub dry_run_override: Option<bool>,
    pub cooldowns: Vec<CooldownView>,
    pub global_actions_last_minute: usize,
}

/* ==============================
   Nadpisanie w locie (None = z konfiguracji)
   ============================== */

#[derive(Debug, Default)]
struct Override(AtomicU8);

impl Override {
    fn get(&self) -> Option<bool> {
        match self.0.load(Ordering::Acquire) {
            1 => Some(false),
            2 => Some(true),
            _ => None,
        }
    }

    fn set(&self, v: Option<bool>) {
        let raw = match v {
            None => 0,
            Some(false) => 1,
            Some(true) => 2,
        };
        self.0.store(raw, Ordering::Release);
    }
}

/* ==============================
   Guardrails
   ============================== */

pub struct Guardrails {
    cfg: GuardrailsConfig,
    trust: Arc<Trust>,
    platform: Arc<dyn Platform>,
    chat_history: DashMap<ChatId, VecDeque<Instant>>,
    global_history: Mutex<VecDeque<Instant>>,
    cooldowns: DashMap<CooldownKey, Instant>,
    admin_cache: Cache<(ChatId, UserId), Option<String>>,
    panic_override: Override,
    dry_run_override: Override,
}

impl Guardrails {
    pub fn new(cfg: GuardrailsConfig, trust: Arc<Trust>, platform: Arc<dyn Platform>) -> Arc<Self> {
        let admin_cache = Cache::builder()
            .time_to_live(Duration::from_secs(cfg.admin_cache_secs.max(1)))
            .max_capacity(10_000)
            .build();
        Arc::new(Self {
            cfg,
            trust,
            platform,
            chat_history: DashMap::new(),
            global_history: Mutex::new(VecDeque::with_capacity(64)),
            cooldowns: DashMap::new(),
            admin_cache,
            panic_override: Override::default(),
            dry_run_override: Override::default(),
        })
    }

    /* --------- limiter --------- */

    /// Kolejność: cooldown → okno czatu → okno globalne.
    /// Przekroczenie limitu czatu dodatkowo nakłada cooldown.
    pub fn can_perform_action(
        &self,
        chat_id: Option<ChatId>,
        action: ActionKind,
    ) -> Result<(), Denial> {
        let now = Instant::now();
        let key = CooldownKey::from(chat_id);

        if self.cooldown_remaining_at(key, now).is_some() {
            debug!(?chat_id, action = action.as_str(), "action denied: cooldown");
            return Err(Denial::Cooldown);
        }

        if let Some(chat) = chat_id {
            let recent = self
                .chat_history
                .get_mut(&chat)
                .map(|mut q| {
                    prune_older_than(&mut q, WINDOW * 2, now);
                    count_within(&q, WINDOW, now)
                })
                .unwrap_or(0);

            if recent >= self.cfg.max_actions_per_group_per_minute {
                let cd = Duration::from_secs(self.cfg.cooldown_secs);
                self.set_cooldown(key, cd);
                warn!(
                    chat_id = chat,
                    recent,
                    cooldown_secs = cd.as_secs(),
                    "per-chat action limit hit, chat cooled down"
                );
                return Err(Denial::GroupRateLimit);
            }
        }

        let global_recent = {
            let mut q = self.global_history.lock().unwrap_or_else(|e| e.into_inner());
            prune_older_than(&mut q, WINDOW * 2, now);
            count_within(&q, WINDOW, now)
        };
        if global_recent >= self.cfg.max_actions_global_per_minute {
            warn!(?chat_id, global_recent, "global action limit hit");
            return Err(Denial::GlobalRateLimit);
        }

        Ok(())
    }

    /// Wołane tylko po potwierdzonym sukcesie wywołania platformy.
    pub fn record_action(&self, chat_id: Option<ChatId>, action: ActionKind) {
        let now = Instant::now();
        if let Some(chat) = chat_id {
            let mut q = self.chat_history.entry(chat).or_default();
            q.push_back(now);
            prune_older_than(&mut q, WINDOW * 2, now);
        }
        let mut g = self.global_history.lock().unwrap_or_else(|e| e.into_inner());
        g.push_back(now);
        prune_older_than(&mut g, WINDOW * 2, now);
        debug!(?chat_id, action = action.as_str(), "action recorded");
    }

    /* --------- cooldown --------- */

    /// Nigdy nie skraca istniejącego cooldownu.
    pub fn set_cooldown(&self, key: CooldownKey, duration: Duration) {
        let now = Instant::now();
        let until = now
            .checked_add(duration)
            .unwrap_or_else(|| now + MAX_FLOOD_WAIT);
        self.cooldowns
            .entry(key)
            .and_modify(|cur| {
                if until > *cur {
                    *cur = until;
                }
            })
            .or_insert(until);
    }

    pub fn cooldown_remaining(&self, key: CooldownKey) -> Option<Duration> {
        self.cooldown_remaining_at(key, Instant::now())
    }

    fn cooldown_remaining_at(&self, key: CooldownKey, now: Instant) -> Option<Duration> {
        let until = self.cooldowns.get(&key).map(|v| *v)?;
        if until > now {
            Some(until - now)
        } else {
            self.cooldowns.remove_if(&key, |_, v| *v <= now);
            None
        }
    }

    /// Flood-wait od platformy → cooldown `retry_after + bufor`. Zwraca nałożony czas.
    pub fn handle_flood_wait(&self, chat_id: Option<ChatId>, retry_after: Duration) -> Duration {
        let total = retry_after
            .saturating_add(Duration::from_secs(self.cfg.flood_wait_buffer_secs))
            .min(MAX_FLOOD_WAIT);
        self.set_cooldown(CooldownKey::from(chat_id), total);
        warn!(?chat_id, wait_secs = total.as_secs(), "flood wait, cooling down");
        total
    }

    /* --------- ochrona --------- */

    /// `Some(powód)` gdy użytkownika nie wolno ruszać.
    /// Błąd lookupu administratora grupy NIE daje ochrony.
    pub async fn protection(&self, chat_id: Option<ChatId>, user_id: UserId) -> Option<String> {
        if let Some(ex) = self.trust.exemption(user_id) {
            return Some(ex.reason().to_string());
        }
        let chat = chat_id?;

        if let Some(cached) = self.admin_cache.get(&(chat, user_id)) {
            return cached;
        }

        let lookup = self
            .platform
            .is_user_admin_or_creator_in_group(chat, user_id)
            .await;
        if let Some(err) = lookup.error.as_deref() {
            debug!(chat_id = chat, user_id, error = err, "admin lookup failed, not protecting");
            return None;
        }
        let protected = lookup.is_admin.then(|| {
            let status = lookup.status.as_deref().unwrap_or("admin");
            format!("group_{status}")
        });
        self.admin_cache.insert((chat, user_id), protected.clone());
        protected
    }

    /* --------- przełączniki --------- */

    pub fn panic_mode(&self) -> bool {
        self.panic_override.get().unwrap_or(self.cfg.panic_mode)
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run_override.get().unwrap_or(self.cfg.dry_run)
    }

    pub fn set_panic_override(&self, v: Option<bool>) {
        self.panic_override.set(v);
        info!(override_value = ?v, effective = self.panic_mode(), "panic mode override changed");
    }

    pub fn set_dry_run_override(&self, v: Option<bool>) {
        self.dry_run_override.set(v);
        info!(override_value = ?v, effective = self.dry_run(), "dry-run override changed");
    }

    pub fn platform_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.platform_timeout_secs)
    }

    pub fn snapshot(&self) -> GuardrailSnapshot {
        let now = Instant::now();
        let mut cooldowns: Vec<_> = self
            .cooldowns
            .iter()
            .filter(|e| *e.value() > now)
            .map(|e| CooldownView {
                chat_id: match e.key() {
                    CooldownKey::Chat(c) => Some(*c),
                    CooldownKey::Global => None,
                },
                remaining_secs: (*e.value() - now).as_secs(),
            })
            .collect();
        cooldowns.sort_by_key(|c| c.chat_id);

        let global_actions_last_minute = {
            let q = self.global_history.lock().unwrap_or_else(|e| e.into_inner());
            count_within(&q, WINDOW, now)
        };

        GuardrailSnapshot {
            panic_mode: self.panic_mode(),
            dry_run: self.dry_run(),
            panic_override: self.panic_override.get(),
            dry_run_override: self.dry_run_override.get(),
            cooldowns,
            global_actions_last_minute,
        }
    }

    /// Sprząta puste historie i wygasłe cooldowny.
    pub fn prune_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.chat_history.len() + self.cooldowns.len();
        self.chat_history.retain(|_, q| {
            prune_older_than(q, WINDOW * 2, now);
            !q.is_empty()
        });
        self.cooldowns.retain(|_, until| *until > now);
        before.saturating_sub(self.chat_history.len() + self.cooldowns.len())
    }
}

fn prune_older_than(q: &mut VecDeque<Instant>, window: Duration, now: Instant) {
    while let Some(&front) = q.front() {
        if now.duration_since(front) > window {
            q.pop_front();
        } else {
            break;
        }
    }
}

fn count_within(q: &VecDeque<Instant>, window: Duration, now: Instant) -> usize {
    q.iter()
        .rev()
        .take_while(|t| now.duration_since(**t) < window)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::platform::{AdminLookup, GlobalBanOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct AdminOnly {
        admin: Option<UserId>,
        fail: bool,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl Platform for AdminOnly {
        async fn delete_message(&self, _: ChatId, _: i64) -> Result<(), PlatformError> {
            Ok(())
        }
        async fn restrict_user(&self, _: ChatId, _: UserId, _: Duration) -> Result<(), PlatformError> {
            Ok(())
        }
        async fn ban_user(&self, _: ChatId, _: UserId) -> Result<(), PlatformError> {
            Ok(())
        }
        async fn ban_user_globally(&self, _: UserId, _: &str) -> Result<GlobalBanOutcome, PlatformError> {
            Ok(GlobalBanOutcome::default())
        }
        async fn unrestrict_user_in_all_groups(&self, _: UserId, _: &str) -> Result<u32, PlatformError> {
            Ok(0)
        }
        async fn is_user_admin_or_creator_in_group(&self, _: ChatId, user_id: UserId) -> AdminLookup {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return AdminLookup {
                    error: Some("boom".into()),
                    ..Default::default()
                };
            }
            let is_admin = self.admin == Some(user_id);
            AdminLookup {
                is_admin,
                status: is_admin.then(|| "creator".into()),
                error: None,
            }
        }
        async fn get_chat_administrators(&self, _: ChatId) -> Result<Vec<UserId>, PlatformError> {
            Ok(self.admin.into_iter().collect())
        }
    }

    fn guard(platform: AdminOnly) -> (Arc<Guardrails>, Arc<AdminOnly>) {
        let p = Arc::new(platform);
        let g = Guardrails::new(
            GuardrailsConfig::default(),
            Arc::new(Trust::new([1], vec![])),
            p.clone(),
        );
        (g, p)
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_action_trips_group_limit_then_cooldown_holds() {
        let (g, _) = guard(AdminOnly::default());
        let chat = Some(-100);

        for _ in 0..5 {
            assert_eq!(g.can_perform_action(chat, ActionKind::Delete), Ok(()));
            g.record_action(chat, ActionKind::Delete);
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        assert_eq!(
            g.can_perform_action(chat, ActionKind::Delete),
            Err(Denial::GroupRateLimit)
        );

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(g.can_perform_action(chat, ActionKind::Delete), Err(Denial::Cooldown));

        // inne czaty nie są dotknięte
        assert_eq!(g.can_perform_action(Some(-200), ActionKind::Delete), Ok(()));

        tokio::time::advance(Duration::from_secs(241)).await;
        assert_eq!(g.can_perform_action(chat, ActionKind::Delete), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn global_window_spans_chats() {
        let (g, _) = guard(AdminOnly::default());
        for i in 0..20 {
            g.record_action(Some(-(i % 10) - 1), ActionKind::Restrict);
        }
        assert_eq!(
            g.can_perform_action(Some(-500), ActionKind::Restrict),
            Err(Denial::GlobalRateLimit)
        );
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(g.can_perform_action(Some(-500), ActionKind::Restrict), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn flood_wait_adds_buffer_and_never_shortens() {
        let (g, _) = guard(AdminOnly::default());
        let total = g.handle_flood_wait(Some(-1), Duration::from_secs(10));
        assert_eq!(total, Duration::from_secs(15));
        g.set_cooldown(CooldownKey::Chat(-1), Duration::from_secs(1));
        let left = g.cooldown_remaining(CooldownKey::Chat(-1)).unwrap();
        assert_eq!(left, Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn absurd_retry_after_is_capped_not_overflowed() {
        let (g, _) = guard(AdminOnly::default());
        let total = g.handle_flood_wait(Some(-7), Duration::MAX);
        assert_eq!(total, MAX_FLOOD_WAIT);
        assert_eq!(g.can_perform_action(Some(-7), ActionKind::Delete), Err(Denial::Cooldown));

        g.set_cooldown(CooldownKey::Chat(-8), Duration::MAX);
        let left = g.cooldown_remaining(CooldownKey::Chat(-8)).unwrap();
        assert!(left <= MAX_FLOOD_WAIT);
        assert!(left > Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn protection_covers_trusted_and_group_admins_only_on_success() {
        let (g, p) = guard(AdminOnly {
            admin: Some(42),
            ..Default::default()
        });
        assert_eq!(g.protection(Some(-1), 1).await.as_deref(), Some("global_admin"));
        assert_eq!(g.protection(Some(-1), 42).await.as_deref(), Some("group_creator"));
        assert_eq!(g.protection(Some(-1), 43).await, None);
        // drugi raz z cache
        assert_eq!(g.protection(Some(-1), 42).await.as_deref(), Some("group_creator"));
        assert_eq!(p.lookups.load(Ordering::SeqCst), 2);

        let (g, _) = guard(AdminOnly {
            admin: Some(42),
            fail: true,
            ..Default::default()
        });
        assert_eq!(g.protection(Some(-1), 42).await, None);
    }

    #[test]
    fn runtime_override_wins_over_config() {
        let (g, _) = guard(AdminOnly::default());
        assert!(!g.panic_mode());
        g.set_panic_override(Some(true));
        assert!(g.panic_mode());
        g.set_panic_override(None);
        assert!(!g.panic_mode());
        g.set_dry_run_override(Some(true));
        assert!(g.snapshot().dry_run);
    }
}
