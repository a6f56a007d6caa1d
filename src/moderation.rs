// src/moderation.rs
//! Dispatcher moderacji – jedyna droga do akcji niszczących (delete / restrict / ban).
//!
//! Kolejność bezpieczników (pierwsza odmowa kończy):
//!   panic → dry-run → ochrona → limiter → wywołanie platformy.
//! Sukces zamyka pętlę przez `Guardrails::record_action`; flood-wait daje cooldown;
//! każdy wynik trafia do tabeli `actions`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashSet;
use serde::Serialize;
use tracing::{info, warn};

use crate::db::Store;
use crate::error::PlatformError;
use crate::guardrails::{ActionKind, Guardrails};
use crate::model::{ActionLogEntry, BlacklistEntry, ChatId, UserId};
use crate::platform::{Platform, with_timeout};

/* ==============================
   Typy
   ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Usunięcie wiadomości (albo tylko log, gdy jej brak).
    Soft,
    /// Usunięcie + czasowe ograniczenie.
    Medium,
    /// Usunięcie + ban.
    Hard,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Soft => "SOFT",
            Severity::Medium => "MEDIUM",
            Severity::Hard => "HARD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionScope {
    /// Tylko czat, z którego przyszło zdarzenie.
    Chat,
    /// Wszystkie zarządzane grupy + blacklist (tylko HARD).
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationAction {
    pub chat_id: Option<ChatId>,
    pub user_id: UserId,
    pub message_id: Option<i64>,
    pub severity: Severity,
    pub scope: ActionScope,
    pub reason: String,
    /// Dla MEDIUM; brak = `moderation.medium_restrict_hours`.
    pub restrict_for: Option<Duration>,
}

impl ModerationAction {
    pub fn in_chat(chat_id: ChatId, user_id: UserId, severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            chat_id: Some(chat_id),
            user_id,
            message_id: None,
            severity,
            scope: ActionScope::Chat,
            reason: reason.into(),
            restrict_for: None,
        }
    }

    pub fn global_ban(chat_id: Option<ChatId>, user_id: UserId, reason: impl Into<String>) -> Self {
        Self {
            chat_id,
            user_id,
            message_id: None,
            severity: Severity::Hard,
            scope: ActionScope::Global,
            reason: reason.into(),
            restrict_for: None,
        }
    }

    pub fn with_message(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn restrict_for(mut self, d: Duration) -> Self {
        self.restrict_for = Some(d);
        self
    }

    fn kind(&self) -> ActionKind {
        match (self.severity, self.scope) {
            (Severity::Hard, ActionScope::Global) => ActionKind::GlobalBan,
            (Severity::Hard, ActionScope::Chat) => ActionKind::Ban,
            (Severity::Medium, _) => ActionKind::Restrict,
            (Severity::Soft, _) => ActionKind::Delete,
        }
    }

    fn limiter_chat(&self) -> Option<ChatId> {
        match self.scope {
            ActionScope::Chat => self.chat_id,
            ActionScope::Global => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub skipped: bool,
    pub reason: Option<String>,
    pub error: Option<String>,
    pub retry_after: Option<Duration>,
    pub detail: Option<String>,
}

impl ActionResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn outcome(&self) -> &'static str {
        if self.success {
            "success"
        } else if self.skipped {
            "skipped"
        } else {
            "failed"
        }
    }
}

/// HARD: wynik ≥18 u recydywisty / konta aktywnego w wielu grupach, albo ≥25 zawsze.
/// MEDIUM: ≥10. Reszta SOFT.
pub fn determine_severity(
    score: i32,
    _reasons: &[String],
    is_repeated: bool,
    multiple_groups: bool,
) -> Severity {
    if (score >= 18 && (is_repeated || multiple_groups)) || score >= 25 {
        Severity::Hard
    } else if score >= 10 {
        Severity::Medium
    } else {
        Severity::Soft
    }
}

/* ==============================
   Dispatcher
   ============================== */

pub struct ModerationDispatcher {
    store: Arc<dyn Store>,
    platform: Arc<dyn Platform>,
    guardrails: Arc<Guardrails>,
    default_restrict: Duration,
    global_in_flight: DashSet<UserId>,
}

/// Zwalnia wpis "ban w toku" przy każdym wyjściu.
struct InFlight<'a> {
    set: &'a DashSet<UserId>,
    user_id: UserId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.user_id);
    }
}

impl ModerationDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        platform: Arc<dyn Platform>,
        guardrails: Arc<Guardrails>,
        medium_restrict_hours: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            platform,
            guardrails,
            default_restrict: Duration::from_secs(medium_restrict_hours * 3600),
            global_in_flight: DashSet::new(),
        })
    }

    pub fn guardrails(&self) -> &Arc<Guardrails> {
        &self.guardrails
    }

    pub async fn execute(&self, action: &ModerationAction) -> ActionResult {
        let res = self.run_checks_and_perform(action).await;
        self.audit(action, &res).await;
        res
    }

    async fn run_checks_and_perform(&self, a: &ModerationAction) -> ActionResult {
        let kind = a.kind();

        // 1) panic
        if self.guardrails.panic_mode() {
            warn!(
                user_id = a.user_id,
                chat_id = ?a.chat_id,
                severity = a.severity.as_str(),
                reason = %a.reason,
                "panic mode: action not executed"
            );
            return ActionResult::skipped("panic_mode");
        }

        // 2) dry-run
        if self.guardrails.dry_run() {
            info!(
                user_id = a.user_id,
                chat_id = ?a.chat_id,
                action = kind.as_str(),
                severity = a.severity.as_str(),
                reason = %a.reason,
                "dry-run: simulated action"
            );
            return ActionResult::skipped("dry_run");
        }

        // 3) ochrona
        if let Some(why) = self.guardrails.protection(a.chat_id, a.user_id).await {
            info!(user_id = a.user_id, chat_id = ?a.chat_id, protected = %why, "action skipped: protected user");
            return ActionResult::skipped(format!("protected_{why}"));
        }

        // 4) limiter
        let limiter_chat = a.limiter_chat();
        if let Err(denial) = self.guardrails.can_perform_action(limiter_chat, kind) {
            info!(user_id = a.user_id, chat_id = ?a.chat_id, denial = denial.as_str(), "action skipped: rate limited");
            return ActionResult::skipped(format!("rate_limit_{}", denial.as_str()));
        }

        // 5) platforma
        let performed = match (a.severity, a.scope) {
            (Severity::Hard, ActionScope::Global) => return self.perform_global_ban(a).await,
            (Severity::Soft, _) => match (a.chat_id, a.message_id) {
                (Some(chat), Some(msg)) => self.call(self.platform.delete_message(chat, msg)).await,
                _ => {
                    info!(user_id = a.user_id, reason = %a.reason, "soft action without message: log only");
                    return ActionResult::ok().with_detail("log_only");
                }
            },
            (Severity::Medium, ActionScope::Chat) => {
                let Some(chat) = a.chat_id else {
                    return ActionResult::failed("missing_chat");
                };
                self.best_effort_delete(chat, a.message_id).await;
                let d = a.restrict_for.unwrap_or(self.default_restrict);
                self.call(self.platform.restrict_user(chat, a.user_id, d)).await
            }
            (Severity::Medium, ActionScope::Global) => {
                return ActionResult::failed("global_scope_requires_hard");
            }
            (Severity::Hard, ActionScope::Chat) => {
                let Some(chat) = a.chat_id else {
                    return ActionResult::failed("missing_chat");
                };
                self.best_effort_delete(chat, a.message_id).await;
                self.call(self.platform.ban_user(chat, a.user_id)).await
            }
        };

        match performed {
            Ok(()) => {
                self.guardrails.record_action(limiter_chat, kind);
                info!(
                    user_id = a.user_id,
                    chat_id = ?a.chat_id,
                    action = kind.as_str(),
                    reason = %a.reason,
                    "moderation action executed"
                );
                ActionResult::ok()
            }
            Err(e) => self.platform_failure(limiter_chat, a, e),
        }
    }

    async fn perform_global_ban(&self, a: &ModerationAction) -> ActionResult {
        match self.store.is_blacklisted(a.user_id).await {
            Ok(true) => return ActionResult::skipped("already_blacklisted"),
            Ok(false) => {}
            Err(e) => {
                warn!(user_id = a.user_id, error = ?e, "blacklist check failed");
                return ActionResult::failed(format!("store: {e}"));
            }
        }
        if !self.global_in_flight.insert(a.user_id) {
            return ActionResult::skipped("ban_in_flight");
        }
        let _guard = InFlight {
            set: &self.global_in_flight,
            user_id: a.user_id,
        };

        if let Some(chat) = a.chat_id {
            self.best_effort_delete(chat, a.message_id).await;
        }

        let outcome = match self
            .call(self.platform.ban_user_globally(a.user_id, &a.reason))
            .await
        {
            Ok(o) => o,
            Err(e) => return self.platform_failure(None, a, e),
        };

        if outcome.skipped {
            let why = outcome.skip_reason.unwrap_or_else(|| "platform_skipped".into());
            info!(user_id = a.user_id, reason = %why, "global ban skipped by platform");
            return ActionResult::skipped(why);
        }
        if !outcome.success {
            return ActionResult::failed("global_ban_failed");
        }

        let entry = BlacklistEntry {
            user_id: a.user_id,
            banned_by: None,
            banned_at: Utc::now(),
            reason: a.reason.clone(),
        };
        if let Err(e) = self.store.add_to_blacklist(&entry).await {
            warn!(user_id = a.user_id, error = ?e, "blacklist insert failed after global ban");
        }
        self.guardrails.record_action(None, ActionKind::GlobalBan);
        info!(user_id = a.user_id, groups = outcome.groups, reason = %a.reason, "global ban executed");
        ActionResult::ok().with_detail(format!("groups={}", outcome.groups))
    }

    /// Zdjęcie ograniczeń we wszystkich grupach (decay). Honoruje tylko dry-run.
    pub async fn lift_restrictions(&self, user_id: UserId, reason: &str) -> ActionResult {
        let res = if self.guardrails.dry_run() {
            info!(user_id, reason, "dry-run: simulated unrestrict");
            ActionResult::skipped("dry_run")
        } else {
            match self
                .call(self.platform.unrestrict_user_in_all_groups(user_id, reason))
                .await
            {
                Ok(n) => {
                    info!(user_id, groups = n, reason, "restrictions lifted");
                    ActionResult::ok().with_detail(format!("groups={n}"))
                }
                Err(PlatformError::FloodWait { retry_after }) => {
                    let wait = self.guardrails.handle_flood_wait(None, retry_after);
                    ActionResult {
                        retry_after: Some(wait),
                        ..ActionResult::skipped("flood_wait")
                    }
                }
                Err(e) => {
                    warn!(user_id, error = %e, "unrestrict failed");
                    ActionResult::failed(e.to_string())
                }
            }
        };

        let entry = ActionLogEntry {
            at: Utc::now(),
            chat_id: None,
            user_id,
            action: ActionKind::Unrestrict.as_str().into(),
            severity: None,
            outcome: res.outcome().into(),
            reason: Some(reason.to_string()),
            detail: res.reason.clone().or_else(|| res.error.clone()).or_else(|| res.detail.clone()),
            dry_run: self.guardrails.dry_run(),
        };
        if let Err(e) = self.store.log_action(&entry).await {
            warn!(user_id, error = ?e, "audit write failed");
        }
        res
    }

    /* --------- pomocnicze --------- */

    async fn call<T, F>(&self, fut: F) -> Result<T, PlatformError>
    where
        F: std::future::Future<Output = Result<T, PlatformError>>,
    {
        with_timeout(self.guardrails.platform_timeout(), fut).await
    }

    async fn best_effort_delete(&self, chat_id: ChatId, message_id: Option<i64>) {
        let Some(msg) = message_id else { return };
        if let Err(e) = self.call(self.platform.delete_message(chat_id, msg)).await {
            if let Some(wait) = e.retry_after() {
                self.guardrails.handle_flood_wait(Some(chat_id), wait);
            }
            warn!(chat_id, message_id = msg, error = %e, "message delete failed");
        }
    }

    fn platform_failure(
        &self,
        limiter_chat: Option<ChatId>,
        a: &ModerationAction,
        e: PlatformError,
    ) -> ActionResult {
        match e {
            PlatformError::FloodWait { retry_after } => {
                let wait = self.guardrails.handle_flood_wait(limiter_chat, retry_after);
                ActionResult {
                    retry_after: Some(wait),
                    ..ActionResult::skipped("flood_wait")
                }
            }
            other => {
                warn!(
                    user_id = a.user_id,
                    chat_id = ?a.chat_id,
                    severity = a.severity.as_str(),
                    error = %other,
                    "moderation action failed"
                );
                ActionResult::failed(other.to_string())
            }
        }
    }

    async fn audit(&self, a: &ModerationAction, res: &ActionResult) {
        let entry = ActionLogEntry {
            at: Utc::now(),
            chat_id: a.chat_id,
            user_id: a.user_id,
            action: a.kind().as_str().into(),
            severity: Some(a.severity.as_str().into()),
            outcome: res.outcome().into(),
            reason: Some(a.reason.clone()),
            detail: res
                .reason
                .clone()
                .or_else(|| res.error.clone())
                .or_else(|| res.detail.clone()),
            dry_run: res.reason.as_deref() == Some("dry_run"),
        };
        if let Err(e) = self.store.log_action(&entry).await {
            warn!(user_id = a.user_id, error = ?e, "audit write failed");
        }
    }
}
