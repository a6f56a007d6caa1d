// src/risk.rs
//! Risk engine – punktacja użytkownika przy joinach, maszyna stanów ok/restricted/banned
//! i okresowy decay z automatycznym zdjęciem ograniczeń.
//!
//! Odczyt → wyliczenie → zapis jest serializowany per użytkownik (mutex w procesie),
//! żeby dwa równoległe joiny nie zgubiły przyrostu.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::db::Store;
use crate::model::{ChatId, RiskLevel, UserId, UserInfo, UserRecord, UserStatus};
use crate::moderation::{ActionResult, ModerationAction, ModerationDispatcher, Severity};
use crate::permissions::Trust;

/// 2015-01-01 UTC w ms – epoka identyfikatorów snowflake.
const SNOWFLAKE_EPOCH_MS: i64 = 1_420_070_400_000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Assessment {
    pub risk_score: i32,
    pub should_restrict: bool,
    pub should_ban: bool,
    pub status: UserStatus,
    pub reasons: Vec<String>,
    #[serde(skip)]
    pub action: Option<ActionResult>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecayReport {
    pub scanned: usize,
    pub decayed: usize,
    pub unrestricted: usize,
}

pub struct RiskEngine {
    cfg: RiskConfig,
    trust: Arc<Trust>,
    store: Arc<dyn Store>,
    dispatcher: Arc<ModerationDispatcher>,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

/// Przybliżony czas założenia konta z identyfikatora snowflake.
pub fn account_created_from_id(user_id: UserId) -> Option<DateTime<Utc>> {
    let ts_ms = (user_id >> 22) as i64 + SNOWFLAKE_EPOCH_MS;
    Utc.timestamp_millis_opt(ts_ms).single()
}

impl RiskEngine {
    pub fn new(
        cfg: RiskConfig,
        trust: Arc<Trust>,
        store: Arc<dyn Store>,
        dispatcher: Arc<ModerationDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            trust,
            store,
            dispatcher,
            locks: DashMap::new(),
        })
    }

    fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.locks.entry(user_id).or_default().clone()
    }

    /// Ocena po joinie. Join musi być już zapisany (liczymy joiny z ostatniej godziny).
    /// `managed = false` → tylko punktacja do audytu, bez akcji i bez zmiany statusu.
    pub async fn assess_join_risk(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        info: &UserInfo,
        managed: bool,
        now: DateTime<Utc>,
    ) -> Result<Assessment> {
        if let Some(ex) = self.trust.exemption(user_id) {
            debug!(user_id, chat_id, exempt = ex.reason(), "risk skipped: trusted actor");
            return Ok(Assessment {
                reasons: vec![format!("exempt:{}", ex.reason())],
                ..Default::default()
            });
        }

        let lock = self.user_lock(user_id);
        let _held = lock.lock().await;

        let mut user = self
            .store
            .user(user_id)
            .await?
            .unwrap_or_else(|| UserRecord::new(user_id, now));
        let mut reasons = Vec::new();
        let mut delta = 0;

        // czynniki jednorazowe
        if !user.profile_captured {
            let created = info
                .account_created_at
                .or_else(|| account_created_from_id(user_id));
            user.account_created_at = created;
            if let Some(created) = created {
                if now - created < chrono::Duration::days(self.cfg.account_age_days) {
                    delta += self.cfg.account_age_bonus;
                    reasons.push("young_account".to_string());
                }
            }
            user.has_username = info.username.as_deref().is_some_and(|u| !u.trim().is_empty());
            if !user.has_username {
                delta += self.cfg.no_username_bonus;
                reasons.push("no_username".to_string());
            }
            user.has_profile_photo = info.has_profile_photo.unwrap_or(false);
            if !user.has_profile_photo {
                delta += self.cfg.no_photo_bonus;
                reasons.push("no_profile_photo".to_string());
            }
            user.profile_captured = true;
        }

        // joiny z ostatniej godziny
        let joins = self
            .store
            .count_joins_since(user_id, now - chrono::Duration::hours(1))
            .await?;
        if joins > 0 {
            delta += self.cfg.join_event_score * joins as i32;
            reasons.push(format!("joins_last_hour:{joins}"));
        }
        if joins > 1 {
            delta += self.cfg.multi_join_bonus;
            reasons.push("multi_join".to_string());
        }

        let prev = user.risk_score;
        user.risk_score = (prev + delta).max(0);
        if user.risk_score > 0 {
            user.risk_level = user.risk_level.max(RiskLevel::Low);
        }
        if user.last_decay_at.is_none() {
            user.last_decay_at = Some(now);
        }
        user.updated_at = now;

        let mut out = Assessment {
            risk_score: user.risk_score,
            status: user.status,
            ..Default::default()
        };

        if user.status == UserStatus::Banned {
            reasons.push("status_banned".to_string());
        } else if user.risk_score >= self.cfg.ban_score {
            out.should_ban = true;
            if managed {
                let action = ModerationAction::global_ban(Some(chat_id), user_id, "risk_score_ban");
                let res = self.dispatcher.execute(&action).await;
                if res.success || res.reason.as_deref() == Some("already_blacklisted") {
                    user.status = UserStatus::Banned;
                    user.risk_level = user.risk_level.max(RiskLevel::High);
                }
                out.action = Some(res);
            }
        } else if user.risk_score >= self.cfg.restrict_score {
            if user.status == UserStatus::Restricted {
                info!(user_id, chat_id, score = user.risk_score, "already restricted, no new action");
                reasons.push("already_restricted".to_string());
            } else {
                out.should_restrict = true;
                if managed {
                    let action = ModerationAction::in_chat(
                        chat_id,
                        user_id,
                        Severity::Medium,
                        "risk_score_restrict",
                    )
                    .restrict_for(Duration::from_secs(self.cfg.restrict_hours * 3600));
                    let res = self.dispatcher.execute(&action).await;
                    if res.success {
                        user.status = UserStatus::Restricted;
                        user.risk_level = user.risk_level.max(RiskLevel::Medium);
                    }
                    out.action = Some(res);
                }
            }
        }

        if !managed {
            reasons.push("unmanaged_group_audit_only".to_string());
        }

        self.store.save_user(&user).await?;

        info!(
            user_id,
            chat_id,
            prev_score = prev,
            score = user.risk_score,
            status = user.status.as_str(),
            reasons = ?reasons,
            "join risk assessed"
        );

        out.status = user.status;
        out.reasons = reasons;
        Ok(out)
    }

    /// Podbija status po akcji spoza oceny joinu (klastry). Nigdy nie obniża:
    /// `banned` zostaje `banned`, `ok → restricted`, każdy → `banned`.
    pub async fn escalate_status(
        &self,
        user_id: UserId,
        status: UserStatus,
        now: DateTime<Utc>,
    ) -> Result<UserStatus> {
        let lock = self.user_lock(user_id);
        let _held = lock.lock().await;

        let mut user = self
            .store
            .user(user_id)
            .await?
            .unwrap_or_else(|| UserRecord::new(user_id, now));
        let next = match (user.status, status) {
            (UserStatus::Banned, _) | (_, UserStatus::Banned) => UserStatus::Banned,
            (UserStatus::Restricted, _) | (_, UserStatus::Restricted) => UserStatus::Restricted,
            _ => UserStatus::Ok,
        };
        if next == user.status {
            return Ok(next);
        }
        user.status = next;
        user.risk_level = user.risk_level.max(match next {
            UserStatus::Banned => RiskLevel::High,
            UserStatus::Restricted => RiskLevel::Medium,
            UserStatus::Ok => RiskLevel::Clean,
        });
        user.updated_at = now;
        self.store.save_user(&user).await?;
        info!(user_id, status = next.as_str(), "user status escalated");
        Ok(next)
    }

    /// Jeden przebieg decay. Pomija adminów/zespół i zbanowanych.
    pub async fn run_decay(&self, now: DateTime<Utc>) -> Result<DecayReport> {
        let mut report = DecayReport::default();
        let interval = chrono::Duration::hours(self.cfg.decay_interval_hours);
        let candidates = self.store.users_with_positive_score().await?;

        for cand in candidates {
            report.scanned += 1;
            if self.trust.is_exempt(cand.id) || cand.status == UserStatus::Banned {
                continue;
            }

            let lock = self.user_lock(cand.id);
            let _held = lock.lock().await;

            // świeży odczyt pod blokadą
            let Some(mut user) = self.store.user(cand.id).await? else {
                continue;
            };
            let due = user.last_decay_at.is_none_or(|t| now - t >= interval);
            if !due || user.risk_score <= 0 || user.status == UserStatus::Banned {
                continue;
            }

            let before = user.risk_score;
            user.risk_score = (before - self.cfg.decay_amount).max(0);
            user.last_decay_at = Some(now);
            user.updated_at = now;
            report.decayed += 1;

            let floor = self.cfg.restrict_score - self.cfg.unrestrict_buffer;
            if user.status == UserStatus::Restricted && user.risk_score < floor {
                let res = self
                    .dispatcher
                    .lift_restrictions(user.id, "risk_decay")
                    .await;
                if res.success {
                    user.status = UserStatus::Ok;
                    report.unrestricted += 1;
                } else {
                    warn!(user_id = user.id, result = ?res, "auto-unrestrict not applied");
                }
            }

            self.store.save_user(&user).await?;
            debug!(user_id = user.id, before, after = user.risk_score, "risk decayed");
        }

        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
        info!(
            scanned = report.scanned,
            decayed = report.decayed,
            unrestricted = report.unrestricted,
            "risk decay pass done"
        );
        Ok(report)
    }
}
