// src/pipeline.rs
//! Granica obsługi zdarzeń: join / wiadomość → dedup → ryzyko / scam → klastry → dispatcher.
//! Błędy infrastruktury i panik są łapane tutaj i tylko logowane; pętla zdarzeń żyje dalej.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::cluster::{ClusterDetector, RealtimeOutcome};
use crate::db::Store;
use crate::dedup::EventDedup;
use crate::groups::GroupRegistry;
use crate::model::{JoinEvent, JoinRow, MessageEvent, UserStatus};
use crate::moderation::{ActionResult, ActionScope, ModerationAction, ModerationDispatcher, Severity};
use crate::permissions::Trust;
use crate::risk::{Assessment, RiskEngine};
use crate::scam::{ScamContext, ScamEngine, ScamResult};

/// Okno, w którym wcześniejsza udana akcja czyni użytkownika recydywistą.
const REPEAT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Default, Serialize)]
pub struct JoinReport {
    pub ignored: Option<&'static str>,
    pub duplicate: bool,
    pub managed: bool,
    pub rejoin_ban: Option<ActionResult>,
    pub assessment: Option<Assessment>,
    pub realtime: Option<RealtimeOutcome>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageReport {
    pub managed: bool,
    pub realtime: Option<RealtimeOutcome>,
    pub scam: Option<ScamResult>,
    pub action: Option<ActionResult>,
}

pub struct Pipeline {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) trust: Arc<Trust>,
    pub(crate) dedup: Arc<EventDedup>,
    pub(crate) groups: Arc<GroupRegistry>,
    pub(crate) risk: Arc<RiskEngine>,
    pub(crate) scam: Arc<ScamEngine>,
    pub(crate) cluster: Arc<ClusterDetector>,
    pub(crate) dispatcher: Arc<ModerationDispatcher>,
}

impl Pipeline {
    /* --------- granica --------- */

    pub async fn on_join(&self, ev: JoinEvent) -> Option<JoinReport> {
        let (user_id, chat_id) = (ev.user_id, ev.chat_id);
        match AssertUnwindSafe(self.handle_join(&ev)).catch_unwind().await {
            Ok(Ok(r)) => Some(r),
            Ok(Err(e)) => {
                error!(user_id, chat_id, error = ?e, "join handling failed");
                None
            }
            Err(_) => {
                error!(user_id, chat_id, "join handler panicked");
                None
            }
        }
    }

    pub async fn on_message(&self, ev: MessageEvent) -> Option<MessageReport> {
        let (user_id, chat_id) = (ev.user_id, ev.chat_id);
        match AssertUnwindSafe(self.handle_message(&ev)).catch_unwind().await {
            Ok(Ok(r)) => Some(r),
            Ok(Err(e)) => {
                error!(user_id, chat_id, error = ?e, "message handling failed");
                None
            }
            Err(_) => {
                error!(user_id, chat_id, "message handler panicked");
                None
            }
        }
    }

    /* --------- join --------- */

    pub async fn handle_join(&self, ev: &JoinEvent) -> Result<JoinReport> {
        let mut report = JoinReport::default();

        if ev.user_info.is_bot {
            info!(user_id = ev.user_id, chat_id = ev.chat_id, "join ignored: bot account");
            report.ignored = Some("bot");
            return Ok(report);
        }

        if self.dedup.is_duplicate(ev.user_id, ev.chat_id, ev.timestamp) {
            info!(user_id = ev.user_id, chat_id = ev.chat_id, source = %ev.source, "join dropped: duplicate delivery");
            report.duplicate = true;
            return Ok(report);
        }

        let group = self
            .groups
            .ensure_group(ev.chat_id, ev.chat_title.as_deref(), ev.timestamp)
            .await?;
        report.managed = group.is_managed();

        let row = JoinRow {
            user_id: ev.user_id,
            chat_id: ev.chat_id,
            joined_at: ev.timestamp,
        };
        if !self.store.record_join(&row).await? {
            info!(user_id = ev.user_id, chat_id = ev.chat_id, "join dropped: already stored for this minute");
            report.duplicate = true;
            return Ok(report);
        }

        if report.managed
            && !self.trust.is_exempt(ev.user_id)
            && self.store.is_blacklisted(ev.user_id).await?
        {
            let action =
                ModerationAction::in_chat(ev.chat_id, ev.user_id, Severity::Hard, "blacklist_rejoin");
            let res = self.dispatcher.execute(&action).await;
            info!(user_id = ev.user_id, chat_id = ev.chat_id, result = ?res, "blacklisted user rejoined");
            report.rejoin_ban = Some(res);
            return Ok(report);
        }

        let assessment = self
            .risk
            .assess_join_risk(ev.user_id, ev.chat_id, &ev.user_info, report.managed, ev.timestamp)
            .await?;
        let banned = assessment.status == UserStatus::Banned;
        report.assessment = Some(assessment);

        if report.managed && !banned {
            report.realtime = self
                .cluster
                .track_activity(ev.user_id, ev.chat_id, ev.timestamp)
                .await?;
        }
        Ok(report)
    }

    /* --------- wiadomość --------- */

    pub async fn handle_message(&self, ev: &MessageEvent) -> Result<MessageReport> {
        let mut report = MessageReport::default();

        let group = self
            .groups
            .ensure_group(ev.chat_id, ev.chat_title.as_deref(), ev.timestamp)
            .await?;
        if !group.is_managed() {
            debug!(chat_id = ev.chat_id, user_id = ev.user_id, "message in unmanaged group, skipped");
            return Ok(report);
        }
        report.managed = true;

        report.realtime = self
            .cluster
            .track_activity(ev.user_id, ev.chat_id, ev.timestamp)
            .await?;

        let policy = self.groups.scam_policy(ev.chat_id).await?;
        if !policy.enabled {
            debug!(chat_id = ev.chat_id, "scam detection disabled for group");
            return Ok(report);
        }

        let urls = ev.urls();
        let mentions = ev.mentions();
        let result = self.scam.evaluate(&ScamContext {
            user_id: ev.user_id,
            chat_id: ev.chat_id,
            text: ev.body(),
            entity_urls: &urls,
            mentions: &mentions,
            reply_to_user_id: ev.reply_to_user_id,
            policy: &policy,
        });

        info!(
            chat_id = ev.chat_id,
            user_id = ev.user_id,
            message_id = ev.message_id,
            score = result.score,
            severity = ?result.severity,
            should_act = result.should_act,
            reasons = ?result.reasons,
            "message scored"
        );

        if result.should_act {
            let user = self.store.user(ev.user_id).await?;
            let since = ev.timestamp - chrono::Duration::days(REPEAT_WINDOW_DAYS);
            let is_repeated = user.as_ref().is_some_and(|u| u.status != UserStatus::Ok)
                || self.store.successful_actions_since(ev.user_id, since).await? > 0;
            let multiple_groups = user.as_ref().is_some_and(|u| u.is_observed)
                || self.cluster.distinct_groups(ev.user_id).await >= 2;

            let severity =
                policy
                    .action
                    .severity(result.score, &result.reasons, is_repeated, multiple_groups);
            let action = ModerationAction {
                chat_id: Some(ev.chat_id),
                user_id: ev.user_id,
                message_id: Some(ev.message_id),
                severity,
                scope: ActionScope::Chat,
                reason: format!("scam:{}", policy.action.as_str()),
                restrict_for: None,
            };
            report.action = Some(self.dispatcher.execute(&action).await);
        }

        report.scam = Some(result);
        Ok(report)
    }
}
