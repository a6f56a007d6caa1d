mod common;

use std::time::Duration;

use chrono::Utc;
use common::{Call, fresh_user, harness, join, message, settings};
use serde_json::json;
use tigris_sentinel::db::Store;
use tigris_sentinel::guardrails::CooldownKey;
use tigris_sentinel::model::UserStatus;
use tigris_sentinel::moderation::{ModerationAction, Severity};

const SCAM: &str = "URGENT: verify your account now, official support team: bit.ly/xyz";

#[tokio::test]
async fn scam_message_is_deleted_under_group_policy() {
    let h = harness(settings());
    h.manage([-300]).await;
    h.ctx
        .groups
        .set_policy(-300, &json!({"scam": {"threshold": 40}}))
        .await
        .unwrap();

    let r = h
        .ctx
        .pipeline
        .on_message(message(300, -300, 9001, SCAM, Utc::now()))
        .await
        .unwrap();
    let scam = r.scam.unwrap();
    assert!(scam.should_act, "score {} reasons {:?}", scam.score, scam.reasons);
    assert!(r.action.unwrap().success);
    assert_eq!(h.platform.calls(), vec![Call::Delete(-300, 9001)]);
    assert_eq!(h.store.actions()[0].reason.as_deref(), Some("scam:delete"));
}

#[tokio::test]
async fn auto_policy_bans_high_scores_in_chat() {
    let h = harness(settings());
    h.manage([-301]).await;
    h.ctx
        .groups
        .set_policy(-301, &json!({"scam": {"threshold": 40, "action": "auto"}}))
        .await
        .unwrap();

    h.ctx
        .pipeline
        .on_message(message(301, -301, 9002, SCAM, Utc::now()))
        .await
        .unwrap();
    assert_eq!(
        h.platform.calls(),
        vec![Call::Delete(-301, 9002), Call::Ban(-301, 301)]
    );
}

#[tokio::test]
async fn default_threshold_only_scores() {
    let h = harness(settings());
    h.manage([-302]).await;

    let r = h
        .ctx
        .pipeline
        .on_message(message(302, -302, 1, SCAM, Utc::now()))
        .await
        .unwrap();
    let scam = r.scam.unwrap();
    assert!(scam.score >= 45);
    assert!(!scam.should_act);
    assert!(r.action.is_none());
    assert!(h.platform.calls().is_empty());
}

#[tokio::test]
async fn trusted_and_group_admins_are_never_actioned() {
    let mut s = settings();
    s.trust.admin_ids = vec![1];
    let h = harness(s);
    h.manage([-303]).await;
    h.ctx
        .groups
        .set_policy(-303, &json!({"scam": {"threshold": 0, "action": "ban"}}))
        .await
        .unwrap();

    let r = h
        .ctx
        .pipeline
        .on_message(message(1, -303, 1, SCAM, Utc::now()))
        .await
        .unwrap();
    let scam = r.scam.unwrap();
    assert!(scam.exempt);
    assert_eq!(scam.score, 0);
    assert!(r.action.is_none());

    h.platform.make_admin(-303, 2);
    let r = h
        .ctx
        .pipeline
        .on_message(message(2, -303, 2, SCAM, Utc::now()))
        .await
        .unwrap();
    let res = r.action.unwrap();
    assert!(res.skipped);
    assert_eq!(res.reason.as_deref(), Some("protected_group_administrator"));
    assert!(h.platform.calls().is_empty());
}

#[tokio::test]
async fn sixth_action_in_a_minute_cools_the_chat_down() {
    let h = harness(settings());
    let d = &h.ctx.dispatcher;

    for msg in 0..5 {
        let a = ModerationAction::in_chat(-400, 10 + msg as u64, Severity::Soft, "test").with_message(msg);
        assert!(d.execute(&a).await.success);
    }

    let sixth = d
        .execute(&ModerationAction::in_chat(-400, 99, Severity::Soft, "test").with_message(5))
        .await;
    assert_eq!(sixth.reason.as_deref(), Some("rate_limit_group_rate_limit"));

    let seventh = d
        .execute(&ModerationAction::in_chat(-400, 98, Severity::Soft, "test").with_message(6))
        .await;
    assert_eq!(seventh.reason.as_deref(), Some("rate_limit_cooldown"));

    let left = h.ctx.guardrails.cooldown_remaining(CooldownKey::Chat(-400)).unwrap();
    assert!(left > Duration::from_secs(290));

    // inny czat działa dalej
    let other = d
        .execute(&ModerationAction::in_chat(-401, 97, Severity::Soft, "test").with_message(1))
        .await;
    assert!(other.success);
    assert_eq!(h.platform.count(|c| matches!(c, Call::Delete(..))), 6);
}

#[tokio::test]
async fn flood_wait_sets_cooldown_and_skips() {
    let h = harness(settings());
    h.platform.flood_next(Duration::from_secs(12));

    let res = h
        .ctx
        .dispatcher
        .execute(&ModerationAction::in_chat(-500, 5, Severity::Hard, "test"))
        .await;
    assert!(res.skipped);
    assert_eq!(res.reason.as_deref(), Some("flood_wait"));
    let left = h.ctx.guardrails.cooldown_remaining(CooldownKey::Chat(-500)).unwrap();
    assert!(left > Duration::from_secs(15) && left <= Duration::from_secs(17));
}

#[tokio::test]
async fn global_ban_is_idempotent() {
    let h = harness(settings());
    let d = &h.ctx.dispatcher;

    let first = d.execute(&ModerationAction::global_ban(None, 600, "test")).await;
    assert!(first.success);
    let second = d.execute(&ModerationAction::global_ban(None, 600, "test")).await;
    assert_eq!(second.reason.as_deref(), Some("already_blacklisted"));
    assert_eq!(h.platform.calls(), vec![Call::GlobalBan(600)]);
    assert_eq!(h.store.blacklist().len(), 1);
}

#[tokio::test]
async fn panic_mode_blocks_everything_and_is_audited() {
    let mut s = settings();
    s.guardrails.panic_mode = true;
    let h = harness(s);
    h.manage([-1, -2, -3]).await;
    let now = Utc::now();

    for (i, chat) in [-1, -2, -3].into_iter().enumerate() {
        h.ctx
            .pipeline
            .on_join(join(700, chat, fresh_user(now), now + chrono::Duration::minutes(i as i64)))
            .await
            .unwrap();
    }

    assert!(h.platform.calls().is_empty());
    let u = h.store.user(700).await.unwrap().unwrap();
    assert_eq!(u.status, UserStatus::Ok);
    assert!(!h.store.is_blacklisted(700).await.unwrap());

    let audit = h.store.actions();
    assert!(!audit.is_empty());
    assert!(audit
        .iter()
        .all(|a| a.outcome == "skipped" && a.detail.as_deref() == Some("panic_mode")));
}

#[tokio::test]
async fn dry_run_simulates_and_marks_audit() {
    let h = harness(settings());
    h.ctx.guardrails.set_dry_run_override(Some(true));

    let res = h
        .ctx
        .dispatcher
        .execute(&ModerationAction::in_chat(-800, 8, Severity::Medium, "test"))
        .await;
    assert_eq!(res.reason.as_deref(), Some("dry_run"));
    assert!(h.platform.calls().is_empty());
    assert!(h.store.actions()[0].dry_run);

    h.ctx.guardrails.set_dry_run_override(None);
    let res = h
        .ctx
        .dispatcher
        .execute(&ModerationAction::in_chat(-800, 8, Severity::Medium, "test"))
        .await;
    assert!(res.success);
    assert_eq!(h.platform.calls(), vec![Call::Restrict(-800, 8)]);
}
