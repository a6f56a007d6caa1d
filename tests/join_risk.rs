mod common;

use chrono::{Duration, TimeZone, Utc};
use common::{Call, fresh_user, harness, join, regular_user, settings};
use tigris_sentinel::db::Store;
use tigris_sentinel::model::{UserRecord, UserStatus};

#[tokio::test]
async fn duplicate_join_delivery_is_processed_once() {
    let h = harness(settings());
    h.manage([-100]).await;
    let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 10).unwrap();

    let first = h.ctx.pipeline.on_join(join(7, -100, regular_user(), now)).await.unwrap();
    assert!(!first.duplicate);
    assert!(first.assessment.is_some());

    let second = h
        .ctx
        .pipeline
        .on_join(join(7, -100, regular_user(), now + Duration::seconds(2)))
        .await
        .unwrap();
    assert!(second.duplicate);
    assert!(second.assessment.is_none());

    assert_eq!(h.store.joins().len(), 1);
    let u = h.store.user(7).await.unwrap().unwrap();
    assert_eq!(u.risk_score, 5, "only one join scored");
}

#[tokio::test]
async fn bots_are_ignored() {
    let h = harness(settings());
    h.manage([-100]).await;
    let mut info = regular_user();
    info.is_bot = true;

    let r = h.ctx.pipeline.on_join(join(8, -100, info, Utc::now())).await.unwrap();
    assert_eq!(r.ignored, Some("bot"));
    assert!(h.store.joins().is_empty());
}

#[tokio::test]
async fn fresh_account_is_restricted_then_banned_globally() {
    let h = harness(settings());
    h.manage([-1, -2, -3, -4]).await;
    let now = Utc::now();
    let p = &h.ctx.pipeline;

    // 20 + 10 + 10 + 5
    let r = p.on_join(join(42, -1, fresh_user(now), now)).await.unwrap();
    let a = r.assessment.unwrap();
    assert_eq!(a.risk_score, 45);
    assert!(a.reasons.contains(&"young_account".to_string()));
    assert!(a.reasons.contains(&"no_username".to_string()));
    assert!(a.reasons.contains(&"no_profile_photo".to_string()));
    assert_eq!(a.status, UserStatus::Ok);

    // +2*5 +15 → 70
    let r = p
        .on_join(join(42, -2, fresh_user(now), now + Duration::minutes(1)))
        .await
        .unwrap();
    let a = r.assessment.unwrap();
    assert_eq!(a.risk_score, 70);
    assert!(a.should_restrict);
    assert_eq!(a.status, UserStatus::Restricted);
    assert_eq!(h.platform.calls(), vec![Call::Restrict(-2, 42)]);

    // +3*5 +15 → 100
    let r = p
        .on_join(join(42, -3, fresh_user(now), now + Duration::minutes(2)))
        .await
        .unwrap();
    let a = r.assessment.unwrap();
    assert!(a.should_ban);
    assert_eq!(a.status, UserStatus::Banned);
    assert!(r.realtime.is_none(), "banned users are not tracked");
    assert!(h.store.is_blacklisted(42).await.unwrap());
    assert_eq!(h.platform.count(|c| *c == Call::GlobalBan(42)), 1);

    // banned jest stanem końcowym: powrót kończy się banem w czacie
    let r = p
        .on_join(join(42, -4, fresh_user(now), now + Duration::minutes(3)))
        .await
        .unwrap();
    assert!(r.rejoin_ban.as_ref().is_some_and(|res| res.success));
    assert!(r.assessment.is_none());
    assert_eq!(h.platform.count(|c| *c == Call::Ban(-4, 42)), 1);
    assert_eq!(h.store.user(42).await.unwrap().unwrap().status, UserStatus::Banned);
}

#[tokio::test]
async fn restricted_user_is_not_restricted_again() {
    let mut s = settings();
    s.risk.ban_score = 1_000;
    let h = harness(s);
    h.manage([-1, -2, -3]).await;
    let now = Utc::now();
    let p = &h.ctx.pipeline;

    for (i, chat) in [-1, -2, -3].into_iter().enumerate() {
        p.on_join(join(43, chat, fresh_user(now), now + Duration::minutes(i as i64)))
            .await
            .unwrap();
    }

    assert_eq!(h.platform.count(|c| matches!(c, Call::Restrict(..))), 1);
    let u = h.store.user(43).await.unwrap().unwrap();
    assert_eq!(u.status, UserStatus::Restricted);
    assert_eq!(u.risk_score, 100);
}

#[tokio::test]
async fn unmanaged_group_is_scored_for_audit_only() {
    let h = harness(settings());
    let now = Utc::now();

    let r = h.ctx.pipeline.on_join(join(44, -9, fresh_user(now), now)).await.unwrap();
    assert!(!r.managed);
    let a = r.assessment.unwrap();
    assert!(a.reasons.contains(&"unmanaged_group_audit_only".to_string()));
    assert!(h.platform.calls().is_empty());
    assert!(h.store.actions().is_empty());
}

#[tokio::test]
async fn trusted_admin_is_never_scored() {
    let mut s = settings();
    s.trust.admin_ids = vec![1];
    let h = harness(s);
    h.manage([-1]).await;
    let now = Utc::now();

    let r = h.ctx.pipeline.on_join(join(1, -1, fresh_user(now), now)).await.unwrap();
    let a = r.assessment.unwrap();
    assert_eq!(a.risk_score, 0);
    assert_eq!(a.reasons, vec!["exempt:global_admin".to_string()]);
    assert!(h.store.user(1).await.unwrap().is_none());
}

#[tokio::test]
async fn blacklisted_user_is_banned_on_rejoin() {
    let h = harness(settings());
    h.manage([-5]).await;
    let now = Utc::now();
    h.store
        .add_to_blacklist(&tigris_sentinel::model::BlacklistEntry {
            user_id: 66,
            banned_by: None,
            banned_at: now,
            reason: "manual".into(),
        })
        .await
        .unwrap();

    let r = h.ctx.pipeline.on_join(join(66, -5, regular_user(), now)).await.unwrap();
    assert!(r.rejoin_ban.unwrap().success);
    assert_eq!(h.platform.calls(), vec![Call::Ban(-5, 66)]);
    let audit = h.store.actions();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].reason.as_deref(), Some("blacklist_rejoin"));
}

#[tokio::test]
async fn decay_lifts_restriction_below_buffer() {
    let h = harness(settings());
    let now = Utc::now();

    let mut restricted = UserRecord::new(50, now);
    restricted.risk_score = 45;
    restricted.status = UserStatus::Restricted;
    restricted.last_decay_at = Some(now - Duration::hours(25));
    h.store.save_user(&restricted).await.unwrap();

    let mut banned = UserRecord::new(51, now);
    banned.risk_score = 90;
    banned.status = UserStatus::Banned;
    banned.last_decay_at = Some(now - Duration::hours(25));
    h.store.save_user(&banned).await.unwrap();

    // 45 → 40: jeszcze nie poniżej 50 - 10
    let r = h.ctx.risk.run_decay(now).await.unwrap();
    assert_eq!(r.decayed, 1);
    assert_eq!(r.unrestricted, 0);
    let u = h.store.user(50).await.unwrap().unwrap();
    assert_eq!((u.risk_score, u.status), (40, UserStatus::Restricted));

    // ten sam przebieg od razu: interwał nie minął
    let r = h.ctx.risk.run_decay(now + Duration::hours(1)).await.unwrap();
    assert_eq!(r.decayed, 0);

    // 40 → 35 < 40
    let r = h.ctx.risk.run_decay(now + Duration::hours(25)).await.unwrap();
    assert_eq!(r.unrestricted, 1);
    let u = h.store.user(50).await.unwrap().unwrap();
    assert_eq!((u.risk_score, u.status), (35, UserStatus::Ok));
    assert_eq!(h.platform.calls(), vec![Call::Unrestrict(50)]);

    let b = h.store.user(51).await.unwrap().unwrap();
    assert_eq!((b.risk_score, b.status), (90, UserStatus::Banned));
}
