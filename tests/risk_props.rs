mod common;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use tigris_sentinel::db::Store;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Ujemne wagi nie mogą zepchnąć wyniku poniżej zera.
    #[test]
    fn risk_score_never_goes_negative(
        join_score in -40i32..40,
        multi in -40i32..40,
        chats in prop::collection::vec(-20i64..-1, 1..6),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut s = common::settings();
            s.risk.join_event_score = join_score;
            s.risk.multi_join_bonus = multi;
            s.risk.ban_score = 10_000;
            s.risk.restrict_score = 9_000;
            let h = common::harness(s);
            let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();

            for (i, chat) in chats.iter().enumerate() {
                let at = t0 + Duration::minutes(i as i64);
                let r = h
                    .ctx
                    .pipeline
                    .on_join(common::join(900, *chat, common::regular_user(), at))
                    .await
                    .unwrap();
                if let Some(a) = r.assessment {
                    prop_assert!(a.risk_score >= 0);
                }
            }
            if let Some(u) = h.store.user(900).await.unwrap() {
                prop_assert!(u.risk_score >= 0);
            }
            Ok(())
        })?;
    }
}
