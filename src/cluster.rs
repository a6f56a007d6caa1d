// src/cluster.rs
//! Wykrywanie skoordynowanych kont.
//!
//! Dwa niezależne tryby, wspólna encja Cluster:
//! - batch (co ~10 min): L1 obserwacja (≥3 grupy / 24h), L2 pary (≥3 wspólne grupy / 48h),
//!   L3 trójki (≥4 wspólne grupy) albo obserwowany+zbanowany z partnerem → ban globalny,
//! - real-time (każdy join/wiadomość w zarządzanej grupie): liczba różnych grup w 24h,
//!   progi 3/5/7 → obserwacja / restrict w bieżącym czacie / ban globalny.
//!
//! Idempotencję banu zapewnia blacklist w dispatcherze, nie unikalność wierszy clusters.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::sync::Cache;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::db::Store;
use crate::model::{
    ChatId, ClusterLevel, ClusterSource, JoinRow, NewCluster, UserId, UserStatus,
};
use crate::moderation::{ModerationAction, ModerationDispatcher, Severity};
use crate::permissions::Trust;
use crate::risk::RiskEngine;

/* ==============================
   Batch – czysta detekcja
   ============================== */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCandidate {
    pub level: ClusterLevel,
    /// posortowane
    pub users: Vec<UserId>,
    /// posortowane
    pub groups: Vec<ChatId>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchFindings {
    /// L1 – do oznaczenia jako obserwowani.
    pub observe: Vec<UserId>,
    pub clusters: Vec<ClusterCandidate>,
}

fn groups_by_user(
    joins: &[JoinRow],
    since: DateTime<Utc>,
    trust: &Trust,
) -> HashMap<UserId, BTreeSet<ChatId>> {
    let mut out: HashMap<UserId, BTreeSet<ChatId>> = HashMap::new();
    for j in joins.iter().filter(|j| j.joined_at >= since) {
        if trust.is_exempt(j.user_id) {
            continue;
        }
        out.entry(j.user_id).or_default().insert(j.chat_id);
    }
    out
}

fn shared(a: &BTreeSet<ChatId>, b: &BTreeSet<ChatId>) -> BTreeSet<ChatId> {
    a.intersection(b).copied().collect()
}

/// Czysta funkcja: joiny z zarządzanych grup (≥ now − batch_window) → L1 + klastry L2/L3.
pub fn detect_batch(
    joins: &[JoinRow],
    now: DateTime<Utc>,
    blacklisted: &HashSet<UserId>,
    observed: &HashSet<UserId>,
    trust: &Trust,
    cfg: &ClusterConfig,
) -> BatchFindings {
    let mut findings = BatchFindings::default();

    // L1
    let recent = groups_by_user(joins, now - chrono::Duration::hours(cfg.observe_window_hours), trust);
    let mut observe: Vec<UserId> = recent
        .iter()
        .filter(|(_, g)| g.len() >= cfg.observe_min_groups)
        .map(|(u, _)| *u)
        .collect();
    observe.sort_unstable();

    // kandydaci L2/L3 – ten sam próg co L1, ale w oknie batch
    let window = groups_by_user(joins, now - chrono::Duration::hours(cfg.batch_window_hours), trust);
    let mut cands: Vec<UserId> = window
        .iter()
        .filter(|(_, g)| g.len() >= cfg.observe_min_groups)
        .map(|(u, _)| *u)
        .collect();
    cands.sort_unstable();

    // pary
    let mut pairs: HashMap<(UserId, UserId), BTreeSet<ChatId>> = HashMap::new();
    for (i, a) in cands.iter().enumerate() {
        for b in &cands[i + 1..] {
            let s = shared(&window[a], &window[b]);
            if s.len() >= cfg.pair_shared_groups {
                pairs.insert((*a, *b), s);
            }
        }
    }

    // trójki – łączone po identycznym zbiorze wspólnych grup
    let mut by_groups: HashMap<BTreeSet<ChatId>, BTreeSet<UserId>> = HashMap::new();
    for (i, a) in cands.iter().enumerate() {
        for (j, b) in cands.iter().enumerate().skip(i + 1) {
            let Some(ab) = pairs.get(&(*a, *b)) else { continue };
            if ab.len() < cfg.triple_shared_groups {
                continue;
            }
            for c in &cands[j + 1..] {
                let abc = shared(ab, &window[c]);
                if abc.len() >= cfg.triple_shared_groups {
                    by_groups.entry(abc).or_default().extend([*a, *b, *c]);
                }
            }
        }
    }
    let mut l3: Vec<ClusterCandidate> = by_groups
        .into_iter()
        .map(|(groups, users)| ClusterCandidate {
            level: ClusterLevel::Ban,
            users: users.into_iter().collect(),
            groups: groups.into_iter().collect(),
            reason: format!("shared_groups_triple:{}", cfg.triple_shared_groups),
        })
        .collect();

    // obserwowany + zbanowany z partnerem
    let observed_now: HashSet<UserId> = observed.iter().chain(observe.iter()).copied().collect();
    for u in cands
        .iter()
        .filter(|u| observed_now.contains(*u) && blacklisted.contains(*u))
    {
        let mut users = BTreeSet::from([*u]);
        let mut groups = BTreeSet::new();
        for ((a, b), s) in &pairs {
            let partner = if a == u {
                b
            } else if b == u {
                a
            } else {
                continue;
            };
            users.insert(*partner);
            groups.extend(s.iter().copied());
        }
        if users.len() > 1 {
            l3.push(ClusterCandidate {
                level: ClusterLevel::Ban,
                users: users.into_iter().collect(),
                groups: groups.into_iter().collect(),
                reason: "blacklisted_observed_partner".into(),
            });
        }
    }
    l3.sort_by(|x, y| x.users.cmp(&y.users));
    l3.dedup_by(|x, y| x.users == y.users);

    // L2 – pary, które nie weszły w całości do L3
    let mut l2: Vec<ClusterCandidate> = pairs
        .into_iter()
        .filter(|((a, b), _)| {
            !l3.iter()
                .any(|c| c.users.binary_search(a).is_ok() && c.users.binary_search(b).is_ok())
        })
        .map(|((a, b), s)| ClusterCandidate {
            level: ClusterLevel::Network,
            users: vec![a, b],
            groups: s.into_iter().collect(),
            reason: format!("shared_groups_pair:{}", cfg.pair_shared_groups),
        })
        .collect();
    l2.sort_by(|x, y| x.users.cmp(&y.users));

    findings.observe = observe;
    findings.clusters = l3;
    findings.clusters.extend(l2);
    findings
}

/* ==============================
   Detektor (efekty)
   ============================== */

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub joins: usize,
    pub observed: u64,
    pub l2: usize,
    pub l3: usize,
    pub banned_users: usize,
    pub suppressed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RealtimeOutcome {
    pub level: ClusterLevel,
    pub distinct_groups: usize,
    pub cluster_id: Option<i64>,
    pub banned: bool,
}

#[derive(Debug, Default)]
struct RealtimeTrack {
    last_seen: HashMap<ChatId, DateTime<Utc>>,
    level: Option<ClusterLevel>,
}

pub struct ClusterDetector {
    cfg: ClusterConfig,
    trust: Arc<Trust>,
    store: Arc<dyn Store>,
    dispatcher: Arc<ModerationDispatcher>,
    risk: Arc<RiskEngine>,
    emitted: Cache<(ClusterLevel, Vec<UserId>), ()>,
    tracks: DashMap<UserId, Arc<Mutex<RealtimeTrack>>>,
}

impl ClusterDetector {
    pub fn new(
        cfg: ClusterConfig,
        trust: Arc<Trust>,
        store: Arc<dyn Store>,
        dispatcher: Arc<ModerationDispatcher>,
        risk: Arc<RiskEngine>,
    ) -> Arc<Self> {
        let emitted = Cache::builder()
            .time_to_live(Duration::from_secs(cfg.batch_window_hours.max(1) as u64 * 3600))
            .max_capacity(50_000)
            .build();
        Arc::new(Self {
            cfg,
            trust,
            store,
            dispatcher,
            risk,
            emitted,
            tracks: DashMap::new(),
        })
    }

    /* --------- batch --------- */

    pub async fn run_batch(&self, now: DateTime<Utc>) -> Result<BatchReport> {
        let since = now - chrono::Duration::hours(self.cfg.batch_window_hours);
        let joins = self.store.managed_joins_since(since).await?;
        let mut report = BatchReport {
            joins: joins.len(),
            ..Default::default()
        };

        let users: Vec<UserId> = joins
            .iter()
            .map(|j| j.user_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let blacklisted = self.store.blacklisted_among(&users).await?;
        let observed = self.store.observed_user_ids().await?;

        let findings = detect_batch(&joins, now, &blacklisted, &observed, &self.trust, &self.cfg);

        if !findings.observe.is_empty() {
            report.observed = self.store.mark_observed(&findings.observe, now).await?;
            for u in &findings.observe {
                self.store
                    .raise_risk_level(*u, ClusterLevel::Observe.risk_level(), now)
                    .await?;
            }
        }

        for c in findings.clusters {
            let sig = (c.level, c.users.clone());
            if self.emitted.contains_key(&sig) {
                report.suppressed += 1;
                continue;
            }

            self.store.mark_observed(&c.users, now).await?;
            for u in &c.users {
                self.store.raise_risk_level(*u, c.level.risk_level(), now).await?;
            }

            let banned = match c.level {
                ClusterLevel::Ban => {
                    report.l3 += 1;
                    let (all_ok, n) = self.ban_members(&c.users, &blacklisted, now).await?;
                    report.banned_users += n;
                    all_ok
                }
                _ => {
                    report.l2 += 1;
                    false
                }
            };

            let id = self
                .store
                .insert_cluster(
                    &NewCluster {
                        level: c.level,
                        user_ids: c.users.clone(),
                        group_ids: c.groups.clone(),
                        banned,
                        reason: c.reason.clone(),
                        source: ClusterSource::Batch,
                    },
                    now,
                )
                .await?;
            self.emitted.insert(sig, ());
            warn!(
                cluster_id = id,
                level = c.level.as_i16(),
                users = ?c.users,
                groups = ?c.groups,
                banned,
                reason = %c.reason,
                "cluster detected (batch)"
            );
        }

        info!(
            joins = report.joins,
            observed = report.observed,
            l2 = report.l2,
            l3 = report.l3,
            banned = report.banned_users,
            suppressed = report.suppressed,
            "cluster batch pass done"
        );
        Ok(report)
    }

    /// Ban globalny członków L3. Zwraca (wszyscy zbanowani lub już na blackliście, liczba nowych banów).
    async fn ban_members(
        &self,
        users: &[UserId],
        blacklisted: &HashSet<UserId>,
        now: DateTime<Utc>,
    ) -> Result<(bool, usize)> {
        let mut all_ok = true;
        let mut banned = 0;
        for u in users {
            if !blacklisted.contains(u) {
                let res = self
                    .dispatcher
                    .execute(&ModerationAction::global_ban(None, *u, "cluster_l3"))
                    .await;
                if res.success {
                    banned += 1;
                } else if res.reason.as_deref() != Some("already_blacklisted") {
                    all_ok = false;
                    continue;
                }
            }
            self.risk.escalate_status(*u, UserStatus::Banned, now).await?;
        }
        Ok((all_ok, banned))
    }

    /* --------- real-time --------- */

    /// Aktywność (join lub wiadomość) w zarządzanej grupie.
    /// Emituje tylko przy wejściu na wyższy poziom niż dotąd.
    pub async fn track_activity(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        now: DateTime<Utc>,
    ) -> Result<Option<RealtimeOutcome>> {
        if self.trust.is_exempt(user_id) {
            return Ok(None);
        }

        let existing = self.tracks.get(&user_id).map(|t| t.value().clone());
        let (track, fresh) = match existing {
            Some(t) => (t, false),
            None => (self.tracks.entry(user_id).or_default().value().clone(), true),
        };
        let mut t = track.lock().await;

        let since = now - chrono::Duration::hours(self.cfg.realtime_window_hours);
        if fresh && t.last_seen.is_empty() {
            // rozgrzewka po restarcie
            for j in self.store.user_managed_joins_since(user_id, since).await? {
                let e = t.last_seen.entry(j.chat_id).or_insert(j.joined_at);
                if j.joined_at > *e {
                    *e = j.joined_at;
                }
            }
        }

        t.last_seen.insert(chat_id, now);
        t.last_seen.retain(|_, at| *at >= since);
        let distinct = t.last_seen.len();

        let level = if distinct >= self.cfg.realtime_l3_groups {
            Some(ClusterLevel::Ban)
        } else if distinct >= self.cfg.realtime_l2_groups {
            Some(ClusterLevel::Network)
        } else if distinct >= self.cfg.realtime_l1_groups {
            Some(ClusterLevel::Observe)
        } else {
            None
        };

        let Some(level) = level else {
            return Ok(None);
        };
        if t.level.is_some_and(|prev| prev >= level) {
            debug!(user_id, distinct, "realtime level unchanged");
            return Ok(None);
        }

        let mut groups: Vec<ChatId> = t.last_seen.keys().copied().collect();
        groups.sort_unstable();

        // blokada śladu trzymana do końca: poziom podbijamy dopiero po zapisaniu klastra
        self.store.mark_observed(&[user_id], now).await?;
        self.store
            .raise_risk_level(user_id, level.risk_level(), now)
            .await?;

        let (applied, banned) = match level {
            ClusterLevel::Observe => (true, false),
            ClusterLevel::Network => {
                let action = ModerationAction::in_chat(
                    chat_id,
                    user_id,
                    Severity::Medium,
                    "cluster_realtime_l2",
                )
                .restrict_for(Duration::from_secs(self.cfg.restrict_hours * 3600));
                let res = self.dispatcher.execute(&action).await;
                if res.success {
                    self.risk
                        .escalate_status(user_id, UserStatus::Restricted, now)
                        .await?;
                }
                (res.success, false)
            }
            ClusterLevel::Ban => {
                let res = self
                    .dispatcher
                    .execute(&ModerationAction::global_ban(
                        Some(chat_id),
                        user_id,
                        "cluster_realtime_l3",
                    ))
                    .await;
                let banned = res.success || res.reason.as_deref() == Some("already_blacklisted");
                if banned {
                    self.risk
                        .escalate_status(user_id, UserStatus::Banned, now)
                        .await?;
                }
                (banned, banned)
            }
        };

        if !applied {
            info!(user_id, chat_id, level = level.as_i16(), distinct, "realtime action not applied, retried on next activity");
            return Ok(Some(RealtimeOutcome {
                level,
                distinct_groups: distinct,
                cluster_id: None,
                banned: false,
            }));
        }

        let id = self
            .store
            .insert_cluster(
                &NewCluster {
                    level,
                    user_ids: vec![user_id],
                    group_ids: groups,
                    banned,
                    reason: format!("realtime_distinct_groups:{distinct}"),
                    source: ClusterSource::Realtime,
                },
                now,
            )
            .await?;
        t.level = Some(level);
        drop(t);

        warn!(
            cluster_id = id,
            user_id,
            chat_id,
            level = level.as_i16(),
            distinct,
            banned,
            "cluster detected (realtime)"
        );

        Ok(Some(RealtimeOutcome {
            level,
            distinct_groups: distinct,
            cluster_id: Some(id),
            banned,
        }))
    }

    /// Liczba różnych zarządzanych grup użytkownika w oknie real-time (dla polityki scam).
    pub async fn distinct_groups(&self, user_id: UserId) -> usize {
        let Some(track) = self.tracks.get(&user_id).map(|t| t.value().clone()) else {
            return 0;
        };
        let t = track.lock().await;
        t.last_seen.len()
    }

    /// Usuwa ślady bez aktywności w oknie.
    pub async fn prune_realtime(&self, now: DateTime<Utc>) -> usize {
        let since = now - chrono::Duration::hours(self.cfg.realtime_window_hours);
        let snapshot: Vec<(UserId, Arc<Mutex<RealtimeTrack>>)> = self
            .tracks
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut removed = 0;
        for (user_id, track) in snapshot {
            let mut t = track.lock().await;
            t.last_seen.retain(|_, at| *at >= since);
            if t.last_seen.is_empty() {
                drop(t);
                if self
                    .tracks
                    .remove_if(&user_id, |_, v| Arc::strong_count(v) <= 2)
                    .is_some()
                {
                    removed += 1;
                }
            }
        }
        removed
    }
}
