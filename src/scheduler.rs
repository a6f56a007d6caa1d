// src/scheduler.rs
//! Zadania okresowe: sprzątanie dedup/guardrails, decay ryzyka, batch klastrów.
//! Każde zadanie to [`Job`]; `Scheduler` tylko tyka i loguje błędy, więc zadania
//! da się testować wywołując `run()` bezpośrednio.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterDetector;
use crate::dedup::EventDedup;
use crate::guardrails::Guardrails;
use crate::risk::RiskEngine;

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self) -> Result<()>;
}

#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<(Duration, Arc<dyn Job>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pierwsze uruchomienie po jednym okresie, nie od razu.
    pub fn every(mut self, period: Duration, job: Arc<dyn Job>) -> Self {
        self.jobs.push((period, job));
        self
    }

    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        self.jobs
            .into_iter()
            .map(|(period, job)| {
                info!(job = job.name(), period_secs = period.as_secs(), "periodic job scheduled");
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        ticker.tick().await;
                        let started = Instant::now();
                        match AssertUnwindSafe(job.run()).catch_unwind().await {
                            Ok(Ok(())) => debug!(
                                job = job.name(),
                                took_ms = started.elapsed().as_millis() as u64,
                                "job finished"
                            ),
                            Ok(Err(e)) => warn!(job = job.name(), error = ?e, "job failed"),
                            // pętla żyje dalej, następny tick normalnie
                            Err(_) => error!(job = job.name(), "job panicked"),
                        }
                    }
                })
            })
            .collect()
    }
}

/* ==============================
   Zadania
   ============================== */

pub struct SweepJob {
    pub dedup: Arc<EventDedup>,
    pub guardrails: Arc<Guardrails>,
}

#[async_trait]
impl Job for SweepJob {
    fn name(&self) -> &'static str {
        "sweep"
    }

    async fn run(&self) -> Result<()> {
        let fingerprints = self.dedup.sweep();
        let idle = self.guardrails.prune_idle();
        if fingerprints + idle > 0 {
            debug!(fingerprints, idle, "in-memory state swept");
        }
        Ok(())
    }
}

pub struct RiskDecayJob(pub Arc<RiskEngine>);

#[async_trait]
impl Job for RiskDecayJob {
    fn name(&self) -> &'static str {
        "risk_decay"
    }

    async fn run(&self) -> Result<()> {
        self.0.run_decay(Utc::now()).await.map(|_| ())
    }
}

pub struct ClusterBatchJob(pub Arc<ClusterDetector>);

#[async_trait]
impl Job for ClusterBatchJob {
    fn name(&self) -> &'static str {
        "cluster_batch"
    }

    async fn run(&self) -> Result<()> {
        let now = Utc::now();
        self.0.run_batch(now).await?;
        let pruned = self.0.prune_realtime(now).await;
        debug!(pruned, "realtime tracks pruned");
        Ok(())
    }
}
