// src/lib.rs

pub mod cluster;
pub mod config;
pub mod control;
pub mod db;
pub mod dedup;
pub mod discord;
pub mod error;
pub mod groups;
pub mod guardrails;
pub mod logging;
pub mod model;
pub mod moderation;
pub mod permissions;
pub mod pipeline;
pub mod platform;
pub mod risk;
pub mod scam;
pub mod scheduler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serenity::all::Http;
use tokio::task::JoinHandle;

use config::Settings;
use db::Store;
use discord::DiscordPlatform;
use platform::Platform;

/// Globalny kontekst aplikacji: konfiguracja, magazyn i wszystkie serwisy,
/// połączone raz przy starcie.
pub struct AppContext {
    pub settings: Settings,
    pub store: Arc<dyn Store>,
    pub platform: Arc<dyn Platform>,
    pub trust: Arc<permissions::Trust>,
    pub guardrails: Arc<guardrails::Guardrails>,
    pub dispatcher: Arc<moderation::ModerationDispatcher>,
    pub dedup: Arc<dedup::EventDedup>,
    pub groups: Arc<groups::GroupRegistry>,
    pub risk: Arc<risk::RiskEngine>,
    pub scam: Arc<scam::ScamEngine>,
    pub cluster: Arc<cluster::ClusterDetector>,
    pub pipeline: Arc<pipeline::Pipeline>,
    discord: Option<Arc<DiscordPlatform>>,
}

impl AppContext {
    /// Składa serwisy na gotowym magazynie i platformie (testy, inne adaptery).
    pub fn assemble(settings: Settings, store: Arc<dyn Store>, platform: Arc<dyn Platform>) -> Arc<Self> {
        Self::wire(settings, store, platform, None)
    }

    /// Bootstrap całej aplikacji:
    /// - logi
    /// - magazyn (Postgres + migracje albo memory://)
    /// - platforma Discord i serwisy
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        // 1) logi
        logging::init(&settings);

        // 2) DB
        let store = db::open(&settings.database).await?;

        // 3) platforma
        let http = Arc::new(Http::new(&settings.discord.token));
        let discord = DiscordPlatform::new(http, store.clone());
        let platform: Arc<dyn Platform> = discord.clone();

        Ok(Self::wire(settings, store, platform, Some(discord)))
    }

    fn wire(
        settings: Settings,
        store: Arc<dyn Store>,
        platform: Arc<dyn Platform>,
        discord: Option<Arc<DiscordPlatform>>,
    ) -> Arc<Self> {
        let trust = Arc::new(permissions::Trust::from_config(&settings.trust));
        let guardrails =
            guardrails::Guardrails::new(settings.guardrails.clone(), trust.clone(), platform.clone());
        let dispatcher = moderation::ModerationDispatcher::new(
            store.clone(),
            platform.clone(),
            guardrails.clone(),
            settings.moderation.medium_restrict_hours,
        );
        let dedup = dedup::EventDedup::new(&settings.dedup);
        let groups = groups::GroupRegistry::new(store.clone(), settings.scam.clone());
        let risk = risk::RiskEngine::new(
            settings.risk.clone(),
            trust.clone(),
            store.clone(),
            dispatcher.clone(),
        );
        let scam = Arc::new(scam::ScamEngine::new(trust.clone()));
        let cluster = cluster::ClusterDetector::new(
            settings.cluster.clone(),
            trust.clone(),
            store.clone(),
            dispatcher.clone(),
            risk.clone(),
        );
        let pipeline = Arc::new(pipeline::Pipeline {
            store: store.clone(),
            trust: trust.clone(),
            dedup: dedup.clone(),
            groups: groups.clone(),
            risk: risk.clone(),
            scam: scam.clone(),
            cluster: cluster.clone(),
            dispatcher: dispatcher.clone(),
        });

        Arc::new(Self {
            settings,
            store,
            platform,
            trust,
            guardrails,
            dispatcher,
            dedup,
            groups,
            risk,
            scam,
            cluster,
            pipeline,
            discord,
        })
    }

    /// Zadania okresowe: sprzątanie, decay ryzyka, batch klastrów.
    pub fn spawn_jobs(&self) -> Vec<JoinHandle<()>> {
        use scheduler::{ClusterBatchJob, RiskDecayJob, Scheduler, SweepJob};

        Scheduler::new()
            .every(
                self.dedup.sweep_interval(),
                Arc::new(SweepJob {
                    dedup: self.dedup.clone(),
                    guardrails: self.guardrails.clone(),
                }),
            )
            .every(
                Duration::from_secs(self.settings.risk.decay_job_interval_secs),
                Arc::new(RiskDecayJob(self.risk.clone())),
            )
            .every(
                Duration::from_secs(self.settings.cluster.batch_interval_secs),
                Arc::new(ClusterBatchJob(self.cluster.clone())),
            )
            .spawn()
    }

    /// Serwer sterowania (panic / dry-run), jeśli włączony.
    pub fn spawn_control(&self) -> Result<Option<JoinHandle<()>>> {
        let c = &self.settings.control;
        if !c.enabled {
            return Ok(None);
        }
        if c.token.is_empty() {
            tracing::warn!("control api enabled without token: switches are read-only");
        }
        let addr: SocketAddr = c
            .bind
            .parse()
            .with_context(|| format!("invalid control.bind: {}", c.bind))?;
        let guardrails = self.guardrails.clone();
        let token = c.token.clone();
        Ok(Some(tokio::spawn(async move {
            if let Err(e) = control::serve(addr, guardrails, &token).await {
                tracing::error!(error=?e, "control api stopped");
            }
        })))
    }
}

/// Start: zadania w tle, serwer sterowania, potem klient Discorda (blokuje).
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let _jobs = ctx.spawn_jobs();
    let _control = ctx.spawn_control()?;

    let platform = ctx
        .discord
        .clone()
        .context("no Discord platform wired (use AppContext::bootstrap)")?;
    discord::run_bot(ctx, platform).await
}
