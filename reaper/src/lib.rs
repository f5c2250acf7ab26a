use std::sync::Arc;

use common_net::{fabric::Fabric, shutdown};
use registry::SignalStore;
use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinSet,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

pub mod jobs;

pub use jobs::{JobResult, JobStatus, JobType, Reaper, ReaperError};

pub type BoxError = common_net::BoxError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub stale_timeout_secs: u64,
    pub stale_interval_secs: u64,
    pub disconnected_retention_secs: u64,
    pub disconnected_interval_secs: u64,
    pub session_retention_secs: u64,
    pub session_interval_secs: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            stale_timeout_secs: 5 * 60,
            stale_interval_secs: 60,
            disconnected_retention_secs: 60 * 60,
            disconnected_interval_secs: 15 * 60,
            session_retention_secs: 7 * 24 * 60 * 60,
            session_interval_secs: 60 * 60,
        }
    }
}

fn env_secs(name: &str, default: u64) -> Result<u64, BoxError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|e| Box::new(e) as BoxError),
        Err(_) => Ok(default),
    }
}

impl ReaperSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let d = Self::default();
        let settings = Self {
            stale_timeout_secs: env_secs("REAPER_STALE_TIMEOUT_SECS", d.stale_timeout_secs)?,
            stale_interval_secs: env_secs("REAPER_STALE_INTERVAL_SECS", d.stale_interval_secs)?,
            disconnected_retention_secs: env_secs(
                "REAPER_DISCONNECTED_RETENTION_SECS",
                d.disconnected_retention_secs,
            )?,
            disconnected_interval_secs: env_secs(
                "REAPER_DISCONNECTED_INTERVAL_SECS",
                d.disconnected_interval_secs,
            )?,
            session_retention_secs: env_secs(
                "REAPER_SESSION_RETENTION_SECS",
                d.session_retention_secs,
            )?,
            session_interval_secs: env_secs(
                "REAPER_SESSION_INTERVAL_SECS",
                d.session_interval_secs,
            )?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Every timeout and retention must be usable as a cutoff.
    pub fn validate(&self) -> Result<(), ReaperError> {
        jobs::window(self.stale_timeout_secs)?;
        jobs::window(self.disconnected_retention_secs)?;
        jobs::window(self.session_retention_secs)?;
        Ok(())
    }

    /// Each job paired with how often it runs.
    pub fn schedule(&self) -> [(JobType, Duration); 3] {
        [
            (
                JobType::ReapStale {
                    timeout_secs: self.stale_timeout_secs,
                },
                Duration::from_secs(self.stale_interval_secs.max(1)),
            ),
            (
                JobType::ReapDisconnected {
                    retention_secs: self.disconnected_retention_secs,
                },
                Duration::from_secs(self.disconnected_interval_secs.max(1)),
            ),
            (
                JobType::ReapSessions {
                    retention_secs: self.session_retention_secs,
                },
                Duration::from_secs(self.session_interval_secs.max(1)),
            ),
        ]
    }
}

pub struct ReaperConfig {
    pub settings: ReaperSettings,
    pub store: Arc<dyn SignalStore>,
    pub fabric: Arc<dyn Fabric>,
}

impl ReaperConfig {
    pub fn from_settings(
        settings: ReaperSettings,
        store: Arc<dyn SignalStore>,
        fabric: Arc<dyn Fabric>,
    ) -> Self {
        Self {
            settings,
            store,
            fabric,
        }
    }
}

/// Starts one interval loop per job. Dropping the set stops them.
pub fn start_scheduler(reaper: Arc<Reaper>, settings: &ReaperSettings) -> JoinSet<()> {
    let mut loops = JoinSet::new();
    for (job, every) in settings.schedule() {
        let reaper = reaper.clone();
        loops.spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // failures are recorded and logged by execute_job
                let _ = reaper.execute_job(job).await;
            }
        });
    }
    loops
}

pub async fn run(
    config: ReaperConfig,
    shutdown_rx: shutdown::ShutdownReceiver,
) -> Result<(), BoxError> {
    config.settings.validate()?;
    let reaper = Arc::new(Reaper::new(config.store, config.fabric));
    let mut loops = start_scheduler(reaper, &config.settings);
    info!(
        stale_timeout_secs = config.settings.stale_timeout_secs,
        disconnected_retention_secs = config.settings.disconnected_retention_secs,
        session_retention_secs = config.settings.session_retention_secs,
        "reaper scheduler started"
    );

    // job loops never return on their own
    let outcome = tokio::select! {
        _ = shutdown::wait(shutdown_rx) => Ok(()),
        Some(ended) = loops.join_next() => {
            let err: BoxError = match ended {
                Err(join_err) => Box::new(join_err),
                Ok(()) => "reaper job loop exited".into(),
            };
            error!(%err, "reaper scheduler lost a job loop");
            Err(err)
        }
    };
    loops.shutdown().await;
    info!("reaper scheduler stopped");
    outcome
}
