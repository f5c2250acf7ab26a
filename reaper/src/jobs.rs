//! Reclamation jobs for stale peers and expired sessions.
//! Every job is a filtered write, so re-running it right away is a no-op.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use common_net::{
    fabric::{session_group, Fabric},
    message::ServerMessage,
    metrics::reaper_metrics,
};
use registry::{RegistryError, SignalStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const HISTORY_LIMIT: usize = 1000;

/// Background job types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum JobType {
    /// Flip active peers without a recent heartbeat to disconnected
    ReapStale { timeout_secs: u64 },
    /// Delete disconnected peers past retention
    ReapDisconnected { retention_secs: u64 },
    /// Delete ended sessions past retention, with their peers and signals
    ReapSessions { retention_secs: u64 },
}

impl JobType {
    pub fn name(&self) -> &'static str {
        match self {
            JobType::ReapStale { .. } => "reap_stale",
            JobType::ReapDisconnected { .. } => "reap_disconnected",
            JobType::ReapSessions { .. } => "reap_sessions",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// Job execution result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub affected: usize,
    pub error_message: Option<String>,
}

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("window of {0}s is out of range")]
    Window(u64),
    #[error("cutoff {0} before now is out of range")]
    Cutoff(Duration),
}

/// Converts a configured window, checking that `now - window` is a valid
/// instant.
pub fn window(secs: u64) -> Result<Duration, ReaperError> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .filter(|window| cutoff(*window).is_ok())
        .ok_or(ReaperError::Window(secs))
}

fn cutoff(window: Duration) -> Result<DateTime<Utc>, ReaperError> {
    if window < Duration::zero() {
        return Err(ReaperError::Cutoff(window));
    }
    Utc::now()
        .checked_sub_signed(window)
        .ok_or(ReaperError::Cutoff(window))
}

pub struct Reaper {
    store: Arc<dyn SignalStore>,
    fabric: Arc<dyn Fabric>,
    history: RwLock<Vec<JobResult>>,
}

impl Reaper {
    pub fn new(store: Arc<dyn SignalStore>, fabric: Arc<dyn Fabric>) -> Self {
        reaper_metrics().on_startup();
        Self {
            store,
            fabric,
            history: RwLock::new(Vec::new()),
        }
    }

    /// Flips every connecting/connected peer last seen before `now - timeout`
    /// and announces `peer.left` for it. Returns how many peers were flipped.
    pub async fn reap_stale(&self, timeout: Duration) -> Result<usize, ReaperError> {
        let flipped = self.store.mark_stale(cutoff(timeout)?).await?;

        for peer in &flipped {
            let left = ServerMessage::PeerLeft {
                peer_id: peer.id,
                user_id: peer.user_id,
                username: peer.username.clone(),
            };
            if let Err(err) = self
                .fabric
                .publish(
                    &session_group(peer.session_id),
                    left,
                    Some(peer.connection_id),
                )
                .await
            {
                warn!(peer_id = %peer.id, %err, "reaper: could not announce peer.left");
            }
        }

        reaper_metrics()
            .peers_marked_stale_total
            .inc_by(flipped.len() as u64);
        Ok(flipped.len())
    }

    pub async fn reap_disconnected(&self, retention: Duration) -> Result<usize, ReaperError> {
        let deleted = self
            .store
            .purge_disconnected(cutoff(retention)?)
            .await?;
        reaper_metrics().peers_deleted_total.inc_by(deleted as u64);
        Ok(deleted)
    }

    pub async fn reap_sessions(&self, retention: Duration) -> Result<usize, ReaperError> {
        let deleted = self
            .store
            .purge_ended_sessions(cutoff(retention)?)
            .await?;
        reaper_metrics().sessions_deleted_total.inc_by(deleted as u64);
        Ok(deleted)
    }

    /// Runs one job and records it in the history.
    pub async fn execute_job(&self, job_type: JobType) -> Result<JobResult, ReaperError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();

        let execution = self.run_job(job_type).await;

        let completed_at = Utc::now();
        let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
        let job_result = JobResult {
            job_id: job_id.clone(),
            job_type,
            status: if execution.is_ok() {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            },
            started_at,
            completed_at,
            duration_ms,
            affected: *execution.as_ref().unwrap_or(&0),
            error_message: execution.as_ref().err().map(|e| e.to_string()),
        };

        {
            let mut history = self.history.write().await;
            history.push(job_result.clone());
            if history.len() > HISTORY_LIMIT {
                history.drain(0..100);
            }
        }

        match &execution {
            Ok(affected) => info!(
                job_id = %job_id,
                job = job_type.name(),
                affected,
                duration_ms,
                "reaper job completed"
            ),
            Err(err) => {
                reaper_metrics().job_failures_total.inc();
                error!(job_id = %job_id, job = job_type.name(), %err, "reaper job failed");
            }
        }

        execution.map(|_| job_result)
    }

    async fn run_job(&self, job_type: JobType) -> Result<usize, ReaperError> {
        match job_type {
            JobType::ReapStale { timeout_secs } => self.reap_stale(window(timeout_secs)?).await,
            JobType::ReapDisconnected { retention_secs } => {
                self.reap_disconnected(window(retention_secs)?).await
            }
            JobType::ReapSessions { retention_secs } => {
                self.reap_sessions(window(retention_secs)?).await
            }
        }
    }

    /// Most recent first.
    pub async fn history(&self, limit: Option<usize>, status: Option<JobStatus>) -> Vec<JobResult> {
        let history = self.history.read().await;
        history
            .iter()
            .rev()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}
