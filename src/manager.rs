use std::sync::Arc;
use std::thread;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::MaintenanceConfig;
use crate::error::{Result, StoreError};
use crate::{AgentVecDb, CompactionStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
    pub strict_durability: bool, // true = fsync, false = OS buffer (faster)
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::for_cores(cores)
    }

    pub fn for_cores(cores: usize) -> Self {
        if cores <= 1 {
            // 1 compute + 1 blocking I/O worker; skip fsync to keep appends cheap
            Self {
                logical_cores: cores,
                worker_threads: 2,
                strict_durability: false,
            }
        } else {
            Self {
                logical_cores: cores,
                worker_threads: cores,
                strict_durability: true,
            }
        }
    }

    /// Warning for the startup banner when the host forced a degraded mode.
    /// Detection runs before logging is installed, so this is printed, not traced.
    pub fn notice(&self) -> Option<&'static str> {
        (!self.strict_durability).then_some("single core detected, strict durability disabled")
    }
}

/// Outcome of one successful maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassOutcome {
    pub compaction: CompactionStats,
    pub cache_purged: usize,
}

/// Something the maintenance task can run passes against.
pub trait Maintainable: Send + Sync + 'static {
    fn run_pass(&self, history_limit: usize) -> Result<PassOutcome>;
}

impl Maintainable for AgentVecDb {
    fn run_pass(&self, history_limit: usize) -> Result<PassOutcome> {
        let compaction = self.compact(history_limit)?;
        let cache_purged = self.purge_cache()?;
        Ok(PassOutcome { compaction, cache_purged })
    }
}

/// Running totals reported when the maintenance task ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub passes: u64,
    pub failed_attempts: u64,
    pub versions_dropped: usize,
    pub deleted_purged: usize,
    pub cache_purged: usize,
}

impl MaintenanceReport {
    fn record(&mut self, outcome: &PassOutcome) {
        self.passes += 1;
        self.versions_dropped += outcome.compaction.versions_dropped;
        self.deleted_purged += outcome.compaction.deleted_purged;
        self.cache_purged += outcome.cache_purged;
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("maintenance pass failed {attempts} times, last error: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: StoreError,
        report: MaintenanceReport,
    },

    #[error("maintenance pass aborted: {0}")]
    Aborted(String),
}

/// Spawns [`run_maintenance`] on the current tokio runtime.
pub fn spawn_maintenance<T: Maintainable>(
    target: Arc<T>,
    config: MaintenanceConfig,
    cancel: CancellationToken,
) -> JoinHandle<std::result::Result<MaintenanceReport, MaintenanceError>> {
    tokio::spawn(run_maintenance(target, config, cancel))
}

/// Runs a pass every `config.interval()` until `cancel` fires.
///
/// Passes run on the blocking pool. A failed pass is retried with the
/// configured backoff; after `max_retries` consecutive failures the task ends
/// with [`MaintenanceError::RetriesExhausted`]. Cancellation, including during
/// a backoff, ends it with the report so far. A pass that panics ends it with
/// [`MaintenanceError::Aborted`].
pub async fn run_maintenance<T: Maintainable>(
    target: Arc<T>,
    config: MaintenanceConfig,
    cancel: CancellationToken,
) -> std::result::Result<MaintenanceReport, MaintenanceError> {
    info!(interval_ms = config.interval_ms, history_limit = config.history_limit, "maintenance task started");
    let mut report = MaintenanceReport::default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(passes = report.passes, "maintenance task cancelled");
                return Ok(report);
            }
            _ = tokio::time::sleep(config.interval()) => {}
        }

        let mut attempt = 0u32;
        loop {
            let pass_target = Arc::clone(&target);
            let history_limit = config.history_limit;
            let joined = tokio::task::spawn_blocking(move || pass_target.run_pass(history_limit)).await;

            let err = match joined {
                Ok(Ok(outcome)) => {
                    report.record(&outcome);
                    info!(
                        pass = report.passes,
                        dropped = outcome.compaction.versions_dropped,
                        purged = outcome.compaction.deleted_purged,
                        cache_purged = outcome.cache_purged,
                        "maintenance pass complete"
                    );
                    break;
                }
                Ok(Err(err)) => err,
                Err(join_err) => {
                    error!(error = %join_err, "maintenance pass aborted");
                    return Err(MaintenanceError::Aborted(join_err.to_string()));
                }
            };

            attempt += 1;
            report.failed_attempts += 1;
            if attempt > config.retry.max_retries {
                error!(attempts = attempt, error = %err, "maintenance giving up");
                return Err(MaintenanceError::RetriesExhausted {
                    attempts: attempt,
                    last_error: err,
                    report,
                });
            }

            let delay = config.retry.backoff(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "maintenance pass failed, retrying");
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(passes = report.passes, "maintenance task cancelled during backoff");
                    return Ok(report);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
