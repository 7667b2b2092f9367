//! Recovery task implementation

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::cluster::ClusterCoordinator;
use crate::config::{duration_millis, ConfigError};
use crate::metrics::DispatchMetrics;
use crate::persistence::{StoreError, WorkStore};
use crate::reliability::BackoffConfig;
use crate::service::WorkIngress;
use crate::timer::{BackoffTask, TaskError, TaskOutcome};

/// Recovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Whether the service schedules recovery at all
    pub enabled: bool,

    /// Subtracted from the cluster-wide oldest queued time
    #[serde(with = "duration_millis")]
    pub expire_buffer: Duration,

    /// Age after which work is stale when no member has anything queued
    #[serde(with = "duration_millis")]
    pub empty_expire_buffer: Duration,

    /// Cadence of recovery cycles
    pub backoff: BackoffConfig,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expire_buffer: Duration::from_secs(5),
            empty_expire_buffer: Duration::from_secs(10),
            backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(30), 2.0),
        }
    }
}

impl RecoveryConfig {
    /// Recovery switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the buffer applied to the cluster-wide oldest time
    pub fn with_expire_buffer(mut self, buffer: Duration) -> Self {
        self.expire_buffer = buffer;
        self
    }

    /// Set the staleness age used when nothing is queued anywhere
    pub fn with_empty_expire_buffer(mut self, buffer: Duration) -> Self {
        self.empty_expire_buffer = buffer;
        self
    }

    /// Set the cycle cadence
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate()
    }
}

/// Creation time before which local pending work counts as stale
///
/// With at least one present timestamp the cutoff is the minimum minus
/// `expire_buffer`; with none it is `now_millis - empty_expire_buffer`.
///
/// ```
/// use taskmesh_dispatch::recovery::{staleness_cutoff, RecoveryConfig};
///
/// let config = RecoveryConfig::default();
/// assert_eq!(staleness_cutoff([Some(8_000), Some(9_000), None], 20_000, &config), 3_000);
/// assert_eq!(staleness_cutoff([None, None], 20_000, &config), 10_000);
/// ```
pub fn staleness_cutoff<I>(oldest: I, now_millis: i64, config: &RecoveryConfig) -> i64
where
    I: IntoIterator<Item = Option<i64>>,
{
    match oldest.into_iter().flatten().min() {
        Some(min) => min.saturating_sub(config.expire_buffer.as_millis() as i64),
        None => now_millis.saturating_sub(config.empty_expire_buffer.as_millis() as i64),
    }
}

/// Recovery cycle errors
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// Querying the store failed
    #[error("failed to query stale work: {0}")]
    Store(#[from] StoreError),

    /// Resubmitting one item failed; earlier items were already resubmitted
    #[error("failed to resubmit work item {id}: {source}")]
    Resubmit {
        id: Uuid,
        #[source]
        source: StoreError,
    },
}

impl From<RecoveryError> for TaskError {
    fn from(e: RecoveryError) -> Self {
        TaskError::Source(Box::new(e))
    }
}

/// Periodic task resubmitting abandoned work
pub struct RecoveryTask {
    coordinator: Arc<dyn ClusterCoordinator>,
    store: Arc<dyn WorkStore>,
    ingress: WorkIngress,
    metrics: Arc<DispatchMetrics>,
    config: RecoveryConfig,
}

impl RecoveryTask {
    pub fn new(
        coordinator: Arc<dyn ClusterCoordinator>,
        store: Arc<dyn WorkStore>,
        ingress: WorkIngress,
        metrics: Arc<DispatchMetrics>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            coordinator,
            store,
            ingress,
            metrics,
            config,
        }
    }

    /// Run one recovery cycle; returns how many items were resubmitted
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<usize, RecoveryError> {
        let started = Instant::now();
        let result = self.recover_stale().await;
        self.metrics
            .recovery_duration_ms
            .record(started.elapsed().as_millis() as u64);
        result
    }

    async fn recover_stale(&self) -> Result<usize, RecoveryError> {
        // Nothing stored locally means nothing to recover; skip the fan-out
        if self.store.pending_count().await? == 0 {
            debug!("Work store empty, skipping recovery scan");
            self.metrics.recovery_flushed.record(0);
            self.metrics.recovery_cycles.increment();
            return Ok(0);
        }

        let oldest = self.coordinator.oldest_task_timestamps().await;
        let now = Utc::now().timestamp_millis();
        let cutoff = staleness_cutoff(oldest.iter().map(|r| r.value), now, &self.config);

        let stale = self.store.query_local_pending(cutoff).await?;
        let count = stale.len();
        if count == 0 {
            debug!(members = oldest.len(), cutoff, "No stale work found");
        } else {
            info!(count, cutoff, "Recovering stale work items");
        }

        for mut item in stale {
            item.mark_recovered();
            let id = item.id;
            self.ingress
                .offer(item)
                .await
                .map_err(|source| RecoveryError::Resubmit { id, source })?;
            self.metrics.recovered_items.increment();
        }

        if count > 0 {
            info!(count, "Done recovering stale work items");
        }
        self.metrics.recovery_flushed.record(count as u64);
        self.metrics.recovery_cycles.increment();
        Ok(count)
    }
}

#[async_trait]
impl BackoffTask for RecoveryTask {
    fn name(&self) -> &str {
        "stale-work-recovery"
    }

    async fn execute(&self) -> Result<TaskOutcome, TaskError> {
        match self.run_cycle().await? {
            0 => Ok(TaskOutcome::Idle),
            _ => Ok(TaskOutcome::Worked),
        }
    }
}
