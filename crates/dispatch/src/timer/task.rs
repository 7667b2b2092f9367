//! Periodic task contract

use async_trait::async_trait;

/// Result of one task run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Useful work was done; run again soon
    Worked,
    /// Nothing to do; back off
    Idle,
}

/// Failure of one task run
///
/// The scheduler logs it and treats the run as [`TaskOutcome::Idle`].
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Task-reported failure
    #[error("task failed: {0}")]
    Failed(String),

    /// Underlying error surfaced by the task
    #[error(transparent)]
    Source(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// The run panicked
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// A unit of periodic work driven by a [`BackoffTimer`](super::BackoffTimer)
///
/// Implementations hold no interval state; the timer owns it.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use taskmesh_dispatch::timer::{BackoffTask, TaskError, TaskOutcome};
///
/// struct Heartbeat;
///
/// #[async_trait]
/// impl BackoffTask for Heartbeat {
///     fn name(&self) -> &str {
///         "heartbeat"
///     }
///
///     async fn execute(&self) -> Result<TaskOutcome, TaskError> {
///         Ok(TaskOutcome::Idle)
///     }
/// }
/// ```
#[async_trait]
pub trait BackoffTask: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Run once
    async fn execute(&self) -> Result<TaskOutcome, TaskError>;
}
