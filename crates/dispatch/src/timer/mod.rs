//! Repeating tasks with exponential backoff
//!
//! This module provides:
//! - [`BackoffTask`] - A periodic unit of work reporting whether it did anything
//! - [`BackoffTimer`] - Scheduler owning every task's interval state
//!
//! A task that reports [`TaskOutcome::Worked`] runs again after its minimum
//! interval. [`TaskOutcome::Idle`], errors and panics grow the interval up to
//! its ceiling. All tasks of one timer run sequentially on a single tokio task.

mod scheduler;
mod task;

pub use scheduler::{BackoffTimer, TimerTaskId};
pub use task::{BackoffTask, TaskError, TaskOutcome};
