//! Stale work recovery
//!
//! Work whose owner died stays in the work store but is no longer queued
//! anywhere. Every member reports the creation time of its oldest queued
//! item; anything in the local store that is older than all of those (minus
//! a safety buffer) cannot be waiting in any queue and is resubmitted.
//!
//! This module provides:
//! - [`RecoveryTask`] - The periodic task performing one recovery cycle per run
//! - [`RecoveryConfig`] - Buffers and cadence of recovery
//! - [`staleness_cutoff`] - The cutoff computation on its own

mod task;

pub use task::{staleness_cutoff, RecoveryConfig, RecoveryError, RecoveryTask};
