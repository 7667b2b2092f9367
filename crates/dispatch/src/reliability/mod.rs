//! Reliability patterns shared by the control loops
//!
//! This module provides:
//! - [`BackoffConfig`] - Exponential backoff bounds (min, multiplier, ceiling)
//! - [`Backoff`] - Mutable interval state driven by idle/busy outcomes

mod backoff;

pub use backoff::{Backoff, BackoffConfig};
