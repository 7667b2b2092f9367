//! Units of work and the handlers that execute them
//!
//! This module provides:
//! - [`Groupable`] - Anything that carries a group key and a creation timestamp
//! - [`WorkItem`] - The concrete unit of work moved through the dispatch engine
//! - [`WorkHandler`] - Async function executing a work item on a pool worker

mod handler;
mod item;

pub(crate) use handler::panic_message;
pub use handler::{handler_fn, WorkHandler, WorkResult};
pub use item::{Groupable, WorkItem};
