//! Deployment event system
//!
//! This crate provides the event bus and event types used to trace a
//! deployment run: phase changes and per-node progress.

mod bus;
mod types;

pub use bus::{drain, EventBus};
pub use types::*;
