//! Run state management.
//!
//! This module provides:
//! - Run lifecycle transitions committed atomically with their events
//! - RunManager for driving many runs in background tasks

pub mod manager;
pub mod run;
