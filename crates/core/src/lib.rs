//! # rd-core
//!
//! Analysis orchestration engine for repodoc.
//!
//! This crate provides:
//! - Configuration loading from the `.repodoc/` directory
//! - Agent abstraction layer and adapters
//! - Durable run state with per-run driver leases
//! - The stage executor, conditional router and pause/resume controller
//! - An append-only progress log with restartable subscriptions
//! - The orchestration engine and a run manager that drives runs in background tasks
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and management
//! - [`agents`]: Agent trait and adapter implementations
//! - [`steps`]: Built-in deterministic pipeline steps
//! - [`pipeline`]: Pipeline validation and routing
//! - [`executor`]: Single-stage execution and retry policy
//! - [`store`]: Run state persistence
//! - [`progress`]: Progress event emission and subscription
//! - [`control`]: Pause, resume and cancel handling
//! - [`engine`]: The drive loop
//! - [`state`]: Run transitions and the run manager
//! - [`init`]: Project scaffolding

pub mod agents;
pub mod clock;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod executor;
pub mod init;
pub mod pipeline;
pub mod progress;
pub mod state;
pub mod steps;
pub mod store;

pub use engine::{DriveOutcome, OrchestrationEngine};
pub use error::{EngineError, EngineResult, StageError};
pub use state::manager::RunManager;
