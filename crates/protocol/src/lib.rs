//! # rd-protocol
//!
//! Core protocol definitions and data models for repodoc.
//!
//! This crate defines all shared data structures used for:
//! - Configuration file parsing (YAML pipelines, TOML config, Markdown agents)
//! - Durable analysis run state
//! - Progress events published to live observers
//! - Operator commands sent to the orchestration engine
//!
//! ## Modules
//!
//! - [`agent_models`]: Agent profile structures
//! - [`config_models`]: Engine and storage settings from config.toml
//! - [`event_models`]: Ordered progress events
//! - [`ipc`]: Operator commands and replies
//! - [`pipeline_models`]: Pipeline definitions, stages and routes
//! - [`run_models`]: Runtime run state and status
//!
//! ## Design Principles
//!
//! - Minimal dependencies: Only serde, ts-rs, chrono and uuid
//! - TypeScript generation: All types derive `TS` for observer UIs
//! - Independent compilation: No dependencies on other repodoc crates

pub mod agent_models;
pub mod config_models;
pub mod event_models;
pub mod ipc;
pub mod pipeline_models;
pub mod run_models;

// Re-export all public types for convenience
pub use agent_models::*;
pub use config_models::*;
pub use event_models::*;
pub use ipc::*;
pub use pipeline_models::*;
pub use run_models::*;
