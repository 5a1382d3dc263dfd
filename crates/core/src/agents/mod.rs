//! Agent abstraction and management.
//!
//! This module provides the `Agent` trait (Adapter Pattern), the
//! `AgentFactory` that turns profiles into agents, and the `AgentManager`
//! registry the stage executor dispatches through.

pub mod adapters;
pub mod base;
pub mod cli_executor;
pub mod factory;
pub mod manager;

pub use adapters::{CommandAgent, MockAgent};
pub use base::{Agent, AgentError, AgentEvent, AgentStream, ExecutionContext};
pub use factory::AgentFactory;
pub use manager::AgentManager;
