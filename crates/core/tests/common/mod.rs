//! Shared helpers for the integration tests.
//!
//! - Fixtures: pipelines, settings and an engine harness with a manual clock
//! - Assertions over progress event logs
//! - Scripted agents

pub mod assertions;
pub mod fixtures;
pub mod mock_agents;

#[allow(unused_imports)]
pub use assertions::*;
#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use mock_agents::*;
