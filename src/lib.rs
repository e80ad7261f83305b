//! Scenario harness - declarative end-to-end testing for CLIs and HTTP APIs
//!
//! Scenarios are YAML documents describing steps of commands run against a
//! system under test, with fixture overlays, retries and structural
//! assertions on the output.

pub mod assertion;
pub mod cli;
pub mod collab;
pub mod commands;
pub mod common;
pub mod overlay;
pub mod retry;
pub mod scenario;
pub mod value;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use scenario::{Collaborators, RunOptions, Runner, Scenario, ScenarioResult};
