//! Scenario definitions and their execution

pub mod config;
pub mod filter;
pub mod preflight;
pub mod runner;

pub use config::Scenario;
pub use filter::{discover, scenario_matches, DiscoveredScenario, SkipList, StopAfter};
pub use runner::{Collaborators, RunOptions, Runner, ScenarioResult};
