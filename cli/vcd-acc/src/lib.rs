//! Acceptance scenarios for vApp and routed network reconciliation.
//!
//! A scenario is a sequence of desired-state documents, each followed by
//! checks. The [`driver`] applies documents in dependency order, records
//! state, evaluates checks and always tears down at the end.

pub mod config;
pub mod document;
pub mod driver;
pub mod scenario;
pub mod state;

pub use config::{AcceptanceConfig, ConfigError};
pub use document::{Defaults, Document, DocumentError, Resolved};
pub use driver::{connect, connect_scenario, run_scenario, Driver, DriverError, ScenarioReport};
pub use scenario::{Check, Scenario, Step};
pub use state::{ResourceKey, State};
