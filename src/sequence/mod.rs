//! Station sequence definitions
//!
//! This module contains the already-parsed inputs the engine runs:
//! - `step` - StepSpec, one externally-defined test step
//! - `config` - StationConfig, RunConfig, RunMode, ReportPolicy
//! - `loader` - Load and validate a station YAML file
//! - `placeholders` - `{NAME}` expansion for command templates

pub mod config;
pub mod loader;
pub mod placeholders;
pub mod step;

pub use config::{ReportPolicy, RuleDiagnostic, RunConfig, RunMode, StationConfig, StationMeta};
pub use loader::{LoadError, StationLoader};
pub use placeholders::PlaceholderContext;
pub use step::{parse_exit_codes, StepSpec};
