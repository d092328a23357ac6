//! # Station Flow
//!
//! A step sequencer for hardware test stations. A station file lists ordered
//! steps; each step runs one external command and is judged by a small
//! pass-criteria language. Outcomes are persisted per serial number so an
//! interrupted or pending run resumes where it left off.
//!
//! ## Features
//!
//! - **Declarative YAML stations** - Steps, retries, timeouts, and pass rules in one file
//! - **Durable flags** - Atomic per-step outcome files drive resumption
//! - **Pending steps** - Designated exit codes park a run until externally resolved
//! - **Kill-tree timeouts** - Hung tools and their children are cleaned up
//! - **Cooperative control** - Pause, resume, and stop from another task
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use station_flow::{Orchestrator, OrchestratorOptions, StationLoader};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = StationLoader::load_file(Path::new("config/station.yaml"))?;
//!     let mut orchestrator = Orchestrator::new(config, OrchestratorOptions::new("SN0001"))?;
//!
//!     let summary = orchestrator.run_all().await;
//!     println!("Run {} finished: {}", orchestrator.run_id(), summary.status);
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod sequence;

// Re-export main types
pub use engine::{
    evaluate, latest_run, ExecutorError, FlagStore, LatestRun, Orchestrator, OrchestratorOptions,
    PassCriteria, PointerStatus, ReportRow, RunControl, RunEvent, RunStatus, RunSummary,
    StepFlag, StepResult, StepState, Verdict,
};
pub use sequence::{
    LoadError, PlaceholderContext, ReportPolicy, RunConfig, RunMode, StationConfig, StationLoader,
    StationMeta, StepSpec,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::{
        ExecutorError, Orchestrator, OrchestratorOptions, RunControl, RunEvent, RunStatus,
        RunSummary, StepResult, StepState,
    };
    pub use crate::sequence::{RunMode, StationConfig, StationLoader, StepSpec};
}
