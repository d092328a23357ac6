//! Station execution engine module
//!
//! This module contains:
//! - `orchestrator` - The run loop for one serial number
//! - `evaluator` - Pass-criteria rule language
//! - `flag_store` - Durable per-step outcome flags
//! - `run_dir` - Run directory layout, resume pointer, and advisory lock
//! - `process` - Shell process execution with timeout and kill-tree
//! - `control` - Cooperative pause/resume/stop
//! - `events` - Broadcast of run events to observers
//! - `error` - Executor error types
//! - `result` - Step and run result types

pub mod control;
pub mod error;
pub mod evaluator;
pub mod events;
pub mod flag_store;
pub mod orchestrator;
pub mod process;
pub mod result;
pub mod run_dir;

pub use control::RunControl;
pub use error::ExecutorError;
pub use evaluator::{evaluate, AttemptOutput, PassCriteria, PassRule, RuleError, Verdict};
pub use events::{EventBus, RunEvent};
pub use flag_store::{FlagStore, StepFlag};
pub use orchestrator::{Orchestrator, OrchestratorOptions, RunSummary};
pub use result::{ReportRow, RunStatus, StepResult, StepState};
pub use run_dir::{latest_run, LatestRun, PointerStatus};
