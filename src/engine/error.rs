//! Executor error types

use std::path::PathBuf;

/// Errors that stop an orchestrator from being built.
///
/// Storage hiccups during a run are logged and swallowed instead.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run directory for serial number '{sn}' is locked by another process ({path})")]
    RunLocked { sn: String, path: PathBuf },

    #[error("Invalid serial number: {0:?}")]
    InvalidSerial(String),
}
