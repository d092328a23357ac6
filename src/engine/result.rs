//! Step and run result types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a step, shared by in-memory results and persisted flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StepState {
    #[default]
    #[serde(rename = "NOT RUN", alias = "NOT_RUN")]
    NotRun,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "SKIPPED")]
    Skipped,
    #[serde(rename = "IGNORED")]
    Ignored,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::NotRun => "NOT RUN",
            StepState::Running => "RUNNING",
            StepState::Pass => "PASS",
            StepState::Fail => "FAIL",
            StepState::Timeout => "TIMEOUT",
            StepState::Skipped => "SKIPPED",
            StepState::Ignored => "IGNORED",
        }
    }

    /// Parse a persisted status; anything unrecognised collapses to `NotRun`
    pub fn from_persisted(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => StepState::Running,
            "PASS" => StepState::Pass,
            "FAIL" => StepState::Fail,
            "TIMEOUT" => StepState::Timeout,
            "SKIPPED" => StepState::Skipped,
            "IGNORED" => StepState::Ignored,
            _ => StepState::NotRun,
        }
    }

    /// FAIL or TIMEOUT
    pub fn is_failure(&self) -> bool {
        matches!(self, StepState::Fail | StepState::Timeout)
    }

    /// A resolved outcome that lets the resume path skip the step
    pub fn is_resolved(&self) -> bool {
        matches!(self, StepState::Pass | StepState::Fail | StepState::Timeout)
    }

    /// States that are written to the flag store
    pub fn is_persisted(&self) -> bool {
        self.is_resolved() || *self == StepState::Running
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Run-level status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    Ready,
    Running,
    Paused,
    Stopped,
    Pass,
    Fail,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunStatus::Ready => "Ready",
            RunStatus::Running => "Running",
            RunStatus::Paused => "Paused",
            RunStatus::Stopped => "Stopped",
            RunStatus::Pass => "Pass",
            RunStatus::Fail => "Fail",
        };
        f.pad(text)
    }
}

/// Result of executing one step, rebuilt on every execution
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepResult {
    pub state: StepState,
    pub exit_code: Option<i32>,
    pub matched_rule: String,
    pub duration_s: f64,
    pub attempt: u32,
    pub note: String,
    /// Attempt headers plus captured stdout/stderr for every attempt
    pub log: String,
}

impl StepResult {
    /// Projection sent with step-finished events (no log text)
    pub fn summary(&self) -> StepResult {
        StepResult {
            log: String::new(),
            ..self.clone()
        }
    }
}

/// One row of the JSON report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportRow {
    pub step_id: String,
    pub state: StepState,
    pub exit_code: Option<i32>,
    pub matched_rule: String,
    pub duration_s: f64,
    pub attempt: u32,
    pub note: String,
    pub message: String,
}

impl ReportRow {
    pub fn new(step_id: &str, result: &StepResult) -> Self {
        Self {
            step_id: step_id.to_string(),
            state: result.state,
            exit_code: result.exit_code,
            matched_rule: result.matched_rule.clone(),
            duration_s: result.duration_s,
            attempt: result.attempt,
            note: result.note.clone(),
            message: result.log.clone(),
        }
    }
}
