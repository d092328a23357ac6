//! Outbound run events
//!
//! The orchestrator publishes status changes, step transitions, and live log
//! lines on a broadcast channel. Any number of subscribers (a UI, the CLI, a
//! test) can listen; publishing never blocks and never fails the run.

use serde::Serialize;
use tokio::sync::broadcast;

use super::result::{RunStatus, StepResult};

/// Default channel capacity; slow subscribers see `Lagged` instead of blocking
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEvent {
    StatusChanged { status: RunStatus },
    StepStarted { sid: String },
    StepFinished { sid: String, result: StepResult },
    LogLine { text: String },
}

/// Fire-and-forget publisher shared by the orchestrator and its I/O tasks
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscribers is fine
    pub fn emit(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    pub fn status_changed(&self, status: RunStatus) {
        self.emit(RunEvent::StatusChanged { status });
    }

    pub fn step_started(&self, sid: &str) {
        self.emit(RunEvent::StepStarted {
            sid: sid.to_string(),
        });
    }

    pub fn step_finished(&self, sid: &str, result: &StepResult) {
        self.emit(RunEvent::StepFinished {
            sid: sid.to_string(),
            result: result.summary(),
        });
    }

    pub fn log_line(&self, text: impl Into<String>) {
        self.emit(RunEvent::LogLine { text: text.into() });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
