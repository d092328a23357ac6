//! Cooperative pause/stop control
//!
//! A [`RunControl`] handle is cloned out of the orchestrator and driven from
//! another task (operator UI, Ctrl-C handler). Pause never touches a process
//! that is already running; it only holds back the next attempt. Stop is
//! observed before each attempt and after each step.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use super::events::EventBus;
use super::result::RunStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ControlState {
    paused: bool,
    stop: bool,
}

#[derive(Debug, Clone)]
pub struct RunControl {
    state: Arc<watch::Sender<ControlState>>,
    events: EventBus,
}

impl RunControl {
    pub fn new(events: EventBus) -> Self {
        let (tx, _) = watch::channel(ControlState::default());
        Self {
            state: Arc::new(tx),
            events,
        }
    }

    pub fn pause(&self) {
        self.state.send_modify(|s| s.paused = true);
        info!("Pause requested");
        self.events.status_changed(RunStatus::Paused);
    }

    pub fn resume(&self) {
        self.state.send_modify(|s| s.paused = false);
        info!("Resume requested");
        self.events.status_changed(RunStatus::Running);
    }

    pub fn stop(&self) {
        self.state.send_modify(|s| s.stop = true);
        info!("Stop requested");
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state.borrow().stop
    }

    /// Block until unpaused or stopped. Returns true if a stop was requested.
    pub async fn wait_while_paused(&self) -> bool {
        let mut rx = self.state.subscribe();
        let stopped = match rx.wait_for(|s| !s.paused || s.stop).await {
            Ok(state) => state.stop,
            Err(_) => self.is_stop_requested(),
        };
        stopped
    }

    /// Sleep for `duration` unless a stop arrives first. Returns true if stopped.
    pub async fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        if duration.is_zero() {
            return self.is_stop_requested();
        }
        let mut rx = self.state.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_stop_requested(),
            _ = rx.wait_for(|s| s.stop) => true,
        }
    }
}
