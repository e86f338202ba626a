use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunState {
    #[default]
    Running,
    Paused,
    Stopped,
}

/// Controlled termination requested by the user. Not a failure of the file
/// in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("run stopped by request")]
pub struct Stopped;

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<RunState>,
    changed: Condvar,
}

/// Cooperative pause/stop token shared between the pipeline and its host.
///
/// The pipeline calls [`RunControl::checkpoint`] once per file; a paused
/// run blocks there until resumed or stopped. Stop is final.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    shared: Arc<Shared>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RunState {
        *self.lock()
    }

    pub fn pause(&self) {
        self.transition(RunState::Running, RunState::Paused);
    }

    pub fn resume(&self) {
        self.transition(RunState::Paused, RunState::Running);
    }

    pub fn stop(&self) {
        let mut state = self.lock();
        if *state != RunState::Stopped {
            *state = RunState::Stopped;
            info!("run stop requested");
        }
        self.shared.changed.notify_all();
    }

    pub fn checkpoint(&self) -> Result<(), Stopped> {
        let mut state = self.lock();
        while *state == RunState::Paused {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match *state {
            RunState::Stopped => Err(Stopped),
            _ => Ok(()),
        }
    }

    fn transition(&self, from: RunState, to: RunState) {
        let mut state = self.lock();
        if *state == from {
            *state = to;
            info!(state = ?to, "run state changed");
            self.shared.changed.notify_all();
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
