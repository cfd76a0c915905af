use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use super::protocol::ClientCommand;

pub const ACK_PAUSED: &str = "Processing paused";
pub const ACK_RESUMED: &str = "Processing resumed";
pub const ACK_RESTARTED: &str = "Processing restarted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    Idle,
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("session is stopped")]
    Stopped,
}

/// What the playback loop should do on its next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Advance,
    Wait,
    Restart,
    Stop,
}

struct Inner {
    state: ControlState,
    restart_pending: bool,
}

/// Pause/resume/restart signals shared between a client connection and
/// its playback loop.
pub struct SessionControl {
    inner: Mutex<Inner>,
}

impl SessionControl {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ControlState::Idle,
                restart_pending: false,
            }),
        }
    }

    pub fn state(&self) -> ControlState {
        self.inner.lock().state
    }

    /// Idle becomes running. A pause received before start is kept.
    pub fn start(&self) -> Result<(), ControlError> {
        let mut inner = self.inner.lock();
        match inner.state {
            ControlState::Stopped => Err(ControlError::Stopped),
            ControlState::Idle => {
                inner.state = ControlState::Running;
                Ok(())
            }
            ControlState::Running | ControlState::Paused => Ok(()),
        }
    }

    /// Applies a playback command and returns its acknowledgement.
    /// `RequestStatus` is not a playback command and yields `None`.
    pub fn apply(&self, command: ClientCommand) -> Result<Option<&'static str>, ControlError> {
        let mut inner = self.inner.lock();
        if inner.state == ControlState::Stopped {
            return Err(ControlError::Stopped);
        }
        let ack = match command {
            ClientCommand::Pause => {
                inner.state = ControlState::Paused;
                ACK_PAUSED
            }
            ClientCommand::Resume => {
                inner.state = ControlState::Running;
                ACK_RESUMED
            }
            ClientCommand::Restart => {
                inner.state = ControlState::Running;
                inner.restart_pending = true;
                ACK_RESTARTED
            }
            ClientCommand::RequestStatus => return Ok(None),
        };
        Ok(Some(ack))
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.state = ControlState::Stopped;
        inner.restart_pending = false;
    }

    /// Consumed at the top of every playback iteration.
    pub fn next_step(&self) -> Step {
        let mut inner = self.inner.lock();
        match inner.state {
            ControlState::Stopped => Step::Stop,
            _ if inner.restart_pending => {
                inner.restart_pending = false;
                Step::Restart
            }
            ControlState::Running => Step::Advance,
            ControlState::Idle | ControlState::Paused => Step::Wait,
        }
    }
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new()
    }
}
