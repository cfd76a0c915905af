mod control;
mod hub;
mod monitor;
mod player;
mod protocol;

#[cfg(test)]
pub use control::ControlState;
pub use control::{ControlError, SessionControl};
pub use hub::ProgressHub;
pub use monitor::MonitorRegistry;
pub use player::{LivePlayer, PlaybackOptions};
pub use protocol::{ClientCommand, ProgressUpdate, ServerMessage};
