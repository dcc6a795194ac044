//! Connection state machine states.

use std::fmt;

/// Lifecycle of the incoming-connection listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    NotStarted,
    /// Listening was requested but Bluetooth is off.
    WaitingForRadiosEnabled,
    Running,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::WaitingForRadiosEnabled => write!(f, "waiting for radios"),
            Self::Running => write!(f, "running"),
        }
    }
}
