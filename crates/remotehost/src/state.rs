//! Lifecycle state of a remote host.

use serde::{Deserialize, Serialize};

/// Where a [`RemoteHosted`](crate::RemoteHosted) is in its lifecycle.
///
/// Moves strictly forward: `NotStarted → Starting → Running → Stopping → Stopped`. A failed
/// start drops back to `NotStarted`; a transport failure jumps straight to `Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostState {
    /// No session yet
    #[default]
    NotStarted,
    /// Worker spawned, waiting for the channel handshake
    Starting,
    /// Accepting calls
    Running,
    /// Shutdown sent, waiting for acknowledgement and exit
    Stopping,
    /// Session ended; terminal
    Stopped,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
