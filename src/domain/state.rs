use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, `start()` not called yet
    Disconnected,
    /// Socket handshake in flight
    Connecting,
    /// Handshake acknowledged, subscriptions issued
    Connected,
    /// Session lost, waiting out the backoff delay
    Reconnecting,
    /// Terminal; only reachable through `stop()`
    Stopped,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Stopped => "STOPPED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, target) {
            (Stopped, _) => false,
            (_, Stopped) => true,

            (Disconnected, Connecting) => true,

            (Connecting, Connected) => true,
            (Connecting, Reconnecting) => true, // Handshake failed

            (Connected, Reconnecting) => true, // Socket dropped

            (Reconnecting, Connecting) => true, // Backoff elapsed

            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<ConnectionState> {
        use ConnectionState::*;

        match self {
            Disconnected => vec![Connecting, Stopped],
            Connecting => vec![Connected, Reconnecting, Stopped],
            Connected => vec![Reconnecting, Stopped],
            Reconnecting => vec![Connecting, Stopped],
            Stopped => vec![],
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Stopped)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}
