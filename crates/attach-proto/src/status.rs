use serde::{Deserialize, Serialize};

/// Connection status exposed to whatever UI sits around an attach session.
/// Not a wire frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Initializing,
    Authenticating,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Initializing => "initializing",
            ConnectionStatus::Authenticating => "authenticating",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Disconnected | ConnectionStatus::Error)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus the reason that accompanies `error`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusReport {
    pub status: ConnectionStatus,
    pub reason: Option<String>,
}

impl StatusReport {
    pub fn new(status: ConnectionStatus) -> Self {
        Self {
            status,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ConnectionStatus::Error,
            reason: Some(reason.into()),
        }
    }
}
