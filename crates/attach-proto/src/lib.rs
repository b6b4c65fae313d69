//! Shared protocol definitions for attach client ↔ attach server communication.
//! Kept in a dedicated crate so both sides (and any future bindings) agree on
//! the exact JSON shape of every frame without pulling in runtime code.

mod frame;
mod payload;
pub mod paths;
mod role;
mod status;

use std::time::Duration;

pub use frame::{DecodeError, Frame, FRAME_TYPES};
pub use payload::Payload;
pub use role::{Role, RoleParseError};
pub use status::{ConnectionStatus, StatusReport};

/// Interval at which a connected client sends `keepalive`.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Nominal driver lease granted by `take_control` and refreshed by activity.
pub const DEFAULT_DRIVER_LEASE: Duration = Duration::from_secs(30);

/// Cookie carrying the connection-scoped attach token.
pub const ATTACH_COOKIE_NAME: &str = "attach_token";

/// Terminal grid size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridSize {
    pub cols: u16,
    pub rows: u16,
}

impl GridSize {
    pub const DEFAULT: GridSize = GridSize { cols: 80, rows: 24 };

    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Both dimensions are known (non-zero).
    pub fn is_known(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl Default for GridSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for GridSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Body of `POST .../attach-token` and `POST .../attach-cookie`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AttachGrantRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Response of the grant endpoints. `token` is only present on `attach-token`;
/// the cookie variant delivers it in `Set-Cookie` instead.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AttachGrant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(rename = "expiresAt")]
    pub expires_at_ms: u64,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub role: Role,
}

/// Response of `GET /api/v1/attach-sessions/{id}`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SessionStatus {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "attachEnabled")]
    pub attach_enabled: bool,
    pub clients: usize,
    #[serde(rename = "driverID", default, skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(rename = "leaseMS", default)]
    pub lease_ms: u64,
}

/// Error body returned by every failing HTTP endpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn grid_size_known_requires_both_dimensions() {
        assert!(GridSize::new(80, 24).is_known());
        assert!(!GridSize::new(0, 24).is_known());
        assert!(!GridSize::new(80, 0).is_known());
        assert_eq!(GridSize::default(), GridSize::new(80, 24));
    }

    #[test_timeout::timeout]
    fn cookie_grant_omits_token_field() {
        let grant = AttachGrant {
            token: None,
            expires_at_ms: 1,
            session_id: "s1".into(),
            client_id: "c1".into(),
            role: Role::Viewer,
        };
        let json = serde_json::to_string(&grant).unwrap();
        assert!(!json.contains("token"));
        assert!(json.contains("\"clientID\":\"c1\""));
    }
}
