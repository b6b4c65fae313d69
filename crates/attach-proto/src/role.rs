use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of one client connection on an attach session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Viewer,
    Driver,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid role '{0}'")]
pub struct RoleParseError(pub String);

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Driver => "driver",
        }
    }

    /// Accepts the spellings older clients send; empty means viewer.
    pub fn normalize(raw: &str) -> Result<Role, RoleParseError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "viewer" | "read" | "readonly" | "read-only" => Ok(Role::Viewer),
            "driver" | "write" | "interactive" => Ok(Role::Driver),
            _ => Err(RoleParseError(raw.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::normalize(s)
    }
}
