use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;

use crate::{GridSize, Payload, Role};

/// Every `type` tag the protocol defines.
pub const FRAME_TYPES: &[&str] = &[
    "hello",
    "state",
    "stdout",
    "stdin",
    "resize",
    "keepalive",
    "take_control",
    "error",
    "backend_closed",
];

/// One protocol message on the attach transport (a JSON text message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Server → client, once, right after the connection is admitted.
    Hello {
        #[serde(rename = "sessionID", default, skip_serializing_if = "String::is_empty")]
        session_id: String,
        #[serde(rename = "clientID")]
        client_id: String,
        role: Role,
        #[serde(
            rename = "driverID",
            default,
            deserialize_with = "empty_as_none",
            skip_serializing_if = "Option::is_none"
        )]
        driver_id: Option<String>,
        #[serde(rename = "leaseMS", default)]
        lease_ms: u64,
    },
    /// Server → client whenever the control lease changes hands or expires.
    /// No holder goes out as `"driverID": ""`.
    State {
        #[serde(
            rename = "driverID",
            default,
            deserialize_with = "empty_as_none",
            serialize_with = "none_as_empty"
        )]
        driver_id: Option<String>,
        #[serde(rename = "leaseMS", default)]
        lease_ms: u64,
    },
    Stdout {
        #[serde(default)]
        data: Payload,
    },
    Stdin {
        #[serde(default)]
        data: Payload,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Keepalive,
    TakeControl,
    Error {
        #[serde(default)]
        message: String,
    },
    /// The workload side ended while the transport itself stayed up.
    BackendClosed,
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|value| !value.trim().is_empty()))
}

fn none_as_empty<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(value.as_deref().unwrap_or_default())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("invalid {kind} frame: {reason}")]
    Invalid { kind: String, reason: String },
}

impl Frame {
    pub fn stdout(bytes: impl Into<Payload>) -> Self {
        Frame::Stdout { data: bytes.into() }
    }

    pub fn stdin(bytes: impl Into<Payload>) -> Self {
        Frame::Stdin { data: bytes.into() }
    }

    pub fn resize(size: GridSize) -> Self {
        Frame::Resize {
            cols: size.cols,
            rows: size.rows,
        }
    }

    pub fn state(driver_id: Option<String>, lease: Duration) -> Self {
        Frame::State {
            driver_id,
            lease_ms: lease.as_millis() as u64,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    /// The wire `type` tag of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::State { .. } => "state",
            Frame::Stdout { .. } => "stdout",
            Frame::Stdin { .. } => "stdin",
            Frame::Resize { .. } => "resize",
            Frame::Keepalive => "keepalive",
            Frame::TakeControl => "take_control",
            Frame::Error { .. } => "error",
            Frame::BackendClosed => "backend_closed",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes one text message, telling apart garbage, unknown tags and
    /// known tags with bad fields so the server can answer precisely.
    pub fn decode(text: &str) -> Result<Frame, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|err| DecodeError::Malformed(err.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|tag| tag.as_str())
            .ok_or_else(|| DecodeError::Malformed("missing type".to_string()))?
            .to_string();
        if !FRAME_TYPES.contains(&kind.as_str()) {
            return Err(DecodeError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|err| DecodeError::Invalid {
            kind,
            reason: err.to_string(),
        })
    }
}
