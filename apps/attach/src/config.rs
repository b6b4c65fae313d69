use url::Url;

use crate::error::AttachError;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:7070";

/// Base addresses of one attach server, HTTP for the grant calls and
/// websocket for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUrl {
    http_base: String,
    ws_base: String,
}

impl ServerUrl {
    /// Accepts `http(s)://`, `ws(s)://` or a bare `host[:port]`. Bare local
    /// hosts default to plain HTTP, anything else to HTTPS.
    pub fn parse(raw: &str) -> Result<Self, AttachError> {
        let trimmed = raw.trim().trim_end_matches('/');
        let invalid = |reason: &str| AttachError::InvalidServer {
            url: raw.to_string(),
            reason: reason.to_string(),
        };
        if trimmed.is_empty() {
            return Err(invalid("empty"));
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else if is_local(trimmed) {
            format!("http://{trimmed}")
        } else {
            format!("https://{trimmed}")
        };
        let url = Url::parse(&with_scheme).map_err(|err| invalid(&err.to_string()))?;
        if url.host_str().is_none() {
            return Err(invalid("missing host"));
        }

        let (http_scheme, ws_scheme) = match url.scheme() {
            "http" | "ws" => ("http", "ws"),
            "https" | "wss" => ("https", "wss"),
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };
        let rest = with_scheme
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        Ok(Self {
            http_base: format!("{http_scheme}://{rest}"),
            ws_base: format!("{ws_scheme}://{rest}"),
        })
    }

    pub fn http(&self, path: &str) -> String {
        format!("{}{}", self.http_base, path)
    }

    pub fn ws(&self, path: &str) -> String {
        format!("{}{}", self.ws_base, path)
    }

    pub fn http_base(&self) -> &str {
        &self.http_base
    }
}

impl std::fmt::Display for ServerUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.http_base)
    }
}

fn is_local(host_and_port: &str) -> bool {
    let host = host_and_port
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(host_and_port);
    matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "0.0.0.0")
}
