//! Exchanges the bearer credential for a connection-scoped attach cookie.

use async_trait::async_trait;
use attach_proto::{paths, AttachGrant, AttachGrantRequest, ErrorBody, Role, ATTACH_COOKIE_NAME};
use reqwest::header::SET_COOKIE;
use std::time::Duration;
use tracing::debug;

use crate::config::ServerUrl;
use crate::error::AttachError;

/// The artifact the transport presents when it opens. Never printed.
#[derive(Clone)]
pub struct AttachCookie {
    value: String,
    pub client_id: String,
    pub role: Role,
    pub expires_at_ms: u64,
}

impl AttachCookie {
    pub fn new(value: impl Into<String>, client_id: impl Into<String>, role: Role, expires_at_ms: u64) -> Self {
        Self {
            value: value.into(),
            client_id: client_id.into(),
            role,
            expires_at_ms,
        }
    }

    /// Value for a `Cookie` request header.
    pub fn header_value(&self) -> String {
        format!("{ATTACH_COOKIE_NAME}={}", self.value)
    }
}

impl std::fmt::Debug for AttachCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachCookie")
            .field("value", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("role", &self.role)
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, session_id: &str, role: Role) -> Result<AttachCookie, AttachError>;
}

pub struct HttpAuthenticator {
    client: reqwest::Client,
    server: ServerUrl,
    credential: String,
}

impl HttpAuthenticator {
    pub fn new(server: ServerUrl, credential: impl Into<String>, timeout: Duration) -> Result<Self, AttachError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            server,
            credential: credential.into(),
        })
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self, session_id: &str, role: Role) -> Result<AttachCookie, AttachError> {
        let url = self.server.http(&paths::attach_cookie_path(session_id));
        debug!(target: "attach::auth", %url, %role, "requesting attach cookie");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.credential)
            .json(&AttachGrantRequest {
                role: role.as_str().to_string(),
                client_id: None,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.error,
                Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
            };
            return Err(AttachError::from_status(status.as_u16(), message));
        }

        let value = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|header| header.to_str().ok())
            .find_map(cookie_value)
            .ok_or_else(|| AttachError::Transport("server did not set the attach cookie".into()))?;
        let grant: AttachGrant = response.json().await?;
        Ok(AttachCookie::new(value, grant.client_id, grant.role, grant.expires_at_ms))
    }
}

/// The attach token from one `Set-Cookie` header, if that header sets it.
fn cookie_value(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    if name.trim() != ATTACH_COOKIE_NAME || value.is_empty() {
        return None;
    }
    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn picks_attach_cookie_out_of_set_cookie() {
        assert_eq!(
            cookie_value("attach_token=abc123; Path=/api; HttpOnly; SameSite=Strict").as_deref(),
            Some("abc123")
        );
        assert_eq!(cookie_value("other=1; Path=/"), None);
        assert_eq!(cookie_value("attach_token=; Max-Age=0"), None);
    }

    #[test_timeout::timeout]
    fn debug_output_hides_the_token() {
        let cookie = AttachCookie::new("very-secret", "c1", Role::Driver, 0);
        let printed = format!("{cookie:?}");
        assert!(!printed.contains("very-secret"));
        assert!(printed.contains("c1"));
        assert_eq!(cookie.header_value(), "attach_token=very-secret");
    }
}
