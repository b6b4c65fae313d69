use attach_proto::Role;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// What a connection-scoped attach token authorizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachClaims {
    pub session_id: String,
    pub client_id: String,
    pub role: Role,
    /// The issuing credential holds `control:write`.
    pub may_drive: bool,
    pub principal: String,
    pub expires_at: Instant,
    pub expires_at_ms: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid attach token")]
    Unknown,
    #[error("attach token expired")]
    Expired,
    #[error("attach token issued for another session")]
    WrongSession,
    #[error("client id belongs to another principal")]
    ClientIdTaken,
}

pub struct TokenRequest<'a> {
    pub session_id: &'a str,
    pub role: Role,
    pub may_drive: bool,
    pub principal: &'a str,
    /// Reuse a client id (driver reconnect); a fresh one is minted otherwise.
    pub client_id: Option<&'a str>,
}

/// Which principal a client id was issued to, and until when.
struct Binding {
    principal: String,
    until: Instant,
}

/// Short-lived attach tokens, kept in memory until they lapse.
///
/// A client id stays bound to the principal it was first issued to while
/// any token for it is live, so one credential cannot present itself as
/// another's connection.
pub struct TokenStore {
    ttl: Duration,
    tokens: DashMap<String, AttachClaims>,
    bindings: DashMap<String, Binding>,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: DashMap::new(),
            bindings: DashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, request: TokenRequest<'_>) -> Result<(String, AttachClaims), TokenError> {
        self.issue_at(request, Instant::now())
    }

    pub fn issue_at(
        &self,
        request: TokenRequest<'_>,
        now: Instant,
    ) -> Result<(String, AttachClaims), TokenError> {
        self.purge_expired(now);

        let client_id = request
            .client_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_client_id);
        match self.bindings.entry(client_id.clone()) {
            Entry::Occupied(mut bound) => {
                if bound.get().principal != request.principal {
                    return Err(TokenError::ClientIdTaken);
                }
                bound.get_mut().until = now + self.ttl;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Binding {
                    principal: request.principal.to_string(),
                    until: now + self.ttl,
                });
            }
        }
        let expires_at_ms = SystemTime::now()
            .checked_add(self.ttl)
            .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_millis() as u64)
            .unwrap_or_default();
        let claims = AttachClaims {
            session_id: request.session_id.to_string(),
            client_id,
            role: request.role,
            may_drive: request.may_drive,
            principal: request.principal.to_string(),
            expires_at: now + self.ttl,
            expires_at_ms,
        };
        let token = generate_token();
        self.tokens.insert(token.clone(), claims.clone());
        Ok((token, claims))
    }

    pub fn validate(&self, token: &str, session_id: &str) -> Result<AttachClaims, TokenError> {
        self.validate_at(token, session_id, Instant::now())
    }

    pub fn validate_at(
        &self,
        token: &str,
        session_id: &str,
        now: Instant,
    ) -> Result<AttachClaims, TokenError> {
        let claims = self
            .tokens
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or(TokenError::Unknown)?;
        if now >= claims.expires_at {
            self.tokens.remove(token);
            return Err(TokenError::Expired);
        }
        if claims.session_id != session_id {
            return Err(TokenError::WrongSession);
        }
        Ok(claims)
    }

    pub fn purge_expired(&self, now: Instant) {
        self.tokens.retain(|_, claims| now < claims.expires_at);
        self.bindings.retain(|_, binding| now < binding.until);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn generate_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    URL_SAFE_NO_PAD.encode(bytes)
}

fn generate_client_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(session_id: &'a str, client_id: Option<&'a str>) -> TokenRequest<'a> {
        TokenRequest {
            session_id,
            role: Role::Driver,
            may_drive: true,
            principal: "alice",
            client_id,
        }
    }

    fn viewer_request<'a>(principal: &'a str, client_id: Option<&'a str>) -> TokenRequest<'a> {
        TokenRequest {
            session_id: "s1",
            role: Role::Viewer,
            may_drive: false,
            principal,
            client_id,
        }
    }

    #[test_timeout::timeout]
    fn issued_token_validates_for_its_session_only() {
        let store = TokenStore::new(Duration::from_secs(120));
        let (token, claims) = store.issue(request("s1", None)).unwrap();
        assert!(token.len() >= 43);
        assert!(!claims.client_id.is_empty());

        let validated = store.validate(&token, "s1").unwrap();
        assert_eq!(validated, claims);
        assert_eq!(store.validate(&token, "s2"), Err(TokenError::WrongSession));
        assert_eq!(store.validate("nope", "s1"), Err(TokenError::Unknown));
    }

    #[test_timeout::timeout]
    fn expired_token_is_rejected_and_forgotten() {
        let store = TokenStore::new(Duration::from_secs(120));
        let start = Instant::now();
        let (token, _) = store.issue_at(request("s1", None), start).unwrap();

        let lapsed = start + Duration::from_secs(120);
        assert_eq!(store.validate_at(&token, "s1", lapsed), Err(TokenError::Expired));
        assert_eq!(store.validate_at(&token, "s1", start), Err(TokenError::Unknown));
    }

    #[test_timeout::timeout]
    fn requested_client_id_is_kept() {
        let store = TokenStore::new(Duration::from_secs(120));
        let (_, claims) = store.issue(request("s1", Some(" c1 "))).unwrap();
        assert_eq!(claims.client_id, "c1");

        let (_, other) = store.issue(request("s1", None)).unwrap();
        let (_, third) = store.issue(request("s1", None)).unwrap();
        assert_ne!(other.client_id, third.client_id);
    }

    #[test_timeout::timeout]
    fn client_id_stays_with_the_principal_that_got_it() {
        let store = TokenStore::new(Duration::from_secs(120));
        let start = Instant::now();
        let (_, driver) = store.issue_at(request("s1", None), start).unwrap();

        let stolen = store.issue_at(viewer_request("bob", Some(&driver.client_id)), start);
        assert_eq!(stolen.err(), Some(TokenError::ClientIdTaken));
        let (_, again) = store
            .issue_at(viewer_request("alice", Some(&driver.client_id)), start)
            .unwrap();
        assert_eq!(again.client_id, driver.client_id);

        // the binding lapses with the last token issued for it
        let lapsed = start + Duration::from_secs(120);
        let (_, reused) = store
            .issue_at(viewer_request("bob", Some(&driver.client_id)), lapsed)
            .unwrap();
        assert_eq!(reused.principal, "bob");
    }
}
