use axum::http::{header, HeaderMap};
use std::collections::HashMap;

use crate::config::CredentialConfig;
use crate::error::ApiError;

pub const SCOPE_SESSION_READ: &str = "session:read";
pub const SCOPE_CONTROL_WRITE: &str = "control:write";
pub const SCOPE_ALL: &str = "*";

/// Who presented a long-lived bearer credential and what it may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub scopes: Vec<String>,
}

impl Principal {
    pub fn allows(&self, scope: &str) -> bool {
        self.scopes
            .iter()
            .any(|granted| granted == SCOPE_ALL || granted == scope)
    }

    pub fn require(&self, scope: &str) -> Result<(), ApiError> {
        if self.allows(scope) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!("missing scope {scope}")))
        }
    }
}

/// Static credential table loaded from configuration.
#[derive(Debug, Default)]
pub struct CredentialStore {
    by_token: HashMap<String, Principal>,
}

impl CredentialStore {
    pub fn from_config(entries: &[CredentialConfig], bootstrap: Option<&str>) -> Self {
        let mut by_token = HashMap::new();
        for entry in entries {
            by_token.insert(
                entry.token.clone(),
                Principal {
                    name: entry.principal.clone(),
                    scopes: entry.scopes.clone(),
                },
            );
        }
        if let Some(token) = bootstrap.filter(|token| !token.is_empty()) {
            by_token.insert(
                token.to_string(),
                Principal {
                    name: "bootstrap".to_string(),
                    scopes: vec![SCOPE_ALL.to_string()],
                },
            );
        }
        Self { by_token }
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    pub fn lookup(&self, token: &str) -> Option<&Principal> {
        self.by_token.get(token)
    }

    /// Resolves the `Authorization: Bearer` header of an API request.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, ApiError> {
        let token = bearer_token(headers)
            .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))?;
        self.lookup(token)
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("invalid bearer token".to_string()))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn store() -> CredentialStore {
        CredentialStore::from_config(
            &[CredentialConfig {
                token: "viewer-token".into(),
                principal: "alice".into(),
                scopes: vec![SCOPE_SESSION_READ.into()],
            }],
            Some("boot"),
        )
    }

    #[test_timeout::timeout]
    fn bearer_header_resolves_principal() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer viewer-token"),
        );
        let principal = store().authenticate(&headers).unwrap();
        assert_eq!(principal.name, "alice");
        assert!(principal.allows(SCOPE_SESSION_READ));
        assert!(!principal.allows(SCOPE_CONTROL_WRITE));
    }

    #[test_timeout::timeout]
    fn bootstrap_token_holds_every_scope() {
        let store = store();
        let principal = store.lookup("boot").unwrap();
        assert!(principal.allows(SCOPE_CONTROL_WRITE));
        assert_eq!(store.len(), 2);
    }

    #[test_timeout::timeout]
    fn rejects_missing_and_foreign_schemes() {
        let store = store();
        assert!(matches!(
            store.authenticate(&HeaderMap::new()),
            Err(ApiError::Unauthorized(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());
    }
}
