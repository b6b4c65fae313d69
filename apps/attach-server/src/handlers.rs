use attach_proto::{paths, AttachGrant, AttachGrantRequest, Role, SessionStatus};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::catalog::SessionEntry;
use crate::credentials::{Principal, SCOPE_CONTROL_WRITE, SCOPE_SESSION_READ};
use crate::error::ApiError;
use crate::tokens::{AttachClaims, TokenRequest};
use crate::AppState;

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn lookup_session(state: &AppState, session_id: &str) -> Result<SessionEntry, ApiError> {
    state
        .catalog
        .get(session_id)
        .ok_or_else(|| ApiError::NotFound("session not found".to_string()))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionStatus>, ApiError> {
    let principal = state.credentials.authenticate(&headers)?;
    principal.require(SCOPE_SESSION_READ)?;
    let entry = lookup_session(&state, &session_id)?;

    let snapshot = state.hubs.get(&session_id).map(|hub| hub.snapshot());
    Ok(Json(SessionStatus {
        session_id: entry.id,
        attach_enabled: entry.attach_enabled,
        clients: snapshot.as_ref().map_or(0, |s| s.clients),
        driver_id: snapshot.as_ref().and_then(|s| s.driver_id.clone()),
        lease_ms: snapshot.map_or(0, |s| s.lease_ms),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AttachControlRequest {
    pub enabled: bool,
}

pub async fn update_attach_control(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let principal = state.credentials.authenticate(&headers)?;
    principal.require(SCOPE_CONTROL_WRITE)?;
    let request: AttachControlRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("invalid request body".to_string()))?;

    if !state.catalog.set_attach_enabled(&session_id, request.enabled) {
        return Err(ApiError::NotFound("session not found".to_string()));
    }
    info!(
        target: "attach::audit",
        session_id = %session_id,
        principal = %principal.name,
        enabled = request.enabled,
        "attach control updated"
    );
    Ok(Json(json!({ "updated": true })))
}

/// Shared checks of the token and cookie grant endpoints.
fn grant(
    state: &AppState,
    session_id: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(String, AttachClaims), ApiError> {
    let principal: Principal = state.credentials.authenticate(headers)?;
    principal.require(SCOPE_SESSION_READ)?;

    let request: AttachGrantRequest = if body.iter().all(u8::is_ascii_whitespace) {
        AttachGrantRequest::default()
    } else {
        serde_json::from_slice(body)
            .map_err(|_| ApiError::BadRequest("invalid request body".to_string()))?
    };
    let role = Role::normalize(&request.role)
        .map_err(|_| ApiError::BadRequest("invalid role".to_string()))?;

    let entry = lookup_session(state, session_id)?;
    if !entry.attach_enabled {
        return Err(ApiError::Forbidden("attach disabled".to_string()));
    }
    let may_drive = principal.allows(SCOPE_CONTROL_WRITE);
    if role == Role::Driver && !may_drive {
        return Err(ApiError::Forbidden("insufficient role".to_string()));
    }

    let (token, claims) = state.tokens.issue(TokenRequest {
        session_id: &entry.id,
        role,
        may_drive,
        principal: &principal.name,
        client_id: request.client_id.as_deref(),
    })?;
    info!(
        target: "attach::audit",
        session_id = %entry.id,
        client_id = %claims.client_id,
        principal = %principal.name,
        role = %role,
        "attach token issued"
    );
    Ok((token, claims))
}

fn grant_body(claims: &AttachClaims, token: Option<String>) -> AttachGrant {
    AttachGrant {
        token,
        expires_at_ms: claims.expires_at_ms,
        session_id: claims.session_id.clone(),
        client_id: claims.client_id.clone(),
        role: claims.role,
    }
}

pub async fn issue_attach_token(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AttachGrant>), ApiError> {
    let (token, claims) = grant(&state, &session_id, &headers, &body)?;
    Ok((StatusCode::CREATED, Json(grant_body(&claims, Some(token)))))
}

pub async fn issue_attach_cookie(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (token, claims) = grant(&state, &session_id, &headers, &body)?;
    let cookie = attach_cookie(
        &token,
        &paths::attach_path(&claims.session_id),
        state.tokens.ttl().as_secs(),
        state.config.cookie_secure,
    );
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|err| ApiError::Internal(format!("invalid cookie header: {err}")))?;

    let mut response = (StatusCode::CREATED, Json(grant_body(&claims, None))).into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}

pub fn attach_cookie(token: &str, path: &str, max_age_secs: u64, secure: bool) -> String {
    let mut cookie = format!(
        "{}={token}; Path={path}; Max-Age={max_age_secs}; HttpOnly; SameSite=Strict",
        attach_proto::ATTACH_COOKIE_NAME
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}
