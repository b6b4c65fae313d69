use attach_proto::{DecodeError, Frame, ATTACH_COOKIE_NAME};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::catalog::SessionEntry;
use crate::credentials::bearer_token;
use crate::error::ApiError;
use crate::session::{ConnectError, JoinError, SessionHub};
use crate::tokens::AttachClaims;
use crate::AppState;

/// Attach token from the `attach_token` cookie, else an `Authorization:
/// Bearer` header. The query string is never consulted.
pub fn attach_token(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            if let Some((name, token)) = pair.trim().split_once('=') {
                if name == ATTACH_COOKIE_NAME && !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }
    bearer_token(headers).map(str::to_string)
}

fn check_origin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let allowed = &state.config.allowed_origins;
    if allowed.is_empty() {
        return Ok(());
    }
    let Some(origin) = headers.get(header::ORIGIN) else {
        return Ok(());
    };
    let origin = origin.to_str().unwrap_or_default();
    if allowed.iter().any(|candidate| candidate == origin) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("origin not allowed".to_string()))
    }
}

pub async fn attach_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    check_origin(&state, &headers)?;
    let token = attach_token(&headers)
        .ok_or_else(|| ApiError::Unauthorized("missing attach token".to_string()))?;
    let claims = state.tokens.validate(&token, &session_id)?;
    let entry = state
        .catalog
        .get(&session_id)
        .ok_or_else(|| ApiError::NotFound("session not found".to_string()))?;
    if !entry.attach_enabled {
        return Err(ApiError::Forbidden("attach disabled".to_string()));
    }

    Ok(ws
        .max_message_size(state.config.read_limit)
        .on_upgrade(move |socket| handle_socket(socket, state, entry, claims)))
}

/// Error text a client gets back for a frame it sent that did not decode.
pub fn decode_error_message(err: &DecodeError) -> &'static str {
    match err {
        DecodeError::UnknownType(_) => "unknown message type",
        DecodeError::Invalid { kind, .. } if kind == "stdin" => "invalid stdin payload",
        _ => "invalid message",
    }
}

fn route_text(hub: &SessionHub, client_id: &str, text: &str) {
    match Frame::decode(text) {
        Ok(frame) => hub.handle_frame(client_id, frame),
        Err(err) => {
            debug!(client_id, error = %err, "undecodable client frame");
            hub.send_to(client_id, Frame::error(decode_error_message(&err)));
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    entry: SessionEntry,
    claims: AttachClaims,
) {
    let client_id = claims.client_id.clone();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

    let (hub, joined): (Arc<SessionHub>, _) = match state.hubs.connect(&entry, &claims, tx) {
        Ok(connected) => connected,
        Err(err) => {
            let message = match &err {
                ConnectError::Join(JoinError::ClientIdTaken | JoinError::LeaseHeld) => {
                    "client id in use"
                }
                ConnectError::Join(JoinError::ShutDown) | ConnectError::Workload(_) => {
                    "workload unavailable"
                }
            };
            warn!(session_id = %entry.id, client_id = %client_id, error = %err, "connection refused");
            if let Ok(text) = Frame::error(message).encode() {
                let _ = sender.send(Message::Text(text)).await;
            }
            let _ = sender.close().await;
            return;
        }
    };

    let ping_period = state.config.ping_period();
    let writer_client = client_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping =
            tokio::time::interval_at(tokio::time::Instant::now() + ping_period, ping_period);
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(err) => {
                            warn!(error = %err, "failed to encode frame");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sender.close().await;
        debug!(client_id = %writer_client, "writer task ended");
    });

    let pong_wait = state.config.pong_wait();
    loop {
        let next = tokio::select! {
            next = tokio::time::timeout(pong_wait, receiver.next()) => next,
            _ = &mut writer => break,
        };
        let message = match next {
            Err(_) => {
                info!(session_id = %entry.id, client_id = %client_id, "peer went silent, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(client_id = %client_id, error = %err, "websocket read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };
        match message {
            Message::Text(text) => route_text(&hub, &client_id, &text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => route_text(&hub, &client_id, &text),
                Err(_) => hub.send_to(&client_id, Frame::error("invalid message")),
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    writer.abort();
    state.hubs.release(&hub, &client_id, joined.connection);
}
