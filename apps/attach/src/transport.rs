//! The message transport under a connection: text frames out, text frames
//! and terminal events in.

use async_trait::async_trait;
use attach_proto::{paths, Frame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, trace};

use crate::auth::AttachCookie;
use crate::config::ServerUrl;
use crate::error::AttachError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    /// The transport failed. A `Closed` normally follows.
    Error(String),
    Closed,
}

/// Dropping `outgoing` closes the transport.
pub struct Transport {
    pub outgoing: UnboundedSender<String>,
    pub incoming: UnboundedReceiver<TransportEvent>,
}

impl Transport {
    /// A transport wired to an in-process peer.
    pub fn pair() -> (Transport, TransportPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Transport {
                outgoing: out_tx,
                incoming: in_rx,
            },
            TransportPeer {
                sent: out_rx,
                events: in_tx,
            },
        )
    }
}

/// The far end of [`Transport::pair`].
pub struct TransportPeer {
    pub sent: UnboundedReceiver<String>,
    pub events: UnboundedSender<TransportEvent>,
}

impl TransportPeer {
    pub fn deliver(&self, frame: &Frame) {
        if let Ok(text) = frame.encode() {
            let _ = self.events.send(TransportEvent::Text(text));
        }
    }

    pub fn deliver_raw(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Text(text.to_string()));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(TransportEvent::Error(reason.to_string()));
    }

    pub fn close(&self) {
        let _ = self.events.send(TransportEvent::Closed);
    }

    /// Next frame the client sent; `None` once the client side hung up.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        while let Some(text) = self.sent.recv().await {
            if let Ok(frame) = Frame::decode(&text) {
                return Some(frame);
            }
        }
        None
    }

    /// Everything sent so far without waiting.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            if let Ok(frame) = Frame::decode(&text) {
                frames.push(frame);
            }
        }
        frames
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, session_id: &str, cookie: &AttachCookie) -> Result<Transport, AttachError>;
}

pub struct WsConnector {
    server: ServerUrl,
}

impl WsConnector {
    pub fn new(server: ServerUrl) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, session_id: &str, cookie: &AttachCookie) -> Result<Transport, AttachError> {
        let url = self.server.ws(&paths::attach_path(session_id));
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| AttachError::Transport(err.to_string()))?;
        let header = HeaderValue::from_str(&cookie.header_value())
            .map_err(|err| AttachError::Transport(err.to_string()))?;
        request.headers_mut().insert(COOKIE, header);

        debug!(target: "attach::transport", %url, "opening websocket");
        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(upgrade_error)?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                trace!(target: "attach::transport", bytes = text.len(), "send");
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(TransportEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(target: "attach::transport", ?frame, "server closed websocket");
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = in_tx.send(TransportEvent::Error(err.to_string()));
                        break;
                    }
                }
            }
            let _ = in_tx.send(TransportEvent::Closed);
        });

        Ok(Transport {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

fn upgrade_error(err: WsError) -> AttachError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .as_ref()
                .and_then(|bytes| serde_json::from_slice::<attach_proto::ErrorBody>(bytes).ok())
                .map(|body| body.error)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("upgrade rejected").to_string());
            AttachError::from_status(status.as_u16(), body)
        }
        other => AttachError::Transport(other.to_string()),
    }
}
