//! Connection lifecycle: authenticate, open the transport, keep it alive,
//! and publish every status change.

use attach_proto::{ConnectionStatus, Frame, GridSize, Role, StatusReport, KEEPALIVE_INTERVAL};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::auth::Authenticator;
use crate::error::AttachError;
use crate::transport::{Connector, Transport, TransportEvent};

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: KEEPALIVE_INTERVAL,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// The status state machine on its own. `disconnected` and `error` are
/// terminal: once there, every further transition is absorbed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lifecycle {
    status: ConnectionStatus,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Moves to `to`. `Ok(false)` means the machine was already terminal
    /// and nothing changed.
    pub fn advance(&mut self, to: ConnectionStatus) -> Result<bool, InvalidTransition> {
        use ConnectionStatus::*;
        let from = self.status;
        if from.is_terminal() {
            return Ok(false);
        }
        let allowed = matches!(
            (from, to),
            (Initializing, Authenticating)
                | (Authenticating, Connecting)
                | (Connecting, Connected)
                | (_, Disconnected)
                | (_, Error)
        );
        if !allowed {
            return Err(InvalidTransition { from, to });
        }
        self.status = to;
        Ok(true)
    }
}

/// Lifecycle plus the watch channel it publishes to.
#[derive(Debug)]
struct StatusTracker {
    lifecycle: Lifecycle,
    tx: watch::Sender<StatusReport>,
}

impl StatusTracker {
    fn new(tx: watch::Sender<StatusReport>) -> Self {
        let tracker = Self {
            lifecycle: Lifecycle::new(),
            tx,
        };
        tracker.publish(StatusReport::new(ConnectionStatus::Initializing));
        tracker
    }

    fn publish(&self, report: StatusReport) {
        self.tx.send_replace(report);
    }

    fn advance(&mut self, to: ConnectionStatus) -> bool {
        match self.lifecycle.advance(to) {
            Ok(true) => {
                debug!(target: "attach::lifecycle", status = %to, "status changed");
                self.publish(StatusReport::new(to));
                true
            }
            Ok(false) => false,
            Err(err) => {
                warn!(target: "attach::lifecycle", error = %err, "ignoring status change");
                false
            }
        }
    }

    fn fail(&mut self, reason: &str) -> bool {
        if matches!(self.lifecycle.advance(ConnectionStatus::Error), Ok(true)) {
            warn!(target: "attach::lifecycle", reason, "connection failed");
            self.publish(StatusReport::failed(reason));
            true
        } else {
            false
        }
    }

    fn status(&self) -> ConnectionStatus {
        self.lifecycle.status()
    }
}

#[derive(Debug, Clone)]
pub struct AttachTarget {
    pub session_id: String,
    pub role: Role,
}

/// Runs the handshake and opens the transport. Authentication always
/// finishes before the transport is attempted; any failure ends in `error`.
pub async fn connect(
    authenticator: &dyn Authenticator,
    connector: &dyn Connector,
    target: &AttachTarget,
    initial_size: GridSize,
    config: &LifecycleConfig,
    status: watch::Sender<StatusReport>,
) -> Result<Connection, AttachError> {
    let mut tracker = StatusTracker::new(status);

    tracker.advance(ConnectionStatus::Authenticating);
    let cookie = match authenticator.authenticate(&target.session_id, target.role).await {
        Ok(cookie) => cookie,
        Err(err) => {
            tracker.fail(&err.to_string());
            return Err(err);
        }
    };
    debug!(target: "attach::lifecycle", ?cookie, "attach cookie issued");

    tracker.advance(ConnectionStatus::Connecting);
    let opened = tokio::time::timeout(
        config.connect_timeout,
        connector.connect(&target.session_id, &cookie),
    )
    .await;
    let transport = match opened {
        Ok(Ok(transport)) => transport,
        Ok(Err(err)) => {
            tracker.fail(&err.to_string());
            return Err(err);
        }
        Err(_) => {
            let err = AttachError::Timeout("opening the transport");
            tracker.fail(&err.to_string());
            return Err(err);
        }
    };

    tracker.advance(ConnectionStatus::Connected);
    info!(
        target: "attach::lifecycle",
        session_id = %target.session_id,
        client_id = %cookie.client_id,
        role = %cookie.role,
        "connected"
    );
    Ok(Connection::start(transport, tracker, initial_size, config.keepalive_interval))
}

/// An open connection. Owns the keepalive timer; teardown runs at most once.
pub struct Connection {
    outgoing: Option<UnboundedSender<String>>,
    incoming: UnboundedReceiver<TransportEvent>,
    tracker: StatusTracker,
    keepalive: Option<JoinHandle<()>>,
}

impl Connection {
    /// Wraps a transport that is already open and authorized, e.g. one
    /// handed over by an embedding application.
    pub fn established(
        transport: Transport,
        status: watch::Sender<StatusReport>,
        initial_size: GridSize,
        config: &LifecycleConfig,
    ) -> Self {
        let mut tracker = StatusTracker::new(status);
        for step in [
            ConnectionStatus::Authenticating,
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
        ] {
            tracker.advance(step);
        }
        Self::start(transport, tracker, initial_size, config.keepalive_interval)
    }

    fn start(
        transport: Transport,
        tracker: StatusTracker,
        initial_size: GridSize,
        keepalive_interval: Duration,
    ) -> Self {
        let connection = Self {
            outgoing: Some(transport.outgoing.clone()),
            incoming: transport.incoming,
            tracker,
            keepalive: Some(spawn_keepalive(transport.outgoing, keepalive_interval)),
        };
        if initial_size.is_known() {
            connection.send(&Frame::resize(initial_size));
        }
        connection
    }

    pub fn status(&self) -> ConnectionStatus {
        self.tracker.status()
    }

    /// Queues a frame. Failures are swallowed; a dead transport shows up as
    /// a close event instead.
    pub fn send(&self, frame: &Frame) -> bool {
        let Some(outgoing) = self.outgoing.as_ref() else {
            return false;
        };
        match frame.encode() {
            Ok(text) => outgoing.send(text).is_ok(),
            Err(err) => {
                warn!(target: "attach::lifecycle", error = %err, kind = frame.kind(), "failed to encode frame");
                false
            }
        }
    }

    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.incoming.recv().await
    }

    /// Surfaces a transport error. Cleanup waits for the close path.
    pub fn on_transport_error(&mut self, reason: &str) {
        self.tracker.fail(reason);
    }

    /// The transport closed under us.
    pub fn on_closed(&mut self) {
        self.tracker.advance(ConnectionStatus::Disconnected);
        self.teardown();
    }

    /// Local close, e.g. the user detached.
    pub fn close(&mut self) {
        self.tracker.advance(ConnectionStatus::Disconnected);
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        if self.outgoing.take().is_some() {
            debug!(target: "attach::lifecycle", "transport released");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn spawn_keepalive(outgoing: UnboundedSender<String>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(text) = Frame::Keepalive.encode() else {
            return;
        };
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            trace!(target: "attach::lifecycle", "keepalive");
            if outgoing.send(text.clone()).is_err() {
                break;
            }
        }
    })
}
