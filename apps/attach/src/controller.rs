//! Routes frames between the connection and the terminal engine.
//!
//! One task owns the engine, the arbitration state and the resize
//! coalescer. Engine callbacks only enqueue local events for that task.

use attach_proto::{Frame, GridSize, Role};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

use crate::arbitration::{Arbitration, RoleChange};
use crate::engine::memory::MemorySurface;
use crate::engine::{EngineKind, NoopEngine, Subscription, Surface, TerminalEngine};
use crate::lifecycle::Connection;
use crate::resize::ResizeCoalescer;
use crate::transport::TransportEvent;

/// Ctrl-]
pub const ESCAPE_PREFIX: u8 = 0x1d;

/// Notifications for whatever UI surrounds the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    RoleChanged(Role),
    ProtocolError(String),
    BackendClosed,
    TransportError(String),
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Detached,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerOptions {
    pub read_only: bool,
    /// Ask for the lease as soon as the session greets us.
    pub take_control: bool,
    pub escape_keys: bool,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct EscapeOutcome {
    pub forward: Vec<u8>,
    pub request_control: bool,
    pub detach: bool,
}

/// Strips the local escape sequences out of typed input.
#[derive(Debug, Default)]
pub struct EscapeKeys {
    enabled: bool,
    armed: bool,
}

impl EscapeKeys {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            armed: false,
        }
    }

    /// Bytes after a detach are discarded.
    pub fn feed(&mut self, bytes: &[u8]) -> EscapeOutcome {
        let mut outcome = EscapeOutcome::default();
        if !self.enabled {
            outcome.forward.extend_from_slice(bytes);
            return outcome;
        }
        for &byte in bytes {
            if !self.armed {
                if byte == ESCAPE_PREFIX {
                    self.armed = true;
                } else {
                    outcome.forward.push(byte);
                }
                continue;
            }
            self.armed = false;
            match byte {
                b'd' | b'D' => {
                    outcome.detach = true;
                    break;
                }
                b'c' | b'C' => outcome.request_control = true,
                ESCAPE_PREFIX => outcome.forward.push(ESCAPE_PREFIX),
                other => {
                    outcome.forward.push(ESCAPE_PREFIX);
                    outcome.forward.push(other);
                }
            }
        }
        outcome
    }
}

enum LocalEvent {
    Input(Vec<u8>),
    Resize(GridSize),
}

enum Flow {
    Continue,
    Detach,
}

pub struct SessionController {
    engine: Box<dyn TerminalEngine>,
    subscriptions: Vec<Subscription>,
    local_rx: UnboundedReceiver<LocalEvent>,
    arbitration: Arbitration,
    coalescer: ResizeCoalescer,
    escape: EscapeKeys,
    options: ControllerOptions,
    events: UnboundedSender<SessionEvent>,
    greeted: bool,
    disposed: bool,
}

impl SessionController {
    /// Registers the engine listeners, then mounts the engine on `surface`.
    /// An engine that fails to mount is swapped for the no-op engine.
    pub fn mount(
        engine: Box<dyn TerminalEngine>,
        surface: Box<dyn Surface>,
        options: ControllerOptions,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let mut controller = Self {
            engine,
            subscriptions: Vec::new(),
            local_rx,
            arbitration: Arbitration::new(options.read_only),
            coalescer: ResizeCoalescer::default(),
            escape: EscapeKeys::new(options.escape_keys),
            options,
            events,
            greeted: false,
            disposed: false,
        };
        controller.subscribe(&local_tx);
        if let Err(err) = controller.engine.mount(surface) {
            warn!(
                target: "attach::controller",
                engine = %controller.engine.kind(),
                error = %err,
                "engine failed to mount; using no-op engine"
            );
            controller.release_engine();
            controller.engine = Box::new(NoopEngine::new());
            controller.subscribe(&local_tx);
            let _ = controller
                .engine
                .mount(Box::new(MemorySurface::new(GridSize::DEFAULT)));
        }
        controller
    }

    fn subscribe(&mut self, local_tx: &UnboundedSender<LocalEvent>) {
        let input_tx = local_tx.clone();
        self.subscriptions.push(self.engine.on_input(Box::new(move |bytes| {
            let _ = input_tx.send(LocalEvent::Input(bytes.to_vec()));
        })));
        let resize_tx = local_tx.clone();
        self.subscriptions.push(self.engine.on_resize(Box::new(move |size| {
            let _ = resize_tx.send(LocalEvent::Resize(size));
        })));
    }

    pub fn engine_kind(&self) -> EngineKind {
        self.engine.kind()
    }

    pub fn dimensions(&self) -> GridSize {
        self.engine.dimensions()
    }

    pub fn arbitration(&self) -> &Arbitration {
        &self.arbitration
    }

    /// Drives the session until the transport closes or the user detaches.
    pub async fn run(mut self, mut connection: Connection) -> SessionEnd {
        self.engine.focus();
        self.marker("[connected]");
        self.emit(SessionEvent::Connected);

        let mut failed = false;
        let end = loop {
            let deadline = self.coalescer.deadline().map(tokio::time::Instant::from_std);
            tokio::select! {
                event = connection.next_event() => match event {
                    Some(TransportEvent::Text(text)) => self.on_text(&text, &connection),
                    Some(TransportEvent::Error(reason)) => {
                        failed = true;
                        connection.on_transport_error(&reason);
                        self.marker(&format!("[error] {reason}"));
                        self.emit(SessionEvent::TransportError(reason));
                    }
                    Some(TransportEvent::Closed) | None => {
                        connection.on_closed();
                        break if failed { SessionEnd::Failed } else { SessionEnd::Disconnected };
                    }
                },
                Some(local) = self.local_rx.recv() => {
                    if let Flow::Detach = self.on_local(local, &connection) {
                        info!(target: "attach::controller", "detached by user");
                        connection.close();
                        break SessionEnd::Detached;
                    }
                }
                _ = sleep_until(deadline), if deadline.is_some() => self.flush_resize(&connection),
            }
        };

        self.marker("[disconnected]");
        self.emit(SessionEvent::Disconnected);
        self.dispose();
        end
    }

    /// Leaves a visible marker for a session that never connected.
    pub fn abort(mut self, reason: &str) {
        self.marker(&format!("[error] {reason}"));
        self.dispose();
    }

    fn on_text(&mut self, text: &str, connection: &Connection) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target: "attach::controller", error = %err, "dropping undecodable frame");
                return;
            }
        };
        match frame {
            Frame::Stdout { data } => self.engine.write(data.as_bytes()),
            Frame::Hello { .. } => {
                let change = self.arbitration.apply(&frame);
                let role = self.arbitration.role();
                self.marker(&format!("[{role}]"));
                if change.is_some() || !self.greeted {
                    self.emit(SessionEvent::RoleChanged(role));
                }
                if !self.greeted {
                    self.greeted = true;
                    if self.options.take_control && role != Role::Driver {
                        self.request_control(connection);
                    }
                }
            }
            Frame::State { .. } => {
                if let Some(change) = self.arbitration.apply(&frame) {
                    let role = match change {
                        RoleChange::Gained => Role::Driver,
                        RoleChange::Lost => Role::Viewer,
                    };
                    self.marker(&format!("[{role}]"));
                    self.emit(SessionEvent::RoleChanged(role));
                }
            }
            Frame::Error { message } => {
                self.marker(&format!("[error] {message}"));
                self.emit(SessionEvent::ProtocolError(message));
            }
            Frame::BackendClosed => {
                self.marker("[backend closed]");
                self.emit(SessionEvent::BackendClosed);
            }
            other => {
                trace!(target: "attach::controller", kind = other.kind(), "ignoring frame meant for the server");
            }
        }
    }

    fn on_local(&mut self, event: LocalEvent, connection: &Connection) -> Flow {
        match event {
            LocalEvent::Input(bytes) => {
                let outcome = self.escape.feed(&bytes);
                if let Some(frame) = self.arbitration.gate_input(&outcome.forward) {
                    connection.send(&frame);
                } else if !outcome.forward.is_empty() {
                    trace!(target: "attach::controller", bytes = outcome.forward.len(), "input kept local");
                }
                if outcome.request_control {
                    self.request_control(connection);
                }
                if outcome.detach {
                    return Flow::Detach;
                }
            }
            LocalEvent::Resize(size) => self.coalescer.notify(size, now()),
        }
        Flow::Continue
    }

    fn request_control(&mut self, connection: &Connection) {
        match self.arbitration.request_control() {
            Some(frame) => {
                debug!(target: "attach::controller", "requesting control");
                connection.send(&frame);
            }
            None => self.marker("[read-only]"),
        }
    }

    fn flush_resize(&mut self, connection: &Connection) {
        if let Some(size) = self.coalescer.poll(now()) {
            self.engine.resize(size);
            connection.send(&Frame::resize(size));
        }
    }

    fn marker(&mut self, text: &str) {
        self.engine.write(format!("\r\n{text}\r\n").as_bytes());
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn release_engine(&mut self) {
        for mut subscription in self.subscriptions.drain(..) {
            subscription.dispose();
        }
        self.engine.dispose();
    }

    /// Listener subscriptions first, then the engine. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.release_engine();
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
