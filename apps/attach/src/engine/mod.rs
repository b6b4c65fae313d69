//! Terminal rendering engines behind one interface, plus the surfaces they
//! draw on and the chain that picks one at startup.

mod emulator;
mod hub;
pub mod memory;
mod noop;
mod passthrough;
mod select;
pub mod tty;

use attach_proto::GridSize;
use std::sync::Arc;
use thiserror::Error;

pub use emulator::{EmulatorEngine, DEFAULT_SCROLLBACK};
pub use hub::{EventHub, Subscription};
pub use noop::NoopEngine;
pub use passthrough::PassthroughEngine;
pub use select::{default_chain, select_engine, EngineCandidate, EngineChoice, EngineFuture};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Unsupported(&'static str),
    #[error("engine already mounted")]
    AlreadyMounted,
    #[error("surface error: {0}")]
    Surface(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Emulator,
    Passthrough,
    Noop,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Emulator => "emulator",
            EngineKind::Passthrough => "passthrough",
            EngineKind::Noop => "noop",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something a surface reports back to whoever attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceEvent {
    Input(Vec<u8>),
    Resize(GridSize),
}

pub type SurfaceSink = Arc<dyn Fn(SurfaceEvent) + Send + Sync>;

/// Where an engine renders: the local terminal, or memory in tests.
///
/// `attach` may deliver events through the sink before it returns, so
/// engines register their listeners first.
pub trait Surface: Send {
    fn attach(&mut self, sink: SurfaceSink) -> Result<(), EngineError>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), EngineError>;
    fn size(&self) -> GridSize;
    fn focus(&mut self) {}
    fn detach(&mut self);
}

pub type InputCallback = Box<dyn Fn(&[u8]) + Send + Sync>;
pub type ResizeCallback = Box<dyn Fn(GridSize) + Send + Sync>;

/// Uniform capability surface over a rendering engine. Nothing here knows
/// about the wire protocol.
pub trait TerminalEngine: Send {
    fn kind(&self) -> EngineKind;

    /// Binds the engine to its surface. Listeners registered before this
    /// call see every event, including ones the surface emits while
    /// attaching.
    fn mount(&mut self, surface: Box<dyn Surface>) -> Result<(), EngineError>;

    fn write(&mut self, bytes: &[u8]);

    fn resize(&mut self, size: GridSize);

    /// Re-measures the surface; fires resize listeners when the grid changed.
    fn fit(&mut self) -> GridSize;

    fn focus(&mut self);

    fn dimensions(&self) -> GridSize;

    fn on_input(&mut self, callback: InputCallback) -> Subscription;

    fn on_resize(&mut self, callback: ResizeCallback) -> Subscription;

    /// Releases listeners, then addons, then the surface. Safe to call twice.
    fn dispose(&mut self);
}

/// The listener hubs every engine owns, wired to a surface sink.
#[derive(Clone, Default)]
pub(crate) struct EngineEvents {
    pub input: EventHub<Vec<u8>>,
    pub resize: EventHub<GridSize>,
}

impl EngineEvents {
    pub fn sink(&self) -> SurfaceSink {
        let events = self.clone();
        Arc::new(move |event| match event {
            SurfaceEvent::Input(bytes) => events.input.emit(&bytes),
            SurfaceEvent::Resize(size) => events.resize.emit(&size),
        })
    }

    pub fn subscribe_input(&self, callback: InputCallback) -> Subscription {
        self.input.subscribe(move |bytes: &Vec<u8>| callback(bytes))
    }

    pub fn subscribe_resize(&self, callback: ResizeCallback) -> Subscription {
        self.resize.subscribe(move |size: &GridSize| callback(*size))
    }

    pub fn close(&self) {
        self.input.close();
        self.resize.close();
    }
}
