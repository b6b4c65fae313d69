//! A surface that keeps everything in memory, for headless embedding.

use attach_proto::GridSize;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{EngineError, Surface, SurfaceEvent, SurfaceSink};

#[derive(Default)]
struct Shared {
    output: Vec<u8>,
    sink: Option<SurfaceSink>,
    attached: bool,
    detached: bool,
    focused: bool,
    attach_input: Vec<Vec<u8>>,
}

/// In-memory surface. Clones share state, so a test can keep a handle while
/// the engine owns the boxed surface.
#[derive(Clone)]
pub struct MemorySurface {
    size: Arc<Mutex<GridSize>>,
    shared: Arc<Mutex<Shared>>,
}

impl MemorySurface {
    pub fn new(size: GridSize) -> Self {
        Self {
            size: Arc::new(Mutex::new(size)),
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Input delivered synchronously from inside `attach`.
    pub fn with_input_on_attach(self, bytes: &[u8]) -> Self {
        self.shared.lock().attach_input.push(bytes.to_vec());
        self
    }

    pub fn output(&self) -> Vec<u8> {
        self.shared.lock().output.clone()
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output()).into_owned()
    }

    pub fn clear_output(&self) {
        self.shared.lock().output.clear();
    }

    pub fn is_attached(&self) -> bool {
        let shared = self.shared.lock();
        shared.attached && !shared.detached
    }

    pub fn is_focused(&self) -> bool {
        self.shared.lock().focused
    }

    /// Simulates a keystroke on the surface.
    pub fn type_bytes(&self, bytes: &[u8]) {
        self.emit(SurfaceEvent::Input(bytes.to_vec()));
    }

    /// Changes the measured size and tells the attached engine.
    pub fn set_size(&self, size: GridSize) {
        *self.size.lock() = size;
        self.emit(SurfaceEvent::Resize(size));
    }

    /// Changes the measured size without telling anyone, as a terminal
    /// that never reports resizes would.
    pub fn set_measured_size(&self, size: GridSize) {
        *self.size.lock() = size;
    }

    fn emit(&self, event: SurfaceEvent) {
        let sink = self.shared.lock().sink.clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }
}

impl Surface for MemorySurface {
    fn attach(&mut self, sink: SurfaceSink) -> Result<(), EngineError> {
        let pending = {
            let mut shared = self.shared.lock();
            shared.sink = Some(sink.clone());
            shared.attached = true;
            std::mem::take(&mut shared.attach_input)
        };
        for bytes in pending {
            sink(SurfaceEvent::Input(bytes));
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        self.shared.lock().output.extend_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> GridSize {
        *self.size.lock()
    }

    fn focus(&mut self) {
        self.shared.lock().focused = true;
    }

    fn detach(&mut self) {
        let mut shared = self.shared.lock();
        shared.sink = None;
        shared.detached = true;
    }
}
