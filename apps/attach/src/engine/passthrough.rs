use attach_proto::GridSize;
use tracing::{debug, warn};

use super::{
    EngineEvents, EngineError, EngineKind, InputCallback, ResizeCallback, Subscription, Surface,
    TerminalEngine,
};

/// Writes remote output straight to the surface. The local terminal does all
/// of the interpretation, so fidelity depends on it matching the remote grid.
pub struct PassthroughEngine {
    events: EngineEvents,
    surface: Option<Box<dyn Surface>>,
    size: GridSize,
    disposed: bool,
}

impl Default for PassthroughEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PassthroughEngine {
    pub fn new() -> Self {
        Self {
            events: EngineEvents::default(),
            surface: None,
            size: GridSize::DEFAULT,
            disposed: false,
        }
    }
}

impl TerminalEngine for PassthroughEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Passthrough
    }

    fn mount(&mut self, mut surface: Box<dyn Surface>) -> Result<(), EngineError> {
        if self.surface.is_some() {
            return Err(EngineError::AlreadyMounted);
        }
        surface.attach(self.events.sink())?;
        let measured = surface.size();
        if measured.is_known() {
            self.size = measured;
        }
        self.surface = Some(surface);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) {
        let Some(surface) = self.surface.as_mut() else {
            return;
        };
        if let Err(err) = surface.write(bytes) {
            warn!(target: "attach::engine", error = %err, "surface write failed");
        }
    }

    fn resize(&mut self, size: GridSize) {
        if size.is_known() {
            self.size = size;
        }
    }

    fn fit(&mut self) -> GridSize {
        let Some(surface) = self.surface.as_ref() else {
            return self.size;
        };
        let measured = surface.size();
        if measured.is_known() && measured != self.size {
            debug!(target: "attach::engine", size = %measured, "surface resized");
            self.size = measured;
            self.events.resize.emit(&measured);
        }
        self.size
    }

    fn focus(&mut self) {
        if let Some(surface) = self.surface.as_mut() {
            surface.focus();
        }
    }

    fn dimensions(&self) -> GridSize {
        self.size
    }

    fn on_input(&mut self, callback: InputCallback) -> Subscription {
        self.events.subscribe_input(callback)
    }

    fn on_resize(&mut self, callback: ResizeCallback) -> Subscription {
        self.events.subscribe_resize(callback)
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.events.close();
        if let Some(mut surface) = self.surface.take() {
            surface.detach();
        }
    }
}

impl Drop for PassthroughEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}
