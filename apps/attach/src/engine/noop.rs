use attach_proto::GridSize;

use super::{
    EngineEvents, EngineError, EngineKind, InputCallback, ResizeCallback, Subscription, Surface,
    TerminalEngine,
};

/// Last resort of the selection chain. Renders nothing, never fails, and
/// reports a fixed 80x24 grid.
#[derive(Default)]
pub struct NoopEngine {
    events: EngineEvents,
}

impl NoopEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TerminalEngine for NoopEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Noop
    }

    fn mount(&mut self, _surface: Box<dyn Surface>) -> Result<(), EngineError> {
        Ok(())
    }

    fn write(&mut self, _bytes: &[u8]) {}

    fn resize(&mut self, _size: GridSize) {}

    fn fit(&mut self) -> GridSize {
        GridSize::DEFAULT
    }

    fn focus(&mut self) {}

    fn dimensions(&self) -> GridSize {
        GridSize::DEFAULT
    }

    fn on_input(&mut self, callback: InputCallback) -> Subscription {
        self.events.subscribe_input(callback)
    }

    fn on_resize(&mut self, callback: ResizeCallback) -> Subscription {
        self.events.subscribe_resize(callback)
    }

    fn dispose(&mut self) {
        self.events.close();
    }
}
