use attach_proto::GridSize;
use std::io::Write as _;
use tracing::{debug, trace, warn};

use super::{
    EngineEvents, EngineError, EngineKind, InputCallback, ResizeCallback, Subscription, Surface,
    TerminalEngine,
};

pub const DEFAULT_SCROLLBACK: usize = 1_000;

/// Keeps a vt100 model of the remote screen and paints only what changed
/// since the last frame. A resize repaints everything.
pub struct EmulatorEngine {
    events: EngineEvents,
    surface: Option<Box<dyn Surface>>,
    parser: vt100::Parser,
    painted: Option<vt100::Screen>,
    size: GridSize,
    disposed: bool,
}

impl EmulatorEngine {
    pub fn new(scrollback: usize) -> Self {
        let size = GridSize::DEFAULT;
        Self {
            events: EngineEvents::default(),
            surface: None,
            parser: vt100::Parser::new(size.rows, size.cols, scrollback),
            painted: None,
            size,
            disposed: false,
        }
    }

    /// Plain text of the visible screen.
    pub fn screen_text(&self) -> String {
        self.parser.screen().contents()
    }

    fn paint(&mut self, full: bool) {
        let Some(surface) = self.surface.as_mut() else {
            return;
        };
        let screen = self.parser.screen();
        let mut frame = Vec::new();
        match (&self.painted, full) {
            (Some(previous), false) => frame.extend(screen.contents_diff(previous)),
            _ => {
                frame.extend_from_slice(b"\x1b[H\x1b[2J");
                frame.extend(screen.contents_formatted());
            }
        }
        let (row, col) = screen.cursor_position();
        let _ = write!(frame, "\x1b[{};{}H", row + 1, col + 1);
        frame.extend_from_slice(if screen.hide_cursor() {
            b"\x1b[?25l"
        } else {
            b"\x1b[?25h"
        });

        trace!(target: "attach::engine", bytes = frame.len(), full, "paint");
        if let Err(err) = surface.write(&frame) {
            warn!(target: "attach::engine", error = %err, "surface write failed");
        }
        self.painted = Some(screen.clone());
    }
}

impl Default for EmulatorEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SCROLLBACK)
    }
}

impl TerminalEngine for EmulatorEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Emulator
    }

    fn mount(&mut self, mut surface: Box<dyn Surface>) -> Result<(), EngineError> {
        if self.surface.is_some() {
            return Err(EngineError::AlreadyMounted);
        }
        surface.attach(self.events.sink())?;
        let measured = surface.size();
        if measured.is_known() {
            self.size = measured;
            self.parser.screen_mut().set_size(measured.rows, measured.cols);
        }
        self.surface = Some(surface);
        self.paint(true);
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) {
        if bytes.is_empty() || self.disposed {
            return;
        }
        self.parser.process(bytes);
        self.paint(false);
    }

    fn resize(&mut self, size: GridSize) {
        if !size.is_known() || size == self.size || self.disposed {
            return;
        }
        debug!(target: "attach::engine", from = %self.size, to = %size, "emulator resize");
        self.size = size;
        self.parser.screen_mut().set_size(size.rows, size.cols);
        self.paint(true);
    }

    fn fit(&mut self) -> GridSize {
        let measured = match self.surface.as_ref() {
            Some(surface) => surface.size(),
            None => return self.size,
        };
        if measured.is_known() && measured != self.size {
            self.resize(measured);
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
        self.painted = None;
        if let Some(mut surface) = self.surface.take() {
            surface.detach();
        }
    }
}

impl Drop for EmulatorEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemorySurface;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn mounted(size: GridSize) -> (EmulatorEngine, MemorySurface) {
        let surface = MemorySurface::new(size);
        let mut engine = EmulatorEngine::new(100);
        engine.mount(Box::new(surface.clone())).unwrap();
        (engine, surface)
    }

    #[test_timeout::timeout]
    fn mount_adopts_surface_size() {
        let (engine, surface) = mounted(GridSize::new(100, 30));
        assert_eq!(engine.dimensions(), GridSize::new(100, 30));
        assert!(surface.is_attached());
    }

    #[test_timeout::timeout]
    fn output_is_modelled_and_painted() {
        let (mut engine, surface) = mounted(GridSize::new(40, 5));
        surface.clear_output();
        engine.write(b"hello\r\nworld");
        assert!(engine.screen_text().starts_with("hello\nworld"));
        let painted = surface.output_lossy();
        assert!(painted.contains("hello"));
        assert!(painted.contains("world"));
    }

    #[test_timeout::timeout]
    fn resize_repaints_whole_screen() {
        let (mut engine, surface) = mounted(GridSize::new(40, 5));
        engine.write(b"prompt$ ");
        surface.clear_output();

        engine.resize(GridSize::new(60, 10));
        assert_eq!(engine.dimensions(), GridSize::new(60, 10));
        let painted = surface.output_lossy();
        assert!(painted.starts_with("\x1b[H\x1b[2J"));
        assert!(painted.contains("prompt$"));

        surface.clear_output();
        engine.resize(GridSize::new(60, 10));
        assert!(surface.output().is_empty());
    }

    #[test_timeout::timeout]
    fn fit_reports_new_surface_size() {
        let (mut engine, surface) = mounted(GridSize::new(80, 24));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = engine.on_resize(Box::new(move |size| sink.lock().push(size)));

        surface.set_measured_size(GridSize::new(120, 40));
        assert_eq!(engine.fit(), GridSize::new(120, 40));
        assert_eq!(engine.fit(), GridSize::new(120, 40));
        assert_eq!(*seen.lock(), vec![GridSize::new(120, 40)]);
    }

    #[test_timeout::timeout]
    fn dispose_detaches_surface_and_is_idempotent() {
        let (mut engine, surface) = mounted(GridSize::new(80, 24));
        let fired = Arc::new(Mutex::new(0));
        let counter = fired.clone();
        let _sub = engine.on_input(Box::new(move |_| *counter.lock() += 1));

        engine.dispose();
        engine.dispose();
        assert!(!surface.is_attached());

        surface.type_bytes(b"x");
        engine.write(b"ignored");
        assert_eq!(*fired.lock(), 0);
    }
}
