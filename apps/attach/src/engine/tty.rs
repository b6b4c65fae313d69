//! The local terminal as a surface, via crossterm.

use attach_proto::GridSize;
use crossterm::event::{
    self, DisableBracketedPaste, EnableBracketedPaste, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers,
};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, size as crossterm_size, EnterAlternateScreen,
    LeaveAlternateScreen,
};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::{EngineError, Surface, SurfaceEvent, SurfaceSink};

const EVENT_POLL: Duration = Duration::from_millis(50);

pub struct TtySurface {
    alternate_screen: bool,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    attached: bool,
}

impl TtySurface {
    pub fn new(alternate_screen: bool) -> Self {
        Self {
            alternate_screen,
            stop: Arc::new(AtomicBool::new(false)),
            reader: None,
            attached: false,
        }
    }

    fn restore(&self) -> io::Result<()> {
        let mut stdout = io::stdout();
        if self.alternate_screen {
            execute!(stdout, DisableBracketedPaste, LeaveAlternateScreen)?;
        } else {
            execute!(stdout, DisableBracketedPaste)?;
        }
        disable_raw_mode()
    }
}

impl Surface for TtySurface {
    fn attach(&mut self, sink: SurfaceSink) -> Result<(), EngineError> {
        if self.attached {
            return Err(EngineError::AlreadyMounted);
        }
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        let entered = if self.alternate_screen {
            execute!(stdout, EnterAlternateScreen, EnableBracketedPaste)
        } else {
            execute!(stdout, EnableBracketedPaste)
        };
        if let Err(err) = entered {
            let _ = disable_raw_mode();
            return Err(err.into());
        }
        self.attached = true;

        let stop = self.stop.clone();
        let reader = std::thread::Builder::new()
            .name("attach-tty-input".into())
            .spawn(move || read_events(stop, sink));
        match reader {
            Ok(handle) => {
                self.reader = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.detach();
                Err(err.into())
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), EngineError> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(bytes)?;
        stdout.flush()?;
        Ok(())
    }

    fn size(&self) -> GridSize {
        match crossterm_size() {
            Ok((cols, rows)) => GridSize::new(cols, rows),
            Err(_) => GridSize::DEFAULT,
        }
    }

    fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        self.stop.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Err(err) = self.restore() {
            warn!(target: "attach::tty", error = %err, "failed to restore terminal");
        }
    }
}

impl Drop for TtySurface {
    fn drop(&mut self) {
        self.detach();
    }
}

fn read_events(stop: Arc<AtomicBool>, sink: SurfaceSink) {
    while !stop.load(Ordering::SeqCst) {
        match event::poll(EVENT_POLL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                debug!(target: "attach::tty", error = %err, "event poll failed");
                break;
            }
        }
        match event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => {
                if let Some(bytes) = encode_key_event(key) {
                    sink(SurfaceEvent::Input(bytes));
                } else {
                    trace!(target: "attach::tty", ?key, "unmapped key");
                }
            }
            Ok(Event::Paste(data)) => sink(SurfaceEvent::Input(data.into_bytes())),
            Ok(Event::Resize(cols, rows)) => sink(SurfaceEvent::Resize(GridSize::new(cols, rows))),
            Ok(_) => {}
            Err(err) => {
                debug!(target: "attach::tty", error = %err, "event read failed");
                break;
            }
        }
    }
}

/// Control byte for `Ctrl+<c>`. Raw-mode terminals report the punctuation
/// controls as digits (Ctrl-] arrives as Ctrl-5), so both spellings map.
fn control_byte(c: char) -> Option<u8> {
    let lower = c.to_ascii_lowercase();
    if lower.is_ascii_lowercase() {
        return Some(lower as u8 - b'a' + 1);
    }
    match lower {
        ' ' | '@' | '2' => Some(0x00),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(0x1c),
        ']' | '5' => Some(0x1d),
        '^' | '6' => Some(0x1e),
        '_' | '/' | '7' => Some(0x1f),
        _ => None,
    }
}

pub fn encode_key_event(key: KeyEvent) -> Option<Vec<u8>> {
    match key.code {
        KeyCode::Char(c) => {
            let mut bytes = Vec::new();
            if key.modifiers.contains(KeyModifiers::ALT) {
                bytes.push(0x1b);
            }
            if key.modifiers.contains(KeyModifiers::CONTROL) {
                bytes.push(control_byte(c)?);
            } else {
                let mut buf = [0u8; 4];
                bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
            Some(bytes)
        }
        // LF rather than CR: some PTYs do not map CR to NL on input.
        KeyCode::Enter => Some(vec![b'\n']),
        KeyCode::Tab => Some(vec![b'\t']),
        KeyCode::BackTab => Some(b"\x1b[Z".to_vec()),
        KeyCode::Backspace => Some(vec![0x7f]),
        KeyCode::Esc => Some(vec![0x1b]),
        KeyCode::Up => Some(b"\x1b[A".to_vec()),
        KeyCode::Down => Some(b"\x1b[B".to_vec()),
        KeyCode::Right => Some(b"\x1b[C".to_vec()),
        KeyCode::Left => Some(b"\x1b[D".to_vec()),
        KeyCode::Home => Some(b"\x1b[H".to_vec()),
        KeyCode::End => Some(b"\x1b[F".to_vec()),
        KeyCode::PageUp => Some(b"\x1b[5~".to_vec()),
        KeyCode::PageDown => Some(b"\x1b[6~".to_vec()),
        KeyCode::Delete => Some(b"\x1b[3~".to_vec()),
        KeyCode::Insert => Some(b"\x1b[2~".to_vec()),
        KeyCode::F(n) => function_key(n),
        _ => None,
    }
}

fn function_key(n: u8) -> Option<Vec<u8>> {
    let seq: &[u8] = match n {
        1 => b"\x1bOP",
        2 => b"\x1bOQ",
        3 => b"\x1bOR",
        4 => b"\x1bOS",
        5 => b"\x1b[15~",
        6 => b"\x1b[17~",
        7 => b"\x1b[18~",
        8 => b"\x1b[19~",
        9 => b"\x1b[20~",
        10 => b"\x1b[21~",
        11 => b"\x1b[23~",
        12 => b"\x1b[24~",
        _ => return None,
    };
    Some(seq.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test_timeout::timeout]
    fn control_letters_and_escape_prefix() {
        assert_eq!(
            encode_key_event(key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(vec![0x03])
        );
        assert_eq!(
            encode_key_event(key(KeyCode::Char(']'), KeyModifiers::CONTROL)),
            Some(vec![0x1d])
        );
        assert_eq!(
            encode_key_event(key(KeyCode::Char('5'), KeyModifiers::CONTROL)),
            Some(vec![0x1d])
        );
        assert_eq!(encode_key_event(key(KeyCode::Char('!'), KeyModifiers::CONTROL)), None);
    }

    #[test_timeout::timeout]
    fn printable_and_navigation_keys() {
        assert_eq!(
            encode_key_event(key(KeyCode::Char('é'), KeyModifiers::NONE)),
            Some("é".as_bytes().to_vec())
        );
        assert_eq!(
            encode_key_event(key(KeyCode::Char('x'), KeyModifiers::ALT)),
            Some(vec![0x1b, b'x'])
        );
        assert_eq!(
            encode_key_event(key(KeyCode::Up, KeyModifiers::NONE)),
            Some(b"\x1b[A".to_vec())
        );
        assert_eq!(
            encode_key_event(key(KeyCode::F(5), KeyModifiers::NONE)),
            Some(b"\x1b[15~".to_vec())
        );
        assert_eq!(encode_key_event(key(KeyCode::CapsLock, KeyModifiers::NONE)), None);
    }
}
