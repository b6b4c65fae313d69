use attach_proto::GridSize;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Ctrl-D ends a loopback workload.
const LOOPBACK_EOF: u8 = 0x04;

/// How the terminal behind a session is produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkloadSpec {
    /// A local process on a pseudo terminal. An empty command runs the
    /// user's default shell.
    Pty {
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    /// Echoes input back as output.
    Loopback {
        #[serde(default)]
        banner: Option<String>,
    },
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        WorkloadSpec::Pty {
            command: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadEvent {
    Output(Vec<u8>),
    Exited,
}

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("failed to start workload: {0}")]
    Spawn(String),
    #[error("workload io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("workload resize failed: {0}")]
    Resize(String),
    #[error("workload has exited")]
    Closed,
}

/// A running terminal workload. Output arrives on the receiver handed out
/// at launch.
pub trait Workload: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<(), WorkloadError>;
    fn resize(&self, size: GridSize) -> Result<(), WorkloadError>;
    fn terminate(&self);
}

pub struct Launched {
    pub workload: Arc<dyn Workload>,
    pub events: mpsc::UnboundedReceiver<WorkloadEvent>,
}

/// Stands in for the orchestration layer that owns workloads.
pub trait WorkloadLauncher: Send + Sync {
    fn launch(
        &self,
        session_id: &str,
        spec: &WorkloadSpec,
        size: GridSize,
    ) -> Result<Launched, WorkloadError>;
}

/// Launches whatever the configured `WorkloadSpec` describes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpecLauncher;

impl WorkloadLauncher for SpecLauncher {
    fn launch(
        &self,
        session_id: &str,
        spec: &WorkloadSpec,
        size: GridSize,
    ) -> Result<Launched, WorkloadError> {
        debug!(session_id = %session_id, ?spec, %size, "launching workload");
        match spec {
            WorkloadSpec::Pty { command, cwd, env } => {
                PtyWorkload::spawn(command, cwd.as_ref(), env, size)
            }
            WorkloadSpec::Loopback { banner } => Ok(LoopbackWorkload::start(banner.as_deref())),
        }
    }
}

pub struct PtyWorkload {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

impl PtyWorkload {
    pub fn spawn(
        command: &[String],
        cwd: Option<&PathBuf>,
        env: &BTreeMap<String, String>,
        size: GridSize,
    ) -> Result<Launched, WorkloadError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(size))
            .map_err(|err| WorkloadError::Spawn(err.to_string()))?;

        let mut cmd = match command.split_first() {
            Some((program, args)) => {
                let mut cmd = CommandBuilder::new(program);
                cmd.args(args);
                cmd
            }
            None => CommandBuilder::new_default_prog(),
        };
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| WorkloadError::Spawn(err.to_string()))?;
        // Only the child keeps the slave open, so the reader sees EOF when it exits.
        drop(pair.slave);

        let master = pair.master;
        let io = (|| -> Result<_, WorkloadError> {
            let reader = master
                .try_clone_reader()
                .map_err(|err| WorkloadError::Spawn(err.to_string()))?;
            let writer = master
                .take_writer()
                .map_err(|err| WorkloadError::Spawn(err.to_string()))?;
            let (tx, events) = mpsc::unbounded_channel();
            std::thread::Builder::new()
                .name("attach-pty-reader".into())
                .spawn(move || pump_reader(reader, tx))?;
            Ok((writer, events))
        })();
        let (writer, events) = reap_on_error(child.as_mut(), io)?;

        let workload = PtyWorkload {
            master: Mutex::new(master),
            writer: Mutex::new(writer),
            child: Mutex::new(child),
        };
        Ok(Launched {
            workload: Arc::new(workload),
            events,
        })
    }
}

/// Kills and reaps `child` when the rest of a launch failed.
fn reap_on_error<T>(
    child: &mut (dyn Child + Send + Sync),
    result: Result<T, WorkloadError>,
) -> Result<T, WorkloadError> {
    if let Err(err) = &result {
        warn!(error = %err, "pty setup failed after spawn, killing child");
        let _ = child.kill();
        let _ = child.wait();
    }
    result
}

fn pump_reader(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<WorkloadEvent>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(WorkloadEvent::Output(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(error = %err, "pty reader finished");
                break;
            }
        }
    }
    let _ = tx.send(WorkloadEvent::Exited);
}

fn pty_size(size: GridSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl Workload for PtyWorkload {
    fn write(&self, data: &[u8]) -> Result<(), WorkloadError> {
        let mut writer = self.writer.lock();
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&self, size: GridSize) -> Result<(), WorkloadError> {
        self.master
            .lock()
            .resize(pty_size(size))
            .map_err(|err| WorkloadError::Resize(err.to_string()))
    }

    fn terminate(&self) {
        let mut child = self.child.lock();
        if let Err(err) = child.kill() {
            debug!(error = %err, "pty child already gone");
        }
        let _ = child.wait();
    }
}

/// In-process workload that echoes stdin back as stdout.
pub struct LoopbackWorkload {
    tx: mpsc::UnboundedSender<WorkloadEvent>,
    size: Mutex<GridSize>,
    closed: AtomicBool,
}

impl LoopbackWorkload {
    pub fn start(banner: Option<&str>) -> Launched {
        let (tx, events) = mpsc::unbounded_channel();
        if let Some(banner) = banner {
            let _ = tx.send(WorkloadEvent::Output(banner.as_bytes().to_vec()));
        }
        let workload = LoopbackWorkload {
            tx,
            size: Mutex::new(GridSize::DEFAULT),
            closed: AtomicBool::new(false),
        };
        Launched {
            workload: Arc::new(workload),
            events,
        }
    }

    pub fn size(&self) -> GridSize {
        *self.size.lock()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(WorkloadEvent::Exited);
        }
    }
}

impl Workload for LoopbackWorkload {
    fn write(&self, data: &[u8]) -> Result<(), WorkloadError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WorkloadError::Closed);
        }
        let (echo, eof) = match data.iter().position(|byte| *byte == LOOPBACK_EOF) {
            Some(at) => (&data[..at], true),
            None => (data, false),
        };
        if !echo.is_empty() && self.tx.send(WorkloadEvent::Output(echo.to_vec())).is_err() {
            warn!("loopback output dropped");
        }
        if eof {
            self.close();
        }
        Ok(())
    }

    fn resize(&self, size: GridSize) -> Result<(), WorkloadError> {
        *self.size.lock() = size;
        Ok(())
    }

    fn terminate(&self) {
        self.close();
    }
}
