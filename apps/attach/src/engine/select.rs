use std::future::Future;
use std::io::IsTerminal;
use std::pin::Pin;
use tracing::{info, warn};

use super::{
    EmulatorEngine, EngineError, EngineKind, NoopEngine, PassthroughEngine, TerminalEngine,
    DEFAULT_SCROLLBACK,
};

pub type EngineFuture =
    Pin<Box<dyn Future<Output = Result<Box<dyn TerminalEngine>, EngineError>> + Send>>;

type EngineFactory = Box<dyn FnOnce() -> EngineFuture + Send>;

/// One entry of the selection chain.
pub struct EngineCandidate {
    pub kind: EngineKind,
    factory: EngineFactory,
}

impl EngineCandidate {
    pub fn new<F, Fut>(kind: EngineKind, factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Box<dyn TerminalEngine>, EngineError>> + Send + 'static,
    {
        Self {
            kind,
            factory: Box::new(move || Box::pin(factory())),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum EngineChoice {
    /// Emulator, then passthrough, then nothing.
    #[default]
    Auto,
    Emulator,
    Passthrough,
    /// Render nothing.
    #[value(name = "none")]
    Headless,
}

/// Tries each candidate in order; the first that initializes wins. When all
/// of them fail the no-op engine is returned, so selection never fails.
pub async fn select_engine(candidates: Vec<EngineCandidate>) -> Box<dyn TerminalEngine> {
    for candidate in candidates {
        let kind = candidate.kind;
        match (candidate.factory)().await {
            Ok(engine) => {
                info!(target: "attach::engine", engine = %kind, "terminal engine selected");
                return engine;
            }
            Err(err) => {
                warn!(target: "attach::engine", engine = %kind, error = %err, "engine unavailable; falling back");
            }
        }
    }
    info!(target: "attach::engine", engine = %EngineKind::Noop, "terminal engine selected");
    Box::new(NoopEngine::new())
}

pub fn default_chain(choice: EngineChoice) -> Vec<EngineCandidate> {
    let emulator = || {
        EngineCandidate::new(EngineKind::Emulator, || async {
            if !std::io::stdin().is_terminal() || !std::io::stdout().is_terminal() {
                return Err(EngineError::Unsupported(
                    "emulator needs an interactive terminal on stdin and stdout",
                ));
            }
            Ok(Box::new(EmulatorEngine::new(DEFAULT_SCROLLBACK)) as Box<dyn TerminalEngine>)
        })
    };
    let passthrough = || {
        EngineCandidate::new(EngineKind::Passthrough, || async {
            if !std::io::stdout().is_terminal() {
                return Err(EngineError::Unsupported("passthrough needs a terminal on stdout"));
            }
            Ok(Box::new(PassthroughEngine::new()) as Box<dyn TerminalEngine>)
        })
    };

    match choice {
        EngineChoice::Auto => vec![emulator(), passthrough()],
        EngineChoice::Emulator => vec![emulator()],
        EngineChoice::Passthrough => vec![passthrough()],
        EngineChoice::Headless => Vec::new(),
    }
}
