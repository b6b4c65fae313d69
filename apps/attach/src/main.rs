use anyhow::{bail, Context, Result};
use attach_client::auth::HttpAuthenticator;
use attach_client::cli::{Cli, Command, LoginArgs, SessionArgs};
use attach_client::config::{ServerUrl, DEFAULT_SERVER};
use attach_client::credential::{unix_millis, CredentialFile, StoredCredential, UnauthorizedVerdict};
use attach_client::engine::memory::MemorySurface;
use attach_client::engine::tty::TtySurface;
use attach_client::engine::{default_chain, select_engine, EngineKind, Surface};
use attach_client::logging::{self, LogSink};
use attach_client::transport::WsConnector;
use attach_client::{
    connect, AttachTarget, ControllerOptions, LifecycleConfig, SessionController, SessionEnd,
};
use attach_proto::{GridSize, Role, StatusReport};
use clap::Parser;
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let session_id = match &cli.command {
        Command::Session(args) => Some(args.session_id.as_str()),
        Command::Login(_) | Command::Logout => None,
    };
    let sink = LogSink::choose(cli.log_file.clone(), session_id);
    let _log_guard = match logging::init(cli.log_level, &sink) {
        Ok(guard) => Some(guard),
        Err(err) => {
            eprintln!("⚠️  failed to initialize logging: {err}");
            None
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("attach: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let Cli {
        server,
        token,
        command,
        ..
    } = cli;
    match command {
        Command::Session(args) => attach(server, token, args).await,
        Command::Login(args) => login(server, args),
        Command::Logout => logout(),
    }
}

async fn attach(server: Option<String>, token: Option<String>, args: SessionArgs) -> Result<ExitCode> {
    let store = CredentialFile::default_location()?;
    let stored = store.load()?;
    let server = ServerUrl::parse(
        server
            .as_deref()
            .or(stored.server.as_deref())
            .unwrap_or(DEFAULT_SERVER),
    )?;
    let from_store = token.is_none();
    let credential = token
        .or(stored.token)
        .context("no credential: run `attach login` or set ATTACH_TOKEN")?;

    let authenticator = HttpAuthenticator::new(server.clone(), credential, Duration::from_secs(10))?;
    let connector = WsConnector::new(server.clone());

    let engine = select_engine(default_chain(args.engine)).await;
    let surface: Box<dyn Surface> = match engine.kind() {
        EngineKind::Noop => Box::new(MemorySurface::new(GridSize::DEFAULT)),
        kind => Box::new(TtySurface::new(kind == EngineKind::Emulator)),
    };
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let options = ControllerOptions {
        read_only: args.read_only,
        take_control: args.take_control,
        escape_keys: !args.no_escape,
    };
    let controller = SessionController::mount(engine, surface, options, events_tx);

    let (status_tx, mut status_rx) = watch::channel(StatusReport::default());
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let report = status_rx.borrow_and_update().clone();
            info!(
                status = %report.status,
                reason = report.reason.as_deref().unwrap_or(""),
                "connection status"
            );
        }
    });
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            debug!(?event, "session event");
        }
    });

    let target = AttachTarget {
        session_id: args.session_id,
        role: if args.driver || args.take_control {
            Role::Driver
        } else {
            Role::Viewer
        },
    };
    let connection = match connect(
        &authenticator,
        &connector,
        &target,
        controller.dimensions(),
        &LifecycleConfig::default(),
        status_tx,
    )
    .await
    {
        Ok(connection) => {
            if from_store {
                store.note_success()?;
            }
            connection
        }
        Err(err) => {
            controller.abort(&err.to_string());
            if err.is_unauthorized() && from_store {
                if store.note_unauthorized(unix_millis())? == UnauthorizedVerdict::Confirmed {
                    eprintln!("stored credential was rejected again and has been removed");
                }
            }
            return Err(err.into());
        }
    };

    Ok(match controller.run(connection).await {
        SessionEnd::Failed => ExitCode::FAILURE,
        SessionEnd::Detached | SessionEnd::Disconnected => ExitCode::SUCCESS,
    })
}

fn login(server: Option<String>, args: LoginArgs) -> Result<ExitCode> {
    let token = match args.with_token {
        Some(token) => token,
        None => rpassword::prompt_password("Attach credential: ")
            .context("failed to read credential")?,
    };
    let token = token.trim();
    if token.is_empty() {
        bail!("credential must not be empty");
    }
    if let Some(server) = server.as_deref() {
        ServerUrl::parse(server)?;
    }

    let store = CredentialFile::default_location()?;
    store.save(&StoredCredential {
        server,
        token: Some(token.to_string()),
        suspect_since_ms: None,
    })?;
    println!("credential stored in {}", store.path().display());
    Ok(ExitCode::SUCCESS)
}

fn logout() -> Result<ExitCode> {
    let store = CredentialFile::default_location()?;
    if store.clear()? {
        println!("stored credential removed");
    } else {
        println!("no stored credential");
    }
    Ok(ExitCode::SUCCESS)
}
