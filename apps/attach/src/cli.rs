use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::EngineChoice;
use crate::logging::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "attach",
    version,
    about = "Attach a terminal to a remote session",
    propagate_version = true
)]
pub struct Cli {
    /// Attach server base URL. Falls back to the one saved by `attach login`,
    /// then to a local server.
    #[arg(long, global = true, env = "ATTACH_SERVER")]
    pub server: Option<String>,

    /// Bearer credential. Overrides the stored one from `attach login`.
    #[arg(long, global = true, env = "ATTACH_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[arg(long, global = true, env = "ATTACH_LOG_LEVEL", value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Log file. A session defaults to ~/.attach/logs/<session>.log, other
    /// commands to stderr.
    #[arg(long, global = true, env = "ATTACH_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Attach to a session.
    Session(SessionArgs),
    /// Store a bearer credential for later runs.
    Login(LoginArgs),
    /// Forget the stored credential.
    Logout,
}

#[derive(Args, Debug)]
pub struct SessionArgs {
    pub session_id: String,

    /// Ask to drive. Without it the session is joined as a viewer.
    #[arg(long)]
    pub driver: bool,

    /// Never forward keystrokes, whatever the lease says.
    #[arg(long, conflicts_with_all = ["driver", "take_control"])]
    pub read_only: bool,

    /// Take the lease right after joining.
    #[arg(long)]
    pub take_control: bool,

    #[arg(long, value_enum, default_value_t = EngineChoice::Auto)]
    pub engine: EngineChoice,

    /// Disable the Ctrl-] escape keys.
    #[arg(long)]
    pub no_escape: bool,
}

#[derive(Args, Debug)]
pub struct LoginArgs {
    /// Read from the terminal when omitted.
    #[arg(long = "with-token")]
    pub with_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn session_flags_parse() {
        let cli = Cli::try_parse_from([
            "attach",
            "--server",
            "localhost:7070",
            "session",
            "demo",
            "--driver",
            "--engine",
            "none",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("localhost:7070"));
        match cli.command {
            Command::Session(args) => {
                assert_eq!(args.session_id, "demo");
                assert!(args.driver);
                assert_eq!(args.engine, EngineChoice::Headless);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn read_only_conflicts_with_driving() {
        assert!(Cli::try_parse_from(["attach", "session", "demo", "--read-only", "--driver"]).is_err());
        assert!(Cli::try_parse_from(["attach", "session", "demo", "--read-only"]).is_ok());
    }
}
