use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "attach-server",
    about = "Serve attachable terminal sessions over websockets",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "ATTACH_CONFIG",
        value_name = "PATH",
        help = "TOML configuration file"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "ADDR",
        help = "Listen address, overrides the configuration and ATTACH_LISTEN"
    )]
    pub listen: Option<SocketAddr>,

    #[arg(
        long = "log-level",
        default_value = "info",
        help = "Default log filter when RUST_LOG is unset"
    )]
    pub log_level: String,
}
