//! # PIP Tracker 网关
//!
//! Rate-limiting gateway in front of the LLM-backed endpoints.

use std::path::PathBuf;

use clap::Parser;
use pip_tracker::{
    Result,
    config::{default_config_path, load_config_from},
    lerror, linfo,
    logging::{self, LogComponent, LogStage},
    server,
};

#[derive(Debug, Parser)]
#[command(name = "pip-tracker", version, about = "Rate-limiting gateway for PIP tracker")]
struct Args {
    /// Config file (defaults to $PIP_TRACKER_CONFIG_PATH or config/config.{RUST_ENV}.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Base log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Override server.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_logging(Some(&args.log_level));

    let path = args.config.unwrap_or_else(default_config_path);
    let mut config = load_config_from(&path)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    linfo!(
        "system",
        LogStage::Startup,
        LogComponent::Main,
        "service_starting",
        "starting gateway",
        config = %path.display()
    );
    if let Err(e) = server::run_server(config).await {
        lerror!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "service_failed",
            "gateway failed",
            error = ?e
        );
        std::process::exit(1);
    }

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::Main,
        "service_shutdown",
        "gateway shut down cleanly"
    );
    Ok(())
}
