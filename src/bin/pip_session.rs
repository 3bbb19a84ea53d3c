//! # pip-session
//!
//! Command-line client for the session refresh coordinator. Session and
//! throttle state persist in a JSON file, so repeated invocations share the
//! same backoff window. Every command prints one JSON line.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use pip_tracker::{
    AppConfig, PipError, Result,
    config::{default_config_path, load_config_from},
    identity::GoTrueClient,
    linfo,
    logging::{self, LogComponent, LogStage},
    session::{RefreshPolicy, SessionRefreshCoordinator, ThrottleClassifier},
    storage::{FileStore, KeyValueStore},
};
use serde_json::{Value, json};

/// Environment variable holding the password for `login`.
const PASSWORD_ENV: &str = "PIP_PASSWORD";

#[derive(Debug, Parser)]
#[command(name = "pip-session", version, about = "Inspect and refresh the PIP tracker session")]
struct Cli {
    /// Config file; falls back to the default location, then to built-in defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// JSON state file (default: ~/.pip-tracker/state.json)
    #[arg(long, global = true)]
    state_file: Option<PathBuf>,

    /// Base log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in with email and the password from $PIP_PASSWORD
    Login {
        #[arg(long)]
        email: String,
    },
    /// Current session, refreshing only when needed and allowed
    Session {
        /// Refresh even if a session is held (backoff still applies)
        #[arg(long)]
        force_refresh: bool,
    },
    /// Refresh now unless backoff forbids it
    Refresh,
    /// Throttle state and whether a refresh is currently allowed
    Status,
    /// Sign out and clear local state
    Logout,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(Some(&cli.log_level));

    match run(cli).await {
        Ok((output, success)) => {
            println!("{output}");
            if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            println!("{}", json!({ "error": e.to_string() }));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(Value, bool)> {
    let config = load_cli_config(cli.config)?;
    let state_file = cli
        .state_file
        .or_else(|| config.storage.state_file.as_ref().map(PathBuf::from))
        .unwrap_or_else(default_state_file);

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&state_file));
    let client = Arc::new(GoTrueClient::new(&config.identity)?.with_persistence(store.clone()));
    let coordinator = SessionRefreshCoordinator::builder(client.clone())
        .store(store)
        .policy(RefreshPolicy::from(&config.session_refresh))
        .classifier(ThrottleClassifier::new(&config.session_refresh.throttle_patterns))
        .build();

    linfo!(
        "cli",
        LogStage::Startup,
        LogComponent::Cli,
        "command",
        "running session command",
        command = ?cli.command,
        state_file = %state_file.display()
    );

    match cli.command {
        Command::Login { email } => {
            let password = std::env::var(PASSWORD_ENV)
                .map_err(|_| PipError::auth(format!("{PASSWORD_ENV} is not set")))?;
            match client.sign_in_with_password(&email, &password).await {
                Ok(session) => Ok((json!({ "session": session }), true)),
                Err(error) => Ok((json!({ "session": null, "error": error }), false)),
            }
        }
        Command::Session { force_refresh } => {
            let outcome = coordinator.get_session_with_refresh(force_refresh).await;
            let success = outcome.error.is_none();
            Ok((serde_json::to_value(&outcome)?, success))
        }
        Command::Refresh => {
            let outcome = coordinator.refresh_session().await;
            let success = outcome.error.is_none();
            Ok((serde_json::to_value(&outcome)?, success))
        }
        Command::Status => Ok((
            json!({
                "canRefresh": coordinator.can_refresh(),
                "refreshInProgress": coordinator.is_refresh_in_progress(),
                "state": coordinator.refresh_state(),
                "stateFile": state_file.display().to_string(),
            }),
            true,
        )),
        Command::Logout => match coordinator.sign_out().await {
            Ok(()) => Ok((json!({ "error": null }), true)),
            Err(error) => Ok((json!({ "error": error }), false)),
        },
    }
}

fn load_cli_config(explicit: Option<PathBuf>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        return load_config_from(path);
    }
    let path = default_config_path();
    if path.exists() {
        load_config_from(path)
    } else {
        Ok(AppConfig::default())
    }
}

fn default_state_file() -> PathBuf {
    std::env::var_os("HOME").map_or_else(
        || PathBuf::from(".pip-tracker").join("state.json"),
        |home| PathBuf::from(home).join(".pip-tracker").join("state.json"),
    )
}
