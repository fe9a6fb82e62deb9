use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use canopy_server::{Daemon, DaemonConfig, ServerResult};

/// Projects source-control trees as live, writable directory hierarchies.
#[derive(Debug, Parser)]
#[command(name = "canopyd", version)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// State directory; overrides the config file's `state_dir`.
    #[arg(long)]
    state_dir: Option<PathBuf>,
}

fn load_config(args: &Args) -> ServerResult<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => {
            let state_dir = args.state_dir.clone().ok_or_else(|| {
                canopy_server::ServerError::Config(
                    "either --config or --state-dir is required".into(),
                )
            })?;
            DaemonConfig {
                state_dir,
                case_sensitive: true,
                journal_ring_capacity: None,
                mounts: Vec::new(),
            }
        }
    };
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }
    config.validate()?;
    Ok(config)
}

// Exit codes: 0 on clean shutdown, 1 when initialization fails, 2 when the
// daemon fails after startup.
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let daemon = match Daemon::init(config) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(daemon.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}
