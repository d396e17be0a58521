use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::{debug, error, info, warn};

mod archive;
mod config;
mod diagnostics;
mod engine;
mod env;
mod error;
mod lock;
mod networking;
mod process;
mod provision;
mod storage;
mod updater;
mod util;

use config::{FeedTable, ScreenConfig, Settings};
use engine::SyncEngine;
use env::AppPaths;
use error::{Result, SyncError};
use lock::LockGuard;
use networking::{BackendClient, NetworkClient};
use process::ProcessLauncher;
use updater::{BackendChannel, SelfUpdater};

#[derive(Parser, Debug)]
#[command(
    name = "lobby-sync",
    author,
    version,
    about = "Content updater and software watchdog for lobby signage screens"
)]
struct Cli {
    /// Install directory holding config.json and cache/ (default: platform app dir).
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep every content feed in sync until interrupted.
    Run,
    /// Watch for application releases and relaunch the display app.
    Watchdog,
    /// First-run setup: record the screen id and fetch everything.
    Provision {
        /// `<client>_<model>`, e.g. `312_1`.
        screen_id: String,
    },
    /// Run a single cycle and exit.
    Once {
        #[arg(long)]
        feed: Option<String>,
    },
    /// Print the local sync state and connectivity.
    Status {
        /// Also write the report under logs/.
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    match run(cli).await {
        Ok(code) => code,
        Err(SyncError::AlreadyRunning { pid }) => {
            info!("another instance (pid {pid}) is already running; exiting");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let paths = AppPaths::new(cli.base_dir.unwrap_or_else(env::default_app_dir));
    paths.ensure_base_dirs()?;
    let settings = Settings::load(&paths.settings_path())?;
    let feeds = FeedTable::load(&paths.feeds_path())?;
    let screen = ScreenConfig::load(&paths.config_path(), settings.default_client_id);

    match cli.command {
        Command::Run => {
            let _lock = hold(&paths.updater_lock())?;
            let engine = SyncEngine::new(&paths, &settings, screen, feeds);
            engine.run(shutdown_signal()).await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Watchdog => {
            let _lock = hold(&paths.watchdog_lock())?;
            let net = NetworkClient::new(&settings);
            let backend = BackendClient::new(
                net.clone(),
                settings.backend_url.clone(),
                settings.backend_key.clone(),
            );
            let channel = BackendChannel::new(
                backend,
                net,
                screen.client_id,
                settings.download_attempts,
                settings.retry_backoff(),
            );
            let app = ProcessLauncher::new(paths.base_dir().to_path_buf(), &settings);
            let updater = SelfUpdater::new(channel, app, paths.clone());
            if let Some(version) = updater
                .run(
                    settings.watchdog_interval(),
                    settings.retry_delay(),
                    shutdown_signal(),
                )
                .await
            {
                info!("watchdog: v{version} running; exiting");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Provision { screen_id } => {
            let _lock = hold(&paths.updater_lock())?;
            let summary = provision::provision(&paths, &settings, &screen_id, feeds).await?;
            if summary.is_success() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Once { feed } => {
            let _lock = hold(&paths.updater_lock())?;
            let engine = SyncEngine::new(&paths, &settings, screen, feeds);
            let results = engine.run_once(feed.as_deref()).await?;
            let mut failed = false;
            for (name, outcome) in &results {
                match outcome {
                    Ok(report) => println!("{name}: {report}"),
                    Err(err) => {
                        failed = true;
                        println!("{name}: FAILED ({err})");
                    }
                }
            }
            Ok(if failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
        Command::Status { save } => {
            let diagnostics = diagnostics::Diagnostics::new(paths, settings, screen, feeds);
            let report = diagnostics.run().await;
            print!("{}", diagnostics::format_report(&report));
            if save {
                let path = diagnostics.save_report(&report)?;
                println!("\nSaved to {}", path.display());
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn hold(path: &Path) -> Result<LockGuard> {
    let guard = LockGuard::acquire(path)?;
    debug!("lock: holding {}", guard.path().display());
    Ok(guard)
}

/// Resolves on Ctrl-C, or SIGTERM where the platform has it.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!("signal: SIGTERM handler unavailable ({err})");
                ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("signal: Ctrl-C handler unavailable ({err})");
        std::future::pending::<()>().await;
    }
}
