mod console;

use anyhow::Result;
use clap::Parser;
use logmon_cli::{Cli, Command};
use logmon_config::{AppConfig, AppPaths, ConfigManager};
use logmon_core::{Coordinator, CoordinatorOptions, UpdateDispatcher};
use logmon_ssh::{ConnectOptions, ConnectionPool, SshClient};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

const UPDATE_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = AppPaths::new()?;
    let config_manager = ConfigManager::new(paths.clone());
    let cwd = std::env::current_dir().ok();

    if let Some(Command::Config { init }) = cli.command {
        if init {
            let path = config_manager.save_default()?;
            println!("config initialized at {}", path.display());
        } else {
            let path = config_manager.resolve_path(cli.config.as_deref(), cwd.as_deref());
            println!("{}", path.display());
        }
        return Ok(());
    }

    let config = config_manager.load(
        cli.config.as_deref(),
        cwd.as_deref(),
        cli.config_overrides(),
    )?;
    let _log_guard = init_logging(&config, &paths, cli.debug.as_deref())?;
    info!(servers = config.servers.len(), "starting");

    let client = SshClient::new(ConnectOptions {
        dial_timeout: config.timeouts.dial(),
        ..Default::default()
    });
    let pool = Arc::new(ConnectionPool::new(
        Arc::new(client),
        config.timeouts.keepalive(),
    ));
    let (updates, receiver) = UpdateDispatcher::new(UPDATE_QUEUE);
    let coordinator = Coordinator::new(
        config.servers.clone(),
        pool,
        updates,
        CoordinatorOptions::from_config(&config),
    );

    if let Some(server) = cli.server.as_deref() {
        if let Err(err) =
            coordinator.auto_select(server, cli.folder.as_deref(), cli.file.as_deref())
        {
            warn!(server, error = %err, "auto-select failed");
            eprintln!("{err}");
        }
    }

    console::run(coordinator, receiver, paths.downloads_dir.clone()).await
}

fn init_logging(
    config: &AppConfig,
    paths: &AppPaths,
    debug_file: Option<&Path>,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let file_appender = match debug_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("--debug needs a file path"))?;
            std::fs::create_dir_all(dir)?;
            tracing_appender::rolling::never(dir, name)
        }
        None => {
            std::fs::create_dir_all(&paths.log_dir)?;
            tracing_appender::rolling::daily(&paths.log_dir, "logmon.log")
        }
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let file_layer = if config.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed()
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    // stdout belongs to the console; mirrored logs go to stderr.
    if config.logging.stdout {
        let stderr_layer = if config.logging.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .boxed()
        };
        tracing::subscriber::set_global_default(subscriber.with(stderr_layer))?;
    } else {
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(guard)
}
