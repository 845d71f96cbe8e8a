use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use kiln_server::{
    AppState, create_app,
    infra::{
        config::{Config, ConfigLoad, ConfigLoader, ConfigWarnings},
        startup::{Backends, connect_postgres},
    },
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "kiln-server")]
#[command(about = "Generation job ledger with provider callbacks, large uploads and realtime feeds")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Path to a kiln.toml configuration file
    #[arg(short, long, env = "KILN_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Load environment variables from this file instead of ./.env
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(command) = cli.command {
        match command {
            Command::Db(DbCommand::Migrate) => {
                run_db_migrate(&cli.serve).await?;
                return Ok(());
            }
        }
    }

    run_server(cli.serve).await
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path.clone());
    }
    if let Some(path) = &args.env_file {
        loader = loader.with_env_file(path.clone());
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file loaded");
    }
    log_warnings(&warnings);

    Ok(config)
}

fn log_warnings(warnings: &ConfigWarnings) {
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => {
                warn!(message = %warning.message, "configuration warning")
            }
        }
    }
}

async fn run_db_migrate(args: &ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(args)?;
    let url = config
        .database
        .url
        .as_deref()
        .context("DATABASE_URL is required for migrations")?;
    let pool = connect_postgres(url, 1).await?;
    kiln_core::MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let config = load_runtime_config(&args)?;
    config.ensure_directories()?;
    let config = Arc::new(config);

    let backends = Backends::connect(&config).await?;
    let state = AppState::assemble(Arc::clone(&config), backends);

    let shutdown = state.shutdown.clone();
    let reconciler_task = if config.reconciler.enabled {
        info!(
            interval = ?config.reconciler.interval(),
            stale_after = ?config.reconciler.stale_after(),
            "starting provider reconciler"
        );
        Some(Arc::clone(&state.reconciler).spawn(shutdown.clone()))
    } else {
        None
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, storage = %config.storage_root().display(), "kiln-server listening");

    let app = create_app(state);
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {err}");
            }
            info!("shutdown signal received");
            signal.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Some(task) = reconciler_task {
        let _ = task.await;
    }
    Ok(())
}
