mod analysis;
mod config;
mod db;
mod error;
mod extract;
mod fetcher;
mod models;
mod normalizer;
mod page_parser;
mod pipeline;
mod query;
mod reconcile;
mod resolver;
mod web;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::{Cli, Command, Config};
use db::Database;
use fetcher::HttpFetcher;
use pipeline::{Importer, TriggerOutcome};

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let cli = Cli::parse_args();

    let result = match cli.command {
        Command::Import { config } => run_import(config).await,
        Command::Serve {
            config,
            import_on_start,
        } => run_serve(config, import_on_start).await,
    };

    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_import(config: Config) -> Result<()> {
    init_logging(config.verbose);

    // Validate configuration
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = "import",
        "Running single import"
    );
    log_config(&config);

    let shutdown = CancellationToken::new();
    let db = Arc::new(open_database(&config).await?);
    let importer = build_importer(&config, db, shutdown.clone())?;

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling import");
            ctrl_c.cancel();
        }
    });

    let run = importer.run_once(true).await?;
    info!(
        lessons = run.lessons,
        groups = run.groups,
        teachers = run.teachers,
        duration_ms = run.duration_ms,
        "Import finished"
    );
    Ok(())
}

async fn run_serve(config: Config, import_on_start: bool) -> Result<()> {
    init_logging(config.verbose);

    // Validate configuration
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting timetable service"
    );
    log_config(&config);

    let shutdown = CancellationToken::new();
    let db = Arc::new(open_database(&config).await?);
    let importer = Arc::new(build_importer(&config, db.clone(), shutdown.clone())?);

    if import_on_start {
        match importer.trigger(false) {
            TriggerOutcome::Started => info!("Startup import scheduled"),
            TriggerOutcome::AlreadyRunning => warn!("Startup import skipped, one is already running"),
        }
    }

    let router = web::create_router(
        web::AppState {
            db: db.clone(),
            importer: importer.clone(),
        },
        config.admin_token.clone(),
    );

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal.cancel();
        }
    });

    info!(
        port = config.port,
        db_type = %db.db_type(),
        admin_token = config.admin_token.is_some(),
        "Serving timetable API (Ctrl+C to stop)"
    );

    let served = web::start_server(router, config.port, shutdown).await;

    // A write already in progress finishes and is logged before exit.
    if importer.is_running() {
        info!("Waiting for the running import to finish");
    }
    importer.wait_idle().await;

    if let Err(e) = served {
        error!(error = %e, "Web server failed");
        return Err(e);
    }
    Ok(())
}

fn build_importer(
    config: &Config,
    db: Arc<Database>,
    shutdown: CancellationToken,
) -> Result<Importer> {
    let fetcher = HttpFetcher::new(
        config.source_url.clone(),
        config.source_sections()?,
        config.concurrency,
        config.timeout(),
    )?;

    Ok(Importer::new(Arc::new(fetcher), db, shutdown))
}

/// Open database based on configuration (local SQLite or Turso)
async fn open_database(config: &Config) -> Result<Database> {
    if let Some(ref db_url) = config.database_url {
        let auth_token = config
            .database_auth_token
            .as_ref()
            .context("DATABASE_AUTH_TOKEN is required when using DATABASE_URL")?;

        info!(
            db_url = %db_url,
            "Using Turso remote database"
        );

        Database::open_turso(db_url, auth_token).await
    } else {
        info!(
            db_path = %config.db.display(),
            "Using local SQLite database"
        );

        Database::open(&config.db).await
    }
}

/// `RUST_LOG` takes precedence; `--verbose` lowers the default to debug.
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn log_config(config: &Config) {
    // Log database configuration
    if config.uses_turso() {
        info!(
            source_url = %config.source_url,
            pages = config.page_count(),
            db_type = "turso",
            db_url = %config.database_url.as_deref().unwrap_or("not set"),
            "Core configuration"
        );
    } else {
        info!(
            source_url = %config.source_url,
            pages = config.page_count(),
            db_type = "sqlite",
            db_path = %config.db.display(),
            "Core configuration"
        );
    }

    info!(
        concurrency = config.concurrency,
        timeout_secs = config.timeout,
        custom_sources = config.sources.is_some(),
        "Fetch configuration"
    );
}
