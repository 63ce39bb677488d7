mod cli;
mod config;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use parley_core::files::LocalFileStore;
use parley_core::mail::LogMailer;
use parley_core::{cleanup, scheduler, AppState};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat, LoggingConfig};

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// The sqlite file's directory has to exist before the pool opens it.
fn ensure_data_dirs(config: &Config) -> anyhow::Result<()> {
    if let Some(rest) = config.database.url.strip_prefix("sqlite://") {
        let file = rest.split('?').next().unwrap_or(rest);
        if !file.is_empty() && file != ":memory:" {
            if let Some(parent) = Path::new(file).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating database directory {}", parent.display()))?;
                }
            }
        }
    }
    std::fs::create_dir_all(&config.storage.path)
        .with_context(|| format!("creating storage directory {}", config.storage.path))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    let config = Config::load(&args.config)?;
    init_tracing(&config.logging);
    tracing::info!("Loaded config from {}", args.config);

    ensure_data_dirs(&config)?;

    let db = parley_db::create_pool(&config.database.url, config.database.max_connections).await?;
    parley_db::run_migrations(&db).await?;
    tracing::info!("Database migrations applied");

    // Nobody is connected yet, whatever the last process left behind.
    let reset = parley_db::users::reset_all_statuses(&db).await?;
    if reset > 0 {
        tracing::info!("Reset presence for {} users", reset);
    }

    let state = AppState::new(
        db.clone(),
        config.app_config(),
        Arc::new(LogMailer),
        Arc::new(LocalFileStore::new(&config.storage.path, config.storage.url_prefix.clone())),
    );
    state.warm().await?;

    let daemons: Vec<_> = [
        scheduler::spawn(state.clone(), config.scheduler.daemon()),
        cleanup::spawn(state.clone(), config.cleanup.daemon()),
    ]
    .into_iter()
    .flatten()
    .collect();

    let app = parley_api::build_router()
        .merge(parley_ws::gateway_router(config.gateway.limits.clone()))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;
    tracing::info!("Parley server listening on {}", config.server.bind_address);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, draining connections");
            shutdown.notify_waiters();
        })
        .await?;

    for handle in daemons {
        if let Err(err) = handle.await {
            tracing::warn!("Background task ended abnormally: {}", err);
        }
    }

    db.close().await;
    tracing::info!("Parley server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
