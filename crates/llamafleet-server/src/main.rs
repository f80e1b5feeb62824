//! llamafleet control-plane binary entrypoint.

mod cli;
mod config_file;
mod http;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use llamafleet_registry::Registry;
use llamafleet_runtime::LifecycleManager;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    let config = match config_file::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    logging::init(&config.log_level);
    info!(listen_addr = %config.listen_addr, "starting llamafleet");

    let lifecycle = LifecycleManager::new();
    let registry = Arc::new(Registry::new(
        config.state_dir.clone(),
        config.log_dir.clone(),
        config.default_restart_policy(),
        config.idle_timeout_minutes,
        config.max_running_instances,
        lifecycle.clone(),
    ));

    if let Err(e) = registry.restore(config.restore_last_state).await {
        warn!(error = %e, "failed to restore persisted instance state");
    }

    let sweep_cancel = CancellationToken::new();
    lifecycle.spawn_idle_sweeper(
        Arc::clone(&registry),
        Duration::from_secs(config.idle_sweep_interval_seconds),
        sweep_cancel.clone(),
    );

    let config = Arc::new(config);
    let state = http::AppState::new(Arc::clone(&registry), Arc::clone(&config));
    let app = http::router(state);

    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.listen_addr, error = %e, "failed to bind listen address");
            std::process::exit(1);
        }
    };

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(e) = server.await {
        error!(error = %e, "http server exited with error");
    }

    sweep_cancel.cancel();
    info!("stopping all running instances before exit");
    registry.stop_all().await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
