use std::future::IntoFuture;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use forwardlytics::{app, AppState, Dispatcher, ForwardlyticsConfig, ShutdownSignal};

#[tokio::main]
async fn main() {
    // 1. Initialize Logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 2. Setup Configuration
    let config = match ForwardlyticsConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            process::exit(1);
        }
    };

    let api_key = match config.api_key() {
        Ok(key) => key.to_string(),
        Err(e) => {
            error!(error = %e, "You need to set FORWARDLYTICS_API_KEY");
            process::exit(1);
        }
    };

    // 3. Register integrations
    let registry = Arc::new(config.build_registry());
    let dispatcher = Dispatcher::new(registry, config.retry.policy());
    let state = Arc::new(AppState::new(dispatcher, api_key));

    // 4. Start Server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %addr, "Failed to bind");
            process::exit(1);
        }
    };

    let shutdown = ShutdownSignal::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown.listen().await }
    });

    info!("Forwardlytics started on {}", addr);

    let server = axum::serve(listener, app(state)).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.recv().await }
    });

    // In-flight requests get `timeout` to finish once shutdown starts.
    let drain_deadline = async {
        shutdown.recv().await;
        tokio::time::sleep(shutdown.timeout()).await;
    };

    tokio::select! {
        result = server.into_future() => {
            if let Err(e) = result {
                error!(error = %e, "Server error");
                process::exit(1);
            }
            info!("Forwardlytics stopped");
        }
        _ = drain_deadline => {
            warn!(
                timeout_secs = shutdown.timeout().as_secs(),
                "Shutdown timeout reached, forcing shutdown"
            );
        }
    }
}
