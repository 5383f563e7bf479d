use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use throttle::config::ThrottleConfig;
use throttle::http::{AppState, HttpServer};
use throttle::ratelimit::{PolicySet, RateLimiter};

/// Per-action request rate limiting service.
#[derive(Parser, Debug)]
#[command(name = "throttle", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Override the action policy file
    #[arg(short, long)]
    policies: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Throttle Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ThrottleConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(policies) = args.policies {
        config.rate_limiting.policies_path = Some(policies.display().to_string());
    }
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let policies_path = config.rate_limiting.policies_path.as_ref().map(PathBuf::from);
    let policies = match &policies_path {
        Some(path) => PolicySet::default().merge(PolicySet::from_file(path)?),
        None => PolicySet::default(),
    };
    info!(actions = policies.len(), "Action policies loaded");

    let rate_limiter = Arc::new(RateLimiter::from_config(
        &config.rate_limiting,
        &config.store,
    )?);

    let sweeper = config
        .rate_limiting
        .sweep_interval()
        .map(|interval| Arc::clone(&rate_limiter).spawn_sweeper(interval));

    let state = AppState::new(rate_limiter, policies);
    let reloader = match (&policies_path, config.rate_limiting.policy_reload_interval()) {
        (Some(path), Some(interval)) => Some(state.spawn_policy_reloader(path.clone(), interval)),
        _ => None,
    };

    // Run the server with graceful shutdown on Ctrl+C
    HttpServer::new(config.server.listen_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    for task in [sweeper, reloader].into_iter().flatten() {
        task.abort();
    }

    info!("Throttle Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
