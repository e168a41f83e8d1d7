// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Admission Control Service
//!
//! Rate limiting for the directory application's write endpoints, served
//! as an external check:
//!
//! - `POST /check` consumes quota for `{policy, identity?, ip?}`
//! - `POST /outcome` reports how the admitted operation went
//! - `GET /status/{policy}/{key}` reads quota without consuming it
//!
//! ## Configuration
//!
//! - `ADMISSION_CONFIG`: JSON config file (optional)
//! - `BIND_ADDR`: Server bind address (default: 0.0.0.0:8080)
//! - `SWEEP_INTERVAL_SECS`: Counter expiry sweep interval (default: 60)
//! - `OUTCOME_TIMEOUT_MS`: Time before an unreported operation counts as failed (default: 30000)
//! - `ALLOWED_ORIGINS`: Comma-separated CORS origins (default: https://localhost)

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use admission_control::{
    clock::SystemClock,
    config::Config,
    handlers::{router, AppState},
    metrics::AdmissionMetrics,
    middleware::{PolicySet, RateGuard},
    store::CounterStore,
    WindowLimiter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::load()?;
    let policies = PolicySet::from_config(&config.rate_limit)?;
    info!(
        bind_addr = %config.bind_addr,
        policies = ?policies.names().collect::<Vec<_>>(),
        sweep_interval_secs = config.rate_limit.sweep_interval_secs,
        "Starting admission control"
    );

    let store = CounterStore::start(Arc::new(SystemClock), config.rate_limit.sweep_interval());
    let mut limiter = WindowLimiter::new(store.clone());
    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(AdmissionMetrics::new()?);
        limiter = limiter.with_metrics(metrics.clone());
        Some(metrics)
    } else {
        None
    };

    let state = Arc::new(AppState {
        guard: RateGuard::new(limiter, config.rate_limit.outcome_timeout()),
        policies,
        metrics,
        config: config.clone(),
    });

    let app = router(state);

    let addr: SocketAddr = config.bind_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.shutdown().await;
    info!("Shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
}
