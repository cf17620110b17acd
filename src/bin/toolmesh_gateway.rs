//! Runs a tool gateway seeded from a list of endpoints.
//!
//! Usage:
//!
//! ```text
//! toolmesh-gateway <config-path> [endpoint ...]
//! ```
//!
//! The JSON file at `config-path` must deserialize into a
//! [`GatewayConfig`]; every field is optional. Each `endpoint` is an
//! `http://`, `https://` or `tcp://host:port` URI queried for its info
//! response. A minimal configuration is:
//!
//! ```json
//! {
//!   "health": { "interval_ms": 5000, "degrade_after": 3 },
//!   "balancer": { "strategy": "health_weighted", "max_attempts": 3 },
//!   "insights": { "interval_ms": 30000, "auto_apply": false }
//! }
//! ```
//!
//! The gateway probes and evaluates its pool until interrupted with Ctrl-C.
//! Logging honours `RUST_LOG` and defaults to `info`.

use camino::Utf8PathBuf;
use std::env;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;
use toolmesh::config::{ConfigError, GatewayConfig};
use toolmesh::gateway::services::ToolGateway;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that stop the gateway before it starts serving.
#[derive(Debug, Error)]
enum LaunchError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("runtime init failed: {0}")]
    RuntimeInit(#[source] std::io::Error),
    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

fn main() -> Result<(), BoxError> {
    install_logging();
    let args = collect_args()?;
    run_gateway(args.into_iter()).map_err(Into::into)
}

fn install_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn collect_args() -> Result<Vec<String>, LaunchError> {
    env::args_os()
        .skip(1)
        .map(|arg_os| {
            arg_os
                .into_string()
                .map_err(|_| LaunchError::InvalidArgs("argument is not valid UTF-8".into()))
        })
        .collect()
}

fn run_gateway(mut args: impl Iterator<Item = String>) -> Result<(), LaunchError> {
    let config_path = args.next().map(Utf8PathBuf::from).ok_or_else(|| {
        LaunchError::InvalidArgs("usage: toolmesh-gateway <config-path> [endpoint ...]".into())
    })?;
    let endpoints: Vec<String> = args.collect();
    let config = GatewayConfig::load(&config_path)?;
    info!(config = %config_path, endpoints = endpoints.len(), "starting tool gateway");

    let runtime = build_runtime()?;
    runtime.block_on(async {
        let gateway = Arc::new(ToolGateway::networked(config));
        let report = gateway.discover_from_endpoints(endpoints).await;
        if report.accepted.is_empty() {
            warn!("no tool servers discovered; waiting for registrations");
        }

        let token = CancellationToken::new();
        let tasks = gateway.spawn_background(&token);
        let signal = tokio::signal::ctrl_c().await;
        info!("shutting down tool gateway");
        token.cancel();
        tasks.join().await;
        signal.map_err(LaunchError::Signal)
    })
}

fn build_runtime() -> Result<tokio::runtime::Runtime, LaunchError> {
    Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(LaunchError::RuntimeInit)
}
