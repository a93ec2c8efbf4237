use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use toolsmith_core::RuntimeConfig;
use toolsmith_server::{AppContext, ConfigPolicyGate, RpcServer, ServerError};
use toolsmith_store::StepRegistry;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration invalid");
            std::process::exit(1);
        }
    };
    info!(db_path = %config.db_path, strict_integrity = config.strict_integrity, "starting toolsmith");

    // Saga step implementations are contributed by tool crates at the
    // composition root; the bare server ships an empty registry.
    let step_registry = Arc::new(StepRegistry::new());

    let ctx = match AppContext::initialize(config, step_registry).await {
        Ok(ctx) => ctx,
        Err(err) => {
            error!(error = %err, "startup failed");
            std::process::exit(1);
        }
    };

    let gate = match ConfigPolicyGate::from_config(&ctx.config) {
        Ok(gate) => Arc::new(gate),
        Err(err) => {
            error!(error = %err, "policy configuration invalid");
            std::process::exit(1);
        }
    };

    let server = RpcServer::new(ctx.clone(), gate);
    if let Err(err) = server.serve_stdio().await {
        match err {
            ServerError::Io { message } => error!(error = %message, "rpc transport failed"),
            other => error!(error = %other, "server failed"),
        }
        std::process::exit(1);
    }

    if let Err(err) = ctx.shutdown().await {
        error!(error = %err, "shutdown incomplete");
        std::process::exit(1);
    }
}
