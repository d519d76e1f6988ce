//! muxbench: a TCP server for comparing I/O multiplexing strategies
//!
//! The same dispatch loop runs over one of three readiness sources:
//! - `poll`: poll(2) with the interest list rebuilt every cycle
//! - `level`: level-triggered epoll
//! - `edge`: edge-triggered epoll in N forked workers sharing one listener
//!
//! Connections are served by a minimal echo or discard protocol so that
//! measurements reflect multiplexing cost rather than request handling.

mod config;
mod protocols;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        strategy = ?config.strategy,
        workers = config.workers,
        protocol = ?config.protocol,
        max_connections = config.max_connections,
        "Starting muxbench server"
    );

    runtime::run(config)?;
    Ok(())
}
