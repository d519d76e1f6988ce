//! Connection-event dispatch runtime.
//!
//! Three interchangeable readiness strategies drive one shared dispatch
//! loop:
//! - `poll`: `poll(2)` over an interest list rebuilt every cycle
//! - `epoll`: level-triggered epoll (Linux only)
//! - `mio`: edge-triggered mio, fanned out over forked worker processes
//!
//! Shared pieces:
//! - `ListeningSocket` / `accept_one`: non-blocking socket lifecycle
//! - `ConnectionTable`: per-dispatcher arena of connections keyed by fd
//! - `Dispatcher`: wait, accept, service, repeat

mod connection;
mod dispatch;
mod error;
pub mod protocol;
mod readiness;
mod socket;

#[cfg(target_os = "linux")]
mod epoll;
mod mio;
mod poll;

#[cfg(test)]
mod testutil;

pub(crate) use connection::Connection;
pub(crate) use dispatch::{DispatchSettings, Dispatcher};
pub(crate) use error::{Error, Result};
pub(crate) use protocol::{Handler, Protocol};
pub(crate) use readiness::{Readiness, StrategyKind};
pub(crate) use socket::{create_listener, ListeningSocket};

use crate::config::{Config, ProtocolType, StrategyType};
use crate::protocols::{Discard, Echo};
use std::time::Duration;
use tracing::{info, warn};

/// Run the server with the configured strategy. Returns only on a fatal
/// error, or once every edge-triggered worker has exited.
pub fn run(config: Config) -> Result<()> {
    // Map config types to runtime types
    let strategy = match config.strategy {
        StrategyType::Poll => StrategyKind::Poll,
        StrategyType::Level => StrategyKind::Level,
        StrategyType::Edge => StrategyKind::Edge,
    };
    let protocol = match config.protocol {
        ProtocolType::Echo => Protocol::Echo,
        ProtocolType::Discard => Protocol::Discard,
    };
    let settings = DispatchSettings::from(&config);

    let listener = create_listener(config.host, config.port, config.backlog)?;
    info!(
        addr = %listener.local_addr(),
        strategy = ?strategy,
        protocol = ?protocol,
        "Listening"
    );

    match strategy {
        StrategyKind::Poll => serve(
            listener,
            poll::PollStrategy::new(settings.read_quota),
            protocol,
            settings,
        ),
        StrategyKind::Level => run_level(listener, protocol, settings),
        StrategyKind::Edge => run_edge(listener, config.workers, protocol, settings),
    }
}

#[cfg(target_os = "linux")]
fn run_level(
    listener: ListeningSocket,
    protocol: Protocol,
    settings: DispatchSettings,
) -> Result<()> {
    let strategy = epoll::EpollStrategy::new(settings.max_events, settings.read_quota)
        .map_err(Error::SocketCreate)?;
    serve(listener, strategy, protocol, settings)
}

#[cfg(not(target_os = "linux"))]
fn run_level(
    _listener: ListeningSocket,
    _protocol: Protocol,
    _settings: DispatchSettings,
) -> Result<()> {
    Err(Error::SocketCreate(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "level-triggered epoll is only available on Linux",
    )))
}

fn run_edge(
    listener: ListeningSocket,
    workers: usize,
    protocol: Protocol,
    settings: DispatchSettings,
) -> Result<()> {
    info!(workers, "Forking edge-triggered workers");

    let exits = self::mio::spawn_workers(listener, workers, |worker_id, listener| {
        info!(worker = worker_id, pid = std::process::id(), "Worker started");
        let strategy =
            self::mio::MioStrategy::new(settings.max_events).map_err(Error::SocketCreate)?;
        serve(listener, strategy, protocol, settings.clone())
    })?;

    for exit in &exits {
        if !exit.status.success() {
            warn!(%exit, "Worker did not exit cleanly");
        }
    }
    info!(workers = exits.len(), "All workers exited");
    Ok(())
}

/// Build a dispatcher for `protocol` and run it forever.
fn serve<S: Readiness>(
    listener: ListeningSocket,
    strategy: S,
    protocol: Protocol,
    settings: DispatchSettings,
) -> Result<()> {
    match protocol {
        Protocol::Echo => Dispatcher::new(listener, strategy, Echo::default(), settings)?.run(),
        Protocol::Discard => {
            Dispatcher::new(listener, strategy, Discard::default(), settings)?.run()
        }
    }
}

impl From<&Config> for DispatchSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_connections: config.max_connections,
            max_events: config.max_events,
            read_chunk: config.read_chunk,
            read_quota: config.read_quota,
            max_outbound: config.max_outbound,
            wait_timeout: config.wait_timeout_ms.map(Duration::from_millis),
            idle_timeout: config.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}
