//! echo-load: A multiplexed load client for TCP echo servers
//!
//! Opens many concurrent connections to an echo server and drives each one
//! through a fixed number of request/response exchanges from a single
//! readiness loop, recording per-connection round-trip times and volume.
//!
//! Features:
//! - Non-blocking sockets multiplexed with epoll/kqueue via mio
//! - Thread-safe metrics registry with optional periodic reporting
//! - Configuration via CLI arguments or TOML file

mod config;
mod registry;
mod report;
mod runtime;

use config::Config;
use registry::ConnectionRegistry;
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
        connections = config.connections,
        requests = config.requests,
        "Starting echo-load"
    );

    let registry = ConnectionRegistry::new();
    let report = runtime::run(&config, registry)?;

    println!("{report}");
    Ok(())
}
