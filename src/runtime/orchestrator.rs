//! Run orchestration.
//!
//! Opens every connection up front, then services them all from a single
//! readiness loop until the registry is empty. The loop thread is the only
//! one touching sockets and poll registrations; the registry is the only
//! state shared with other threads (the optional stats reporter).

use crate::config::Config;
use crate::registry::ConnectionRegistry;
use crate::report::{RunReport, StatsReporter};
use crate::runtime::{CloseReason, ConnectionDriver, Connector, EventLoop, ReadyKind};
use mio::net::TcpStream;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Execute one load run against the configured echo server.
///
/// Connection-level failures are absorbed into the report. Only failures of
/// the event loop itself (creating the poll, waiting, registering no
/// connection at all) end the run with an error, after all open connections
/// have been closed.
pub fn run(config: &Config, registry: Arc<ConnectionRegistry>) -> io::Result<RunReport> {
    let mut event_loop = EventLoop::new(config.connections)?;
    if let Err(e) = event_loop.watch_interrupts() {
        warn!(error = %e, "Interrupt handling unavailable");
    }
    run_on(config, registry, event_loop)
}

fn run_on(
    config: &Config,
    registry: Arc<ConnectionRegistry>,
    mut event_loop: EventLoop,
) -> io::Result<RunReport> {
    let start = Instant::now();

    let mut driver = ConnectionDriver::new(
        Arc::clone(&registry),
        config.connections,
        config.buffer_size,
        config.requests,
    );

    let reporter = config
        .report_interval
        .map(|interval| StatsReporter::spawn(Arc::clone(&registry), interval))
        .transpose()?;

    info!(
        host = %config.host,
        port = config.port,
        connections = config.connections,
        requests = config.requests,
        buffer_size = config.buffer_size,
        "Starting load run"
    );

    let result = establish(config, &mut event_loop, &mut driver)
        .and_then(|()| drive(&registry, &mut event_loop, &mut driver));

    if let Err(ref e) = result {
        error!(error = %e, "Event loop failed, closing remaining connections");
        driver.close_all(&mut event_loop, CloseReason::Interrupted);
    }

    if let Some(reporter) = reporter {
        reporter.stop();
    }
    result?;

    let mut report = driver.into_report();
    report.elapsed = start.elapsed();

    let summary = report.summary();
    info!(
        clients = summary.connections,
        avg_rtt_us = summary.average_rtt_micros.unwrap_or(0.0),
        completed = report.completed,
        aborted = report.aborted,
        failed = report.failed,
        "All clients finished processing"
    );
    Ok(report)
}

/// Connect, register and send the first request for every connection.
///
/// An interrupt is noticed between connection attempts.
fn establish(
    config: &Config,
    event_loop: &mut EventLoop,
    driver: &mut ConnectionDriver,
) -> io::Result<()> {
    let connector = match Connector::resolve(&config.host, config.port, config.connect_timeout) {
        Ok(connector) => connector,
        Err(e) => {
            error!(host = %config.host, port = config.port, error = %e, "Address resolution failed");
            for _ in 0..config.connections {
                driver.report_mut().record_setup_failure();
            }
            return Ok(());
        }
    };

    open_connections(
        config.connections,
        connector.addr(),
        || connector.connect(),
        event_loop,
        driver,
    )
}

/// Open up to `count` connections obtained from `connect`.
///
/// Connect and register failures only fail the connection at hand. The run
/// fails when registering left it without a single established connection.
fn open_connections<F>(
    count: usize,
    peer: SocketAddr,
    mut connect: F,
    event_loop: &mut EventLoop,
    driver: &mut ConnectionDriver,
) -> io::Result<()>
where
    F: FnMut() -> io::Result<TcpStream>,
{
    let mut register_error = None;

    for attempt in 0..count {
        if event_loop.check_interrupted() {
            warn!(skipped = count - attempt, "Interrupted during setup");
            break;
        }

        let stream = match connect() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(attempt, peer = %peer, error = %e, "Connect failed");
                driver.report_mut().record_setup_failure();
                continue;
            }
        };

        if let Err(e) = driver.open(event_loop, stream, peer) {
            warn!(attempt, peer = %peer, error = %e, "Register failed");
            register_error = Some(e);
        }
    }

    let report = driver.report();
    info!(
        established = report.established,
        failed = report.failed,
        "Connections established"
    );

    match register_error {
        Some(e) if report.established == 0 => Err(e),
        _ => Ok(()),
    }
}

/// Service readiness events until no connection is left.
fn drive(
    registry: &ConnectionRegistry,
    event_loop: &mut EventLoop,
    driver: &mut ConnectionDriver,
) -> io::Result<()> {
    let mut ready: Vec<(usize, ReadyKind)> = Vec::with_capacity(driver.open_connections());

    loop {
        // Also covers an interrupt that arrived during setup
        if event_loop.interrupted() {
            warn!(
                open = registry.len(),
                registered = event_loop.registered(),
                "Interrupted, closing open connections"
            );
            driver.close_all(event_loop, CloseReason::Interrupted);
            driver.report_mut().interrupted = true;
            break;
        }
        if registry.is_empty() {
            break;
        }

        event_loop.wait_ready(&mut ready, None)?;
        for &(handle, kind) in &ready {
            driver.step(event_loop, handle, kind);
        }
    }

    Ok(())
}
