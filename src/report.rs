//! Run statistics.
//!
//! `RunReport` accumulates the outcome of every connection over a run. The
//! registry only holds live connections, so each connection's final metrics
//! are folded in here at the moment it closes.
//!
//! `StatsReporter` is an optional background thread that periodically logs
//! the registry's live aggregate while the event loop keeps running.

use crate::registry::{ConnectionMetrics, ConnectionRegistry, Summary};
use crate::runtime::CloseReason;
use std::fmt;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Outcome of a whole run.
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    /// Connections the run tried to open.
    pub attempted: usize,
    /// Connections that completed setup and were registered.
    pub established: usize,
    /// Connections that failed during setup.
    pub failed: usize,
    /// Connections that closed after reaching their quota.
    pub completed: usize,
    /// Connections closed for any other reason.
    pub aborted: usize,
    /// Exchanges completed across all connections.
    pub total_requests: u64,
    /// Bytes written across all connections.
    pub total_bytes_sent: u64,
    /// The run stopped early on an interrupt signal.
    pub interrupted: bool,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
    finished: Vec<ConnectionMetrics>,
}

impl RunReport {
    pub fn record_setup_failure(&mut self) {
        self.attempted += 1;
        self.failed += 1;
    }

    pub fn record_established(&mut self) {
        self.attempted += 1;
        self.established += 1;
    }

    /// Fold in a closed connection's final metrics.
    pub fn record_closed(&mut self, metrics: Option<ConnectionMetrics>, reason: CloseReason) {
        if reason.is_completion() {
            self.completed += 1;
        } else {
            self.aborted += 1;
        }
        if let Some(metrics) = metrics {
            self.total_requests += metrics.request_count;
            self.total_bytes_sent += metrics.bytes_sent;
            self.finished.push(metrics);
        }
    }

    /// Connection count and mean RTT over every established connection.
    pub fn summary(&self) -> Summary {
        Summary::from_metrics(&self.finished)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary())?;
        writeln!(
            f,
            "attempted: {}\testablished: {}\tfailed: {}",
            self.attempted, self.established, self.failed
        )?;
        writeln!(
            f,
            "completed: {}\taborted: {}\tinterrupted: {}",
            self.completed, self.aborted, self.interrupted
        )?;
        write!(
            f,
            "requests: {}\tbytes sent: {}\telapsed: {:.3}s",
            self.total_requests,
            self.total_bytes_sent,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Background thread logging the registry aggregate at a fixed interval.
pub struct StatsReporter {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StatsReporter {
    /// Start reporting every `interval`.
    pub fn spawn(registry: Arc<ConnectionRegistry>, interval: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("stats-reporter".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let summary = registry.summarize();
                        info!(
                            clients = summary.connections,
                            sampled = summary.sampled,
                            avg_rtt_us = summary.average_rtt_micros.unwrap_or(0.0),
                            "Live connections"
                        );
                    }
                    // Stop requested or reporter dropped
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("Stats reporter panicked");
            }
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;
    use std::time::Instant;

    fn metrics(requests: u64, bytes: u64, rtt: u64) -> ConnectionMetrics {
        ConnectionMetrics {
            peer_address: "127.0.0.1".to_string(),
            peer_port: 7000,
            request_count: requests,
            bytes_sent: bytes,
            last_round_trip_micros: rtt,
            last_request_at: None,
        }
    }

    #[test]
    fn test_report_accounting() {
        let mut report = RunReport::default();
        report.record_established();
        report.record_established();
        report.record_established();
        report.record_setup_failure();

        report.record_closed(Some(metrics(3, 18, 10)), CloseReason::QuotaReached);
        report.record_closed(Some(metrics(3, 18, 20)), CloseReason::QuotaReached);
        report.record_closed(
            Some(metrics(0, 6, 0)),
            CloseReason::Transport(ErrorKind::ConnectionReset),
        );

        assert_eq!(report.attempted, 4);
        assert_eq!(report.established, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 2);
        assert_eq!(report.aborted, 1);
        assert_eq!(report.total_requests, 6);
        assert_eq!(report.total_bytes_sent, 42);

        // The failed exchange stays out of the mean
        let summary = report.summary();
        assert_eq!(summary.connections, 3);
        assert_eq!(summary.average_rtt_micros, Some(15.0));
    }

    #[test]
    fn test_empty_report_display() {
        let report = RunReport::default();
        let text = report.to_string();
        assert!(text.starts_with("clients: 0\tRTT: n/a"));
        assert!(text.contains("attempted: 0"));
    }

    #[test]
    fn test_reporter_stops_promptly() {
        let registry = ConnectionRegistry::new();
        registry.add(1, "127.0.0.1", 7000);

        let reporter = StatsReporter::spawn(Arc::clone(&registry), Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(35));

        let start = Instant::now();
        reporter.stop();
        assert!(start.elapsed() < Duration::from_secs(1));

        // Reporting never mutates the registry
        assert_eq!(registry.len(), 1);
    }
}
