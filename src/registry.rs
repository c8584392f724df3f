//! Thread-safe table of per-connection metrics.
//!
//! The registry is the one structure shared across threads: the event loop
//! mutates it on every exchange while the periodic reporter reads aggregates.
//! Every operation takes the table lock once, so a reader never observes a
//! half-updated record.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::{debug, warn};

/// Counters and timestamps for a single open connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionMetrics {
    /// Address of the echo server as seen by this connection
    pub peer_address: String,
    /// Port of the echo server
    pub peer_port: u16,
    /// Completed request/response exchanges
    pub request_count: u64,
    /// Cumulative bytes written
    pub bytes_sent: u64,
    /// Most recent round-trip time in microseconds (0 = none measured yet)
    pub last_round_trip_micros: u64,
    /// Baseline for the next round-trip measurement
    pub last_request_at: Option<Instant>,
}

impl ConnectionMetrics {
    fn new(peer_address: String, peer_port: u16) -> Self {
        Self {
            peer_address,
            peer_port,
            request_count: 0,
            bytes_sent: 0,
            last_round_trip_micros: 0,
            last_request_at: None,
        }
    }
}

/// Aggregate view over a set of connections
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    /// Number of connections considered
    pub connections: usize,
    /// Connections that contributed a round-trip sample
    pub sampled: usize,
    /// Mean of the non-zero round-trip times, `None` when nothing was sampled
    pub average_rtt_micros: Option<f64>,
}

impl Summary {
    /// Summarize an arbitrary collection of metrics.
    ///
    /// Connections that never completed a measured exchange keep an RTT of
    /// zero and are left out of the mean.
    pub fn from_metrics<'a>(metrics: impl IntoIterator<Item = &'a ConnectionMetrics>) -> Self {
        let mut connections = 0;
        let mut sampled = 0;
        let mut total_rtt: u128 = 0;

        for m in metrics {
            connections += 1;
            if m.last_round_trip_micros != 0 {
                sampled += 1;
                total_rtt += u128::from(m.last_round_trip_micros);
            }
        }

        Summary {
            connections,
            sampled,
            average_rtt_micros: (sampled > 0).then(|| total_rtt as f64 / sampled as f64),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.average_rtt_micros {
            Some(avg) => write!(
                f,
                "clients: {}\tRTT: {:.3}us\tsampled: {}",
                self.connections, avg, self.sampled
            ),
            None => write!(f, "clients: {}\tRTT: n/a\tsampled: 0", self.connections),
        }
    }
}

/// Concurrency-safe store of [`ConnectionMetrics`] keyed by connection handle.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<usize, ConnectionMetrics>>,
}

impl ConnectionRegistry {
    /// Create an empty registry shared by reference counting.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // Every mutation is a single insert or field update, so a poisoned lock
    // still guards consistent data.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<usize, ConnectionMetrics>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<usize, ConnectionMetrics>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a freshly established connection.
    ///
    /// Adding a handle that is already present replaces its metrics with a
    /// fresh record.
    pub fn add(&self, handle: usize, peer_address: impl Into<String>, peer_port: u16) {
        let metrics = ConnectionMetrics::new(peer_address.into(), peer_port);
        if self.write().insert(handle, metrics).is_some() {
            warn!(conn_id = handle, "Replaced metrics for an already tracked connection");
        }
    }

    /// Stop tracking a connection, returning its final metrics.
    ///
    /// Removing an unknown handle is a no-op.
    pub fn remove(&self, handle: usize) -> Option<ConnectionMetrics> {
        let removed = self.write().remove(&handle);
        if let Some(ref m) = removed {
            debug!(
                conn_id = handle,
                peer = %m.peer_address,
                requests = m.request_count,
                bytes_sent = m.bytes_sent,
                "Disconnected"
            );
        }
        removed
    }

    /// Check whether a handle is tracked.
    pub fn exists(&self, handle: usize) -> bool {
        self.read().contains_key(&handle)
    }

    /// Snapshot of the metrics for one connection.
    #[cfg(test)]
    pub fn get(&self, handle: usize) -> Option<ConnectionMetrics> {
        self.read().get(&handle).cloned()
    }

    /// Complete one exchange for `handle`.
    ///
    /// Measures the time since the previous baseline, resets the baseline to
    /// now and bumps the request count. Returns the round-trip time in
    /// microseconds, or `None` when there was no baseline yet (or the handle
    /// is unknown).
    pub fn record_round_trip(&self, handle: usize) -> Option<u64> {
        let now = Instant::now();
        let mut connections = self.write();
        let metrics = connections.get_mut(&handle)?;

        let rtt = metrics.last_request_at.map(|since| {
            let micros = now.saturating_duration_since(since).as_micros();
            u64::try_from(micros).unwrap_or(u64::MAX)
        });
        if let Some(rtt) = rtt {
            metrics.last_round_trip_micros = rtt;
        }
        metrics.last_request_at = Some(now);
        metrics.request_count += 1;

        rtt
    }

    /// Add `count` bytes to the connection's sent total and return the new
    /// total, or 0 if the handle is unknown.
    pub fn record_bytes_sent(&self, handle: usize, count: u64) -> u64 {
        match self.write().get_mut(&handle) {
            Some(metrics) => {
                metrics.bytes_sent += count;
                metrics.bytes_sent
            }
            None => 0,
        }
    }

    /// Completed exchanges for `handle`, 0 if unknown.
    pub fn request_count_of(&self, handle: usize) -> u64 {
        self.read()
            .get(&handle)
            .map(|m| m.request_count)
            .unwrap_or(0)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Connection count and mean round-trip time over the tracked connections.
    pub fn summarize(&self) -> Summary {
        Summary::from_metrics(self.read().values())
    }
}
