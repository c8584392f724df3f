//! Per-connection protocol driver.
//!
//! Each ready handle gets one step of the state machine:
//!
//! ```text
//! Connecting -> Sending -> AwaitingResponse -> Receiving -> Sending | Closing
//! ```
//!
//! Reads drain the socket until the echo is complete or the socket would
//! block, which is what mio's edge-triggered readiness requires. Progress on a
//! partial echo lives in `ConnState::Receiving` between notifications.
//!
//! Closing is the only way a connection leaves the driver: the slab slot, the
//! poll registration, the registry entry and the socket all go in one step.

use crate::registry::ConnectionRegistry;
use crate::report::RunReport;
use crate::runtime::event_loop::{EventLoop, ReadyKind};
use crate::runtime::protocol::{after_exchange, check_echo, EchoStatus, NextStep, REQUEST_PAYLOAD};
use crate::runtime::{BufferPool, CloseReason, ConnState, Connection};
use mio::net::TcpStream;
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Result of driving a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// Still open, waiting for the next readiness notification.
    Open,
    /// Must be closed.
    Close(CloseReason),
}

/// Drives every open connection through its request/response cycle.
pub struct ConnectionDriver {
    registry: Arc<ConnectionRegistry>,
    connections: Slab<Connection>,
    buffers: BufferPool,
    quota: u64,
    report: RunReport,
}

impl ConnectionDriver {
    /// Create a driver for up to `capacity` connections, each performing
    /// `quota` exchanges with a `buffer_size`-byte receive buffer.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        capacity: usize,
        buffer_size: usize,
        quota: u64,
    ) -> Self {
        Self {
            registry,
            connections: Slab::with_capacity(capacity),
            buffers: BufferPool::new(capacity, buffer_size),
            quota,
            report: RunReport::default(),
        }
    }

    /// Number of open connections.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn report(&self) -> &RunReport {
        &self.report
    }

    pub fn report_mut(&mut self) -> &mut RunReport {
        &mut self.report
    }

    pub fn into_report(self) -> RunReport {
        self.report
    }

    /// Current state of a connection, if it is open.
    #[cfg(test)]
    pub fn state_of(&self, handle: usize) -> Option<ConnState> {
        self.connections.get(handle).map(|conn| conn.state)
    }

    /// Take ownership of a connected socket: track it in the registry,
    /// register it with the event loop, and send the first request.
    ///
    /// Returns the handle of the now open connection. Returns `None` if no
    /// receive buffer was left or the first request already closed the
    /// connection. A failure to register with the event loop is counted as a
    /// setup failure and returned as an error after the connection has been
    /// released.
    pub fn open(
        &mut self,
        event_loop: &mut EventLoop,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<Option<usize>> {
        let Some(buf_idx) = self.buffers.alloc() else {
            warn!(peer = %peer, "Buffer pool exhausted, dropping connection");
            self.report.record_setup_failure();
            return Ok(None);
        };

        let handle = self.connections.insert(Connection::new(stream, peer, buf_idx));
        self.registry.add(handle, peer.ip().to_string(), peer.port());

        let conn = &mut self.connections[handle];
        if let Err(e) = event_loop.register(&mut conn.stream, handle) {
            self.release(handle);
            self.report.record_setup_failure();
            return Err(e);
        }

        self.report.record_established();
        debug!(conn_id = handle, peer = %peer, "Connected");

        if let Outcome::Close(reason) = self.send(handle) {
            self.close(event_loop, handle, reason);
            return Ok(None);
        }
        Ok(Some(handle))
    }

    /// Handle one readiness notification.
    pub fn step(&mut self, event_loop: &mut EventLoop, handle: usize, kind: ReadyKind) {
        // Stale events for connections closed earlier in the same batch
        if !self.connections.contains(handle) {
            return;
        }

        let outcome = match kind {
            ReadyKind::Error => Outcome::Close(CloseReason::SocketError),
            ReadyKind::HangUp => Outcome::Close(CloseReason::HangUp),
            ReadyKind::Readable => self.receive(handle),
        };

        if let Outcome::Close(reason) = outcome {
            self.close(event_loop, handle, reason);
        }
    }

    /// Close every open connection.
    pub fn close_all(&mut self, event_loop: &mut EventLoop, reason: CloseReason) {
        let handles: Vec<usize> = self.connections.iter().map(|(handle, _)| handle).collect();
        for handle in handles {
            self.close(event_loop, handle, reason);
        }
    }

    /// Write one request. The payload must go out in a single write.
    fn send(&mut self, handle: usize) -> Outcome {
        let Some(conn) = self.connections.get_mut(handle) else {
            return Outcome::Open;
        };
        conn.start_sending();

        let written = loop {
            match conn.stream.write(REQUEST_PAYLOAD) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break 0,
                Err(e) => return Outcome::Close(CloseReason::Transport(e.kind())),
            }
        };

        if written > 0 {
            self.registry.record_bytes_sent(handle, written as u64);
        }
        if written < REQUEST_PAYLOAD.len() {
            return Outcome::Close(CloseReason::ShortWrite);
        }

        conn.await_response();
        Outcome::Open
    }

    /// Read as much of the echo as is available.
    fn receive(&mut self, handle: usize) -> Outcome {
        let Some(conn) = self.connections.get_mut(handle) else {
            return Outcome::Open;
        };
        if !matches!(
            conn.state,
            ConnState::AwaitingResponse | ConnState::Receiving { .. }
        ) {
            return Outcome::Open;
        }

        let buf = self.buffers.get_mut(conn.buf_idx);
        loop {
            let received = conn.received();
            match conn.stream.read(&mut buf[received..]) {
                Ok(0) => return Outcome::Close(CloseReason::PeerClosed),
                Ok(n) => {
                    let total = received + n;
                    match check_echo(&buf[..total]) {
                        EchoStatus::Complete => break,
                        EchoStatus::Incomplete => conn.receiving(total),
                        EchoStatus::Mismatch => return Outcome::Close(CloseReason::UnexpectedEcho),
                    }
                }
                // Drained; partial progress (if any) stays in the state
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Outcome::Open,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Outcome::Close(CloseReason::Transport(e.kind())),
            }
        }

        conn.await_response();
        self.complete_exchange(handle)
    }

    /// Account for a full echo and decide whether to go again.
    fn complete_exchange(&mut self, handle: usize) -> Outcome {
        let rtt = self.registry.record_round_trip(handle);
        let completed = self.registry.request_count_of(handle);
        trace!(conn_id = handle, requests = completed, rtt_us = ?rtt, "Exchange complete");

        match after_exchange(completed, self.quota) {
            NextStep::SendNext => self.send(handle),
            NextStep::Finish => Outcome::Close(CloseReason::QuotaReached),
        }
    }

    /// Tear a connection down. Safe to call on an already closed handle.
    fn close(&mut self, event_loop: &mut EventLoop, handle: usize, reason: CloseReason) {
        let Some(mut conn) = self.connections.try_remove(handle) else {
            return;
        };
        conn.close();
        event_loop.deregister(&mut conn.stream, handle);
        let metrics = self.registry.remove(handle);
        debug_assert!(!self.registry.exists(handle) && !event_loop.is_registered(handle));
        self.buffers.free(conn.buf_idx);
        let peer = conn.peer;
        // Socket closes here, right after the registry entry is gone
        drop(conn);

        if reason.is_completion() {
            debug!(conn_id = handle, peer = %peer, reason = %reason, "Connection closed");
        } else {
            warn!(conn_id = handle, peer = %peer, reason = %reason, "Connection closed");
        }
        self.report.record_closed(metrics, reason);
    }

    /// Undo `open` for a connection that never reached the event loop.
    fn release(&mut self, handle: usize) {
        if let Some(conn) = self.connections.try_remove(handle) {
            self.registry.remove(handle);
            self.buffers.free(conn.buf_idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Connector;
    use std::net::{Shutdown, TcpListener};
    use std::thread;
    use std::time::Duration;

    /// How a test server answers each request.
    #[derive(Clone, Copy)]
    enum Server {
        /// Echo everything back.
        Echo,
        /// Echo each request in two halves with a pause in between.
        Split,
        /// Close the connection without answering.
        Hangup,
        /// Answer with bytes that are not the request.
        Garbage,
    }

    fn spawn_server(mode: Server) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                thread::spawn(move || {
                    let mut buf = [0u8; 64];
                    loop {
                        let n = match stream.read(&mut buf) {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        let result = match mode {
                            Server::Echo => stream.write_all(&buf[..n]),
                            Server::Split => {
                                let half = n / 2;
                                stream.write_all(&buf[..half]).and_then(|_| {
                                    thread::sleep(Duration::from_millis(20));
                                    stream.write_all(&buf[half..n])
                                })
                            }
                            Server::Hangup => return,
                            Server::Garbage => stream.write_all(b"XXXXXX"),
                        };
                        if result.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        port
    }

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        event_loop: EventLoop,
        driver: ConnectionDriver,
        connector: Connector,
    }

    impl Harness {
        fn new(mode: Server, quota: u64) -> Self {
            let port = spawn_server(mode);
            let registry = ConnectionRegistry::new();
            Self {
                driver: ConnectionDriver::new(Arc::clone(&registry), 8, 7, quota),
                registry,
                event_loop: EventLoop::new(8).unwrap(),
                connector: Connector::resolve("127.0.0.1", port, None).unwrap(),
            }
        }

        fn open(&mut self) -> usize {
            let stream = self.connector.connect().unwrap();
            self.driver
                .open(&mut self.event_loop, stream, self.connector.addr())
                .unwrap()
                .unwrap()
        }

        /// Run one wait/step round.
        fn turn(&mut self) {
            let mut ready = Vec::new();
            self.event_loop
                .wait_ready(&mut ready, Some(Duration::from_millis(100)))
                .unwrap();
            for (handle, kind) in ready {
                self.driver.step(&mut self.event_loop, handle, kind);
            }
        }

        fn run_until<F: Fn(&Self) -> bool>(&mut self, done: F) {
            for _ in 0..500 {
                if done(self) {
                    return;
                }
                self.turn();
            }
            panic!("condition not reached");
        }
    }

    #[test]
    fn test_open_tracks_connection() {
        let mut h = Harness::new(Server::Echo, 3);
        let handle = h.open();

        assert!(h.registry.exists(handle));
        assert!(h.event_loop.is_registered(handle));
        assert_eq!(h.driver.state_of(handle), Some(ConnState::AwaitingResponse));
        assert_eq!(h.driver.open_connections(), 1);

        let metrics = h.registry.get(handle).unwrap();
        assert_eq!(metrics.peer_address, "127.0.0.1");
        assert_eq!(metrics.bytes_sent, REQUEST_PAYLOAD.len() as u64);
        assert_eq!(metrics.request_count, 0);
        assert_eq!(h.driver.report().established, 1);
    }

    #[test]
    fn test_open_with_failed_first_send() {
        let mut h = Harness::new(Server::Echo, 3);
        let stream = h.connector.connect().unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        let opened = h
            .driver
            .open(&mut h.event_loop, stream, h.connector.addr())
            .unwrap();

        assert!(opened.is_none());
        assert!(h.registry.is_empty());
        assert_eq!(h.event_loop.registered(), 0);
        assert_eq!(h.driver.open_connections(), 0);
        assert_eq!(h.driver.report().established, 1);
        assert_eq!(h.driver.report().aborted, 1);
    }

    #[test]
    fn test_register_failure_releases_connection() {
        let mut h = Harness::new(Server::Echo, 3);
        let mut stream = h.connector.connect().unwrap();
        // Taken by another token, so the driver cannot register it
        h.event_loop.register(&mut stream, 10_000).unwrap();

        let result = h.driver.open(&mut h.event_loop, stream, h.connector.addr());

        assert!(result.is_err());
        assert!(h.registry.is_empty());
        assert_eq!(h.driver.open_connections(), 0);
        assert_eq!(h.driver.report().established, 0);
        assert_eq!(h.driver.report().failed, 1);

        // The buffer went back to the pool
        for _ in 0..8 {
            h.open();
        }
        assert_eq!(h.registry.len(), 8);
    }

    #[test]
    fn test_quota_boundary() {
        let quota = 3;
        let mut h = Harness::new(Server::Echo, quota);
        let handle = h.open();

        // quota - 1 exchanges: still registered, next request in flight
        h.run_until(|h| h.registry.request_count_of(handle) >= quota - 1);
        assert_eq!(h.registry.request_count_of(handle), quota - 1);
        assert!(h.registry.exists(handle));
        assert!(h.event_loop.is_registered(handle));
        assert_eq!(h.driver.state_of(handle), Some(ConnState::AwaitingResponse));

        // quota exchanges: closed and removed everywhere
        h.run_until(|h| h.registry.is_empty());
        assert!(!h.registry.exists(handle));
        assert!(!h.event_loop.is_registered(handle));
        assert!(h.driver.state_of(handle).is_none());

        let report = h.driver.report();
        assert_eq!(report.completed, 1);
        assert_eq!(report.aborted, 0);
        assert_eq!(report.total_requests, quota);
        assert_eq!(report.total_bytes_sent, quota * REQUEST_PAYLOAD.len() as u64);
    }

    #[test]
    fn test_single_exchange_quota() {
        let mut h = Harness::new(Server::Echo, 1);
        h.open();
        h.run_until(|h| h.registry.is_empty());

        let report = h.driver.report();
        assert_eq!(report.completed, 1);
        assert_eq!(report.total_requests, 1);
        // No baseline before the first exchange, so nothing to average
        assert_eq!(report.summary().sampled, 0);
    }

    #[test]
    fn test_partial_echo_across_notifications() {
        let mut h = Harness::new(Server::Split, 2);
        let handle = h.open();

        // First half arrives, second is held back by the server
        h.run_until(|h| matches!(h.driver.state_of(handle), Some(ConnState::Receiving { .. })));
        let received = match h.driver.state_of(handle) {
            Some(ConnState::Receiving { received }) => received,
            other => panic!("unexpected state {other:?}"),
        };
        assert!(received > 0 && received < REQUEST_PAYLOAD.len());
        assert_eq!(h.registry.request_count_of(handle), 0);

        h.run_until(|h| h.registry.is_empty());
        assert_eq!(h.driver.report().completed, 1);
        assert_eq!(h.driver.report().total_requests, 2);
    }

    #[test]
    fn test_peer_close_removes_connection() {
        let mut h = Harness::new(Server::Hangup, 3);
        let handle = h.open();

        h.run_until(|h| h.registry.is_empty());
        assert!(!h.event_loop.is_registered(handle));

        let report = h.driver.report();
        assert_eq!(report.completed, 0);
        assert_eq!(report.aborted, 1);
        assert_eq!(report.total_requests, 0);
        // Failed before any exchange: excluded from the mean
        assert_eq!(report.summary().connections, 1);
        assert_eq!(report.summary().average_rtt_micros, None);
    }

    #[test]
    fn test_unexpected_echo_closes() {
        let mut h = Harness::new(Server::Garbage, 3);
        h.open();

        h.run_until(|h| h.registry.is_empty());
        assert_eq!(h.driver.report().aborted, 1);
        assert_eq!(h.driver.open_connections(), 0);
    }

    #[test]
    fn test_error_event_closes_once() {
        let mut h = Harness::new(Server::Echo, 3);
        let handle = h.open();

        h.driver.step(&mut h.event_loop, handle, ReadyKind::Error);
        assert!(!h.registry.exists(handle));
        assert!(!h.event_loop.is_registered(handle));

        // Late events for the closed handle are ignored
        h.driver.step(&mut h.event_loop, handle, ReadyKind::Readable);
        h.driver.step(&mut h.event_loop, handle, ReadyKind::HangUp);
        assert_eq!(h.driver.report().aborted, 1);
    }

    #[test]
    fn test_close_all() {
        let mut h = Harness::new(Server::Echo, 1_000);
        h.open();
        h.open();
        h.open();
        assert_eq!(h.registry.len(), 3);

        h.driver.close_all(&mut h.event_loop, CloseReason::Interrupted);
        assert!(h.registry.is_empty());
        assert_eq!(h.event_loop.registered(), 0);
        assert_eq!(h.driver.open_connections(), 0);
        assert_eq!(h.driver.report().aborted, 3);
    }

    #[test]
    fn test_buffer_pool_bounds_connections() {
        let port = spawn_server(Server::Echo);
        let registry = ConnectionRegistry::new();
        let mut driver = ConnectionDriver::new(Arc::clone(&registry), 1, 7, 100);
        let mut event_loop = EventLoop::new(1).unwrap();
        let connector = Connector::resolve("127.0.0.1", port, None).unwrap();

        let first = driver
            .open(&mut event_loop, connector.connect().unwrap(), connector.addr())
            .unwrap();
        let second = driver
            .open(&mut event_loop, connector.connect().unwrap(), connector.addr())
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(driver.report().failed, 1);
    }
}
