//! Connection state machine for client connections.
//!
//! Each connection tracks where it is in the send/receive cycle along with
//! the resources it holds (socket and receive buffer).

use mio::net::TcpStream;
use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Socket connected, not yet tracked by the event loop.
    Connecting,
    /// Writing the request payload.
    Sending,
    /// Request written, nothing received for it yet.
    AwaitingResponse,
    /// Part of the echo has arrived.
    Receiving {
        /// Bytes of the echo already in the receive buffer.
        received: usize,
    },
    /// Connection is being torn down.
    Closing,
}

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// All requested exchanges completed.
    QuotaReached,
    /// The server closed its side.
    PeerClosed,
    /// The request could not be written in a single send.
    ShortWrite,
    /// The server answered with bytes other than our payload.
    UnexpectedEcho,
    /// Readiness reported an error condition on the socket.
    SocketError,
    /// Readiness reported a hang-up with nothing left to read.
    HangUp,
    /// A read or write failed.
    Transport(io::ErrorKind),
    /// The run was interrupted.
    Interrupted,
}

impl CloseReason {
    /// True when the connection finished its quota.
    pub fn is_completion(&self) -> bool {
        matches!(self, CloseReason::QuotaReached)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::QuotaReached => write!(f, "quota reached"),
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::ShortWrite => write!(f, "short write"),
            CloseReason::UnexpectedEcho => write!(f, "unexpected echo"),
            CloseReason::SocketError => write!(f, "socket error"),
            CloseReason::HangUp => write!(f, "hang-up"),
            CloseReason::Transport(kind) => write!(f, "transport error: {kind}"),
            CloseReason::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    /// Non-blocking socket to the echo server.
    pub stream: TcpStream,
    /// Server address this connection reached.
    pub peer: SocketAddr,
    /// Receive buffer index in the buffer pool.
    pub buf_idx: usize,
    /// Current connection state.
    pub state: ConnState,
}

impl Connection {
    /// Wrap a freshly connected socket.
    pub fn new(stream: TcpStream, peer: SocketAddr, buf_idx: usize) -> Self {
        Self {
            stream,
            peer,
            buf_idx,
            state: ConnState::Connecting,
        }
    }

    /// Transition to sending state.
    pub fn start_sending(&mut self) {
        self.state = ConnState::Sending;
    }

    /// Request written; wait for readiness.
    pub fn await_response(&mut self) {
        self.state = ConnState::AwaitingResponse;
    }

    /// Record partial progress on the current echo.
    pub fn receiving(&mut self, received: usize) {
        self.state = ConnState::Receiving { received };
    }

    /// Bytes of the current echo received so far.
    pub fn received(&self) -> usize {
        match self.state {
            ConnState::Receiving { received } => received,
            _ => 0,
        }
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connection_state_transitions() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let std_stream = std::net::TcpStream::connect(addr).unwrap();
        std_stream.set_nonblocking(true).unwrap();

        let mut conn = Connection::new(TcpStream::from_std(std_stream), addr, 0);
        assert_eq!(conn.state, ConnState::Connecting);

        conn.start_sending();
        assert_eq!(conn.state, ConnState::Sending);

        conn.await_response();
        assert_eq!(conn.state, ConnState::AwaitingResponse);
        assert_eq!(conn.received(), 0);

        conn.receiving(4);
        assert_eq!(conn.state, ConnState::Receiving { received: 4 });
        assert_eq!(conn.received(), 4);

        conn.close();
        assert_eq!(conn.state, ConnState::Closing);
    }

    #[test]
    fn test_close_reason_display() {
        assert!(CloseReason::QuotaReached.is_completion());
        assert!(!CloseReason::PeerClosed.is_completion());
        assert_eq!(
            CloseReason::Transport(io::ErrorKind::ConnectionReset).to_string(),
            format!("transport error: {}", io::ErrorKind::ConnectionReset)
        );
    }
}
