//! Connection establishment.
//!
//! Connects synchronously, then hands back a non-blocking mio stream ready
//! to be registered with the event loop.

use mio::net::TcpStream;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

/// Opens client sockets to a single resolved echo server address.
#[derive(Debug, Clone)]
pub struct Connector {
    addr: SocketAddr,
    timeout: Option<Duration>,
}

impl Connector {
    /// Resolve `host:port` once; every connection reuses the first address.
    pub fn resolve(host: &str, port: u16, timeout: Option<Duration>) -> io::Result<Self> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {host}:{port}"),
            )
        })?;
        Ok(Self { addr, timeout })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open one connection.
    ///
    /// Blocks until the TCP handshake completes (or the timeout elapses),
    /// then switches the socket to non-blocking mode.
    pub fn connect(&self) -> io::Result<TcpStream> {
        let socket = socket2::Socket::new(
            match self.addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;

        // Requests are tiny; don't let Nagle hold them back
        socket.set_nodelay(true)?;

        match self.timeout {
            Some(timeout) => socket.connect_timeout(&self.addr.into(), timeout)?,
            None => socket.connect(&self.addr.into())?,
        }

        socket.set_nonblocking(true)?;
        let stream: std::net::TcpStream = socket.into();
        Ok(TcpStream::from_std(stream))
    }
}
