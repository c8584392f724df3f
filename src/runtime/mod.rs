//! Event-driven connection runtime.
//!
//! Readiness-based I/O through mio (epoll on Linux, kqueue on macOS), one
//! loop thread servicing every connection:
//! - `Connector`: synchronous connect, hands over non-blocking sockets
//! - `EventLoop`: readiness notification over registered connections
//! - `ConnectionDriver`: per-connection send/receive state machine
//! - `BufferPool`: one fixed-size receive buffer per open connection

mod buffer;
mod connection;
mod connector;
mod driver;
mod event_loop;
mod orchestrator;
pub mod protocol;

pub(crate) use buffer::BufferPool;
pub(crate) use connection::{CloseReason, ConnState, Connection};
pub(crate) use connector::Connector;
pub(crate) use driver::ConnectionDriver;
pub(crate) use event_loop::{EventLoop, ReadyKind};

pub use orchestrator::run;
