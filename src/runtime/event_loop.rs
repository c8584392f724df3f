//! Readiness notification for client connections.
//!
//! Thin layer over `mio::Poll` (epoll on Linux, kqueue on macOS). mio is
//! edge-triggered: a handle is reported once per new activity, so whoever
//! consumes a `Readable` event must read until the echo is complete or the
//! socket would block.
//!
//! Interrupt signals are delivered through a self-pipe registered on the same
//! poll, so the loop thread notices them without any extra blocking call.

use mio::net::{TcpStream, UnixStream};
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::SigId;
use std::collections::HashSet;
use std::io::{self, Read};
use std::time::Duration;
use tracing::{debug, warn};

const SIGNAL_TOKEN: Token = Token(usize::MAX);

/// What happened on a ready handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyKind {
    /// Data (or EOF) is available to read.
    Readable,
    /// The socket reported an error condition.
    Error,
    /// The peer hung up and nothing is left to read.
    HangUp,
}

/// Map readiness flags onto a [`ReadyKind`].
///
/// Errors win over everything else. A hang-up that still carries readable
/// data is reported as `Readable` so the remaining bytes (and the EOF) are
/// consumed by the normal read path.
pub fn classify(is_error: bool, is_readable: bool, is_closed: bool) -> Option<ReadyKind> {
    if is_error {
        Some(ReadyKind::Error)
    } else if is_readable {
        Some(ReadyKind::Readable)
    } else if is_closed {
        Some(ReadyKind::HangUp)
    } else {
        None
    }
}

/// Owns the poll instance and the set of registered connection handles.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    registered: HashSet<usize>,
    signal_pipe: Option<UnixStream>,
    signal_ids: Vec<SigId>,
    interrupted: bool,
}

impl EventLoop {
    /// Create an event loop able to report `capacity` events per wait.
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            // +1 leaves room for the signal pipe
            events: Events::with_capacity(capacity.max(1) + 1),
            registered: HashSet::with_capacity(capacity),
            signal_pipe: None,
            signal_ids: Vec::new(),
            interrupted: false,
        })
    }

    /// Route SIGINT and SIGTERM into this loop.
    ///
    /// After a signal arrives, [`EventLoop::interrupted`] returns true and the
    /// current or next `wait_ready` call returns.
    pub fn watch_interrupts(&mut self) -> io::Result<()> {
        if self.signal_pipe.is_some() {
            return Ok(());
        }

        let (reader, writer) = std::os::unix::net::UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        for signal in [SIGINT, SIGTERM] {
            let id = signal_hook::low_level::pipe::register(signal, writer.try_clone()?)?;
            self.signal_ids.push(id);
        }

        let mut reader = UnixStream::from_std(reader);
        self.poll
            .registry()
            .register(&mut reader, SIGNAL_TOKEN, Interest::READABLE)?;
        self.signal_pipe = Some(reader);
        Ok(())
    }

    /// Start watching a connection for readability (errors and hang-ups are
    /// always reported).
    pub fn register(&mut self, stream: &mut TcpStream, handle: usize) -> io::Result<()> {
        self.poll
            .registry()
            .register(stream, Token(handle), Interest::READABLE)?;
        self.registered.insert(handle);
        Ok(())
    }

    /// Stop watching a connection. Unknown handles are ignored.
    pub fn deregister(&mut self, stream: &mut TcpStream, handle: usize) {
        if !self.registered.remove(&handle) {
            return;
        }
        if let Err(e) = self.poll.registry().deregister(stream) {
            debug!(conn_id = handle, error = %e, "Deregister failed");
        }
    }

    pub fn is_registered(&self, handle: usize) -> bool {
        self.registered.contains(&handle)
    }

    /// Number of registered connections.
    pub fn registered(&self) -> usize {
        self.registered.len()
    }

    /// True once an interrupt signal has been received.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Pick up pending interrupts without waiting on the poll.
    ///
    /// For code that runs outside `wait_ready`, such as connection setup.
    pub fn check_interrupted(&mut self) -> bool {
        if !self.interrupted {
            self.drain_signal_pipe();
        }
        self.interrupted
    }

    /// Block until at least one registered handle is ready, the timeout
    /// elapses, or an interrupt arrives. Ready handles are appended to
    /// `ready` (which is cleared first).
    ///
    /// Returns immediately when no connection is registered.
    pub fn wait_ready(
        &mut self,
        ready: &mut Vec<(usize, ReadyKind)>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        ready.clear();
        if self.registered.is_empty() {
            return Ok(());
        }

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // A signal landed mid-wait; its pipe byte shows up on the next poll
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut signalled = false;
        for event in self.events.iter() {
            match event.token() {
                SIGNAL_TOKEN => signalled = true,
                Token(handle) => {
                    let kind = classify(
                        event.is_error(),
                        event.is_readable(),
                        event.is_read_closed() || event.is_write_closed(),
                    );
                    if let Some(kind) = kind {
                        ready.push((handle, kind));
                    }
                }
            }
        }

        if signalled {
            self.drain_signal_pipe();
        }
        Ok(())
    }

    fn drain_signal_pipe(&mut self) {
        let Some(pipe) = self.signal_pipe.as_mut() else {
            return;
        };
        let mut buf = [0u8; 32];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => self.interrupted = true,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "Failed to drain signal pipe");
                    break;
                }
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        for id in self.signal_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
