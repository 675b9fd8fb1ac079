//! Connection state machine for framed exchanges.
//!
//! Each connection tracks its role, its current phase and the resources it
//! exclusively owns (socket handle and frame buffer). The value is moved
//! into every operation issued on it and handed back by the completion, so
//! only one operation can ever be outstanding per connection.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use mio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{ExchangeError, ResourceViolation};
use crate::protocol::{FrameBuffer, FrameSettings};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which side of the exchange a connection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Current phase of a connection.
///
/// Client: `Idle -> Connecting -> Sending -> Receiving -> Closed`.
/// Server: `Idle -> Accepting -> Receiving -> Sending -> Closed`.
/// `Failed` is reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Accepting,
    Sending,
    Receiving,
    Closed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Closed | Phase::Failed)
    }

    /// Whether `role` may move from `from` to `to`.
    pub fn can_advance(role: Role, from: Phase, to: Phase) -> bool {
        use Phase::*;

        if from.is_terminal() {
            return false;
        }
        if to.is_terminal() {
            return true;
        }
        match role {
            Role::Client => matches!(
                (from, to),
                (Idle, Connecting)
                    | (Connecting, Sending)
                    | (Sending, Sending)
                    | (Sending, Receiving)
                    | (Receiving, Receiving)
            ),
            Role::Server => matches!(
                (from, to),
                (Idle, Accepting)
                    | (Accepting, Receiving)
                    | (Receiving, Receiving)
                    | (Receiving, Sending)
                    | (Sending, Sending)
            ),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Connecting => "connecting",
            Phase::Accepting => "accepting",
            Phase::Sending => "sending",
            Phase::Receiving => "receiving",
            Phase::Closed => "closed",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A single TCP connection.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    role: Role,
    phase: Phase,
    /// `None` once the handle has been released.
    stream: Option<TcpStream>,
    peer: SocketAddr,
    frame: FrameBuffer,
}

impl Connection {
    /// Outbound connection whose connect is in progress.
    pub(crate) fn connecting(stream: TcpStream, peer: SocketAddr, frame: FrameSettings) -> Self {
        Self {
            id: ConnectionId::next(),
            role: Role::Client,
            phase: Phase::Connecting,
            stream: Some(stream),
            peer,
            frame: FrameBuffer::new(frame),
        }
    }

    /// Inbound connection just returned by accept.
    pub(crate) fn accepted(stream: TcpStream, peer: SocketAddr, frame: FrameSettings) -> Self {
        Self {
            id: ConnectionId::next(),
            role: Role::Server,
            phase: Phase::Accepting,
            stream: Some(stream),
            peer,
            frame: FrameBuffer::new(frame),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn frame(&self) -> &FrameBuffer {
        &self.frame
    }

    pub fn frame_mut(&mut self) -> &mut FrameBuffer {
        &mut self.frame
    }

    /// Whether the socket handle has been released.
    pub fn is_released(&self) -> bool {
        self.stream.is_none()
    }

    /// Move to `next`, enforcing the phase table for this connection's role.
    pub fn transition(&mut self, next: Phase) -> Result<(), ExchangeError> {
        if !Phase::can_advance(self.role, self.phase, next) {
            return Err(ResourceViolation::IllegalTransition {
                from: self.phase,
                to: next,
            }
            .into());
        }
        if self.phase != next {
            trace!(conn = %self.id, from = %self.phase, to = %next, "Phase transition");
        }
        self.phase = next;
        Ok(())
    }

    /// Graceful shutdown, then release of the handle.
    ///
    /// Only the first call (across `close`, `fail` and drop) touches the
    /// socket; it returns `true`.
    pub fn close(&mut self) -> bool {
        if !self.phase.is_terminal() {
            self.phase = Phase::Closed;
        }
        let released = self.release();
        if released {
            debug!(conn = %self.id, peer = %self.peer, "Connection closed");
        }
        released
    }

    /// Mark the connection failed and release the handle.
    pub fn fail(&mut self) -> bool {
        if !self.phase.is_terminal() {
            self.phase = Phase::Failed;
        }
        let released = self.release();
        if released {
            debug!(conn = %self.id, peer = %self.peer, "Connection released after failure");
        }
        released
    }

    fn release(&mut self) -> bool {
        match self.stream.take() {
            Some(stream) => {
                // The peer may already be gone; the handle is dropped either way.
                let _ = stream.shutdown(Shutdown::Both);
                self.frame.clear();
                true
            }
            None => false,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection released"))
    }

    /// One non-blocking read into the frame buffer's scratch region.
    pub(crate) fn read_scratch(&mut self) -> io::Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection released"))?;
        stream.read(self.frame.scratch_mut())
    }

    /// One non-blocking write.
    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream_mut()?.write(data)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.release() {
            trace!(conn = %self.id, "Connection handle released on drop");
        }
    }
}
