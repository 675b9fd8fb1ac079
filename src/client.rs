//! Client driver: connect, send, receive, close.
//!
//! Every phase is issued on the completion port and then waited for on a
//! phase gate owned by that phase, so the calling thread blocks only in
//! `PhaseGate::wait` and never in a socket call.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{ExchangeError, ResourceViolation, Result};
use crate::machine;
use crate::protocol::{encode_frame, find_delimiter, FrameSettings, UnterminatedPolicy};
use crate::runtime::{Connection, ConnectionId, Phase, PhaseGate, PortHandle};

/// Client tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientSettings {
    pub frame: FrameSettings,
    /// Deadline applied to each phase (connect, send, receive).
    pub timeout: Option<Duration>,
    pub unterminated: UnterminatedPolicy,
}

/// Issues connections on a completion port.
#[derive(Clone)]
pub struct Client {
    port: PortHandle,
    settings: ClientSettings,
}

impl Client {
    pub fn new(port: PortHandle, settings: ClientSettings) -> Self {
        Self { port, settings }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Connect to `endpoint` and wait until the connection is established.
    pub fn connect(&self, endpoint: &Endpoint) -> Result<Session> {
        let connected: Arc<PhaseGate<Result<Connection>>> = Arc::new(PhaseGate::new());
        let signal = Arc::clone(&connected);
        let target = *endpoint;

        self.port.begin_connect(
            endpoint,
            self.settings.frame,
            deadline(self.settings.timeout),
            move |completion| {
                let (mut conn, result) = completion.end();
                let outcome = match result {
                    Ok(()) => conn.transition(Phase::Sending).map(|()| conn),
                    Err(source) => {
                        conn.fail();
                        Err(ExchangeError::Connect {
                            endpoint: target,
                            source,
                        })
                    }
                };
                signal.signal(outcome);
            },
        )?;

        let conn = connected
            .wait()
            .ok_or(ResourceViolation::SignalConsumed)??;
        debug!(conn = %conn.id(), peer = %endpoint, "Connected");

        Ok(Session {
            port: self.port.clone(),
            id: conn.id(),
            peer: conn.peer_addr(),
            last_phase: conn.phase(),
            conn: Some(conn),
            settings: self.settings,
        })
    }

    /// One full exchange: connect, send `payload` framed, receive the reply.
    pub fn exchange(&self, endpoint: &Endpoint, payload: &[u8]) -> Result<Bytes> {
        if find_delimiter(payload).is_some() {
            warn!(
                endpoint = %endpoint,
                "Payload contains the <EOF> delimiter; the peer will see a truncated message"
            );
        }

        let mut session = self.connect(endpoint)?;
        let sent = session.send_message(encode_frame(payload))?;
        let reply = session.receive_message()?;
        info!(
            endpoint = %endpoint,
            conn = %session.connection_id(),
            sent,
            received = reply.len(),
            "Exchange complete"
        );
        Ok(reply)
    }
}

/// An established client connection.
pub struct Session {
    port: PortHandle,
    /// `None` while an operation owns the connection or once it is released.
    conn: Option<Connection>,
    id: ConnectionId,
    peer: SocketAddr,
    last_phase: Phase,
    settings: ClientSettings,
}

impl Session {
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn phase(&self) -> Phase {
        self.conn
            .as_ref()
            .map(Connection::phase)
            .unwrap_or(self.last_phase)
    }

    /// Send raw bytes as-is; the caller supplies any framing.
    ///
    /// Returns once every byte has been handed to the transport.
    pub fn send_message(&mut self, data: impl Into<Bytes>) -> Result<usize> {
        let conn = self.take()?;
        let data = data.into();
        let len = data.len();

        let sent: Arc<PhaseGate<Result<Connection>>> = Arc::new(PhaseGate::new());
        let signal = Arc::clone(&sent);
        machine::send_all(
            &self.port,
            conn,
            data,
            deadline(self.settings.timeout),
            move |result| {
                signal.signal(result);
            },
        );

        let conn = self.settle(sent.wait())?;
        debug!(conn = %self.id, bytes = len, "Message sent");
        self.restore(conn);
        Ok(len)
    }

    /// Block until one framed message arrives, then close the connection.
    pub fn receive_message(&mut self) -> Result<Bytes> {
        let mut conn = self.take()?;
        if let Err(e) = conn.transition(Phase::Receiving) {
            self.restore(conn);
            return Err(e);
        }

        let received: Arc<PhaseGate<Result<(Connection, Bytes)>>> = Arc::new(PhaseGate::new());
        let signal = Arc::clone(&received);
        machine::receive_frame(
            &self.port,
            conn,
            self.settings.unterminated,
            deadline(self.settings.timeout),
            move |result| {
                signal.signal(result);
            },
        );

        let (mut conn, message) = self.settle(received.wait())?;
        debug!(conn = %self.id, bytes = message.len(), "Message received");
        conn.close();
        self.last_phase = conn.phase();
        Ok(message)
    }

    /// Close the connection if it is still open.
    pub fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
            self.last_phase = conn.phase();
        }
    }

    fn take(&mut self) -> Result<Connection> {
        self.conn
            .take()
            .ok_or_else(|| ResourceViolation::Released.into())
    }

    fn restore(&mut self, conn: Connection) {
        self.last_phase = conn.phase();
        self.conn = Some(conn);
    }

    /// Unpack a gate payload, remembering that the connection failed.
    fn settle<T>(&mut self, outcome: Option<Result<T>>) -> Result<T> {
        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(e)) => {
                self.last_phase = Phase::Failed;
                Err(e)
            }
            None => Err(ResourceViolation::SignalConsumed.into()),
        }
    }
}

fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|timeout| Instant::now() + timeout)
}
