//! Completion port: the public face of the reactor.
//!
//! A [`CompletionPort`] owns one reactor thread and a pool of worker
//! threads. [`PortHandle`]s are cheap clones used to issue operations. Each
//! `begin_*` call either fails synchronously or guarantees that its
//! continuation runs exactly once on a worker thread, with the
//! [`Connection`] handed back inside the [`Completion`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::Bytes;
use mio::{Poll, Waker};
use tracing::{debug, info};

use super::connection::{Connection, ConnectionId};
use super::reactor::{
    CancelTarget, ListenerEntry, OpKind, Operation, PendingAccept, Reactor, Shared, Submission,
    WAKER_TOKEN,
};
use super::token::{ListenerId, OpId, OpType};
use super::workers::WorkerPool;
use crate::endpoint::Endpoint;
use crate::error::{ExchangeError, ResourceViolation, Result};
use crate::protocol::FrameSettings;

/// Sizing for a completion port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    /// Worker threads running continuations (0 = available parallelism).
    pub workers: usize,
    /// Readiness events fetched per poll.
    pub event_capacity: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            event_capacity: 1024,
        }
    }
}

/// Point-in-time operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub issued: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    /// Highest number of operations ever outstanding on one connection.
    pub max_outstanding_per_connection: u64,
}

/// The outcome of a connect, send or receive, carrying the connection back
/// to the caller.
#[derive(Debug)]
pub struct Completion<T> {
    conn: Connection,
    result: io::Result<T>,
}

impl<T> Completion<T> {
    pub(crate) fn new(conn: Connection, result: io::Result<T>) -> Self {
        Self { conn, result }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn result(&self) -> &io::Result<T> {
        &self.result
    }

    pub fn end(self) -> (Connection, io::Result<T>) {
        (self.conn, self.result)
    }
}

/// Receipt for an issued operation, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOp {
    id: OpId,
    kind: OpType,
    connection: Option<ConnectionId>,
}

impl PendingOp {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> OpType {
        self.kind
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }
}

/// A bound, listening socket registered with a port.
///
/// At most one accept may be in flight at a time. Dropping the listener
/// fails any pending accept and closes the socket.
pub struct Listener {
    id: ListenerId,
    local_addr: SocketAddr,
    in_flight: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn accept_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self.shared.submit(Submission::RemoveListener(self.id));
    }
}

/// Owner of the reactor and worker threads.
///
/// Dropping the port stops the reactor: every pending operation completes
/// with an error, then all threads are joined.
pub struct CompletionPort {
    shared: Arc<Shared>,
    reactor: Option<JoinHandle<()>>,
    workers: WorkerPool,
}

impl CompletionPort {
    pub fn new(config: PortConfig) -> io::Result<Self> {
        let workers = if config.workers == 0 {
            num_cpus()
        } else {
            config.workers
        };

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let shared = Arc::new(Shared::new(waker));

        let (pool, dispatcher) = WorkerPool::spawn(workers)?;
        let reactor = Reactor::new(poll, Arc::clone(&shared), dispatcher, config.event_capacity);
        let handle = thread::Builder::new()
            .name("framed-echo-reactor".to_string())
            .spawn(move || reactor.run())?;

        info!(
            workers = pool.len(),
            event_capacity = config.event_capacity,
            "Completion port started"
        );

        Ok(Self {
            shared,
            reactor: Some(handle),
            workers: pool,
        })
    }

    pub fn handle(&self) -> PortHandle {
        PortHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn stats(&self) -> PortStats {
        self.shared.stats.snapshot()
    }

    /// Stop the reactor and join all threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(reactor) = self.reactor.take() else {
            return;
        };
        let _ = self.shared.submit(Submission::Shutdown);
        if reactor.thread().id() != thread::current().id() {
            let _ = reactor.join();
        }
        self.workers.join();
        debug!("Completion port stopped");
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable handle for issuing operations on a [`CompletionPort`].
#[derive(Clone)]
pub struct PortHandle {
    shared: Arc<Shared>,
}

impl PortHandle {
    /// Bind and listen on `endpoint`.
    pub fn listen(
        &self,
        endpoint: &Endpoint,
        backlog: u32,
        frame: FrameSettings,
    ) -> Result<Listener> {
        let bind_err = |source| ExchangeError::Bind {
            endpoint: *endpoint,
            source,
        };

        let std_listener = create_listener(endpoint.addr(), backlog).map_err(bind_err)?;
        let local_addr = std_listener.local_addr().map_err(bind_err)?;
        let id = self.shared.ids.next_listener();

        let entry = ListenerEntry {
            id,
            listener: mio::net::TcpListener::from_std(std_listener),
            frame,
            pending: None,
        };
        self.shared
            .submit(Submission::AddListener(entry))
            .map_err(|_| ResourceViolation::PortClosed)?;

        info!(listener = %id, addr = %local_addr, backlog, "Listening");
        Ok(Listener {
            id,
            local_addr,
            in_flight: Arc::new(AtomicBool::new(false)),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Start an outbound connection to `endpoint`.
    ///
    /// The completion carries a client-role connection in the `Connecting`
    /// phase; the caller decides what to do with it.
    pub fn begin_connect<F>(
        &self,
        endpoint: &Endpoint,
        frame: FrameSettings,
        deadline: Option<Instant>,
        on_complete: F,
    ) -> Result<PendingOp>
    where
        F: FnOnce(Completion<()>) + Send + 'static,
    {
        self.ensure_open()?;
        let stream =
            mio::net::TcpStream::connect(endpoint.addr()).map_err(|source| ExchangeError::Connect {
                endpoint: *endpoint,
                source,
            })?;
        let conn = Connection::connecting(stream, endpoint.addr(), frame);
        debug!(conn = %conn.id(), endpoint = %endpoint, "Connect issued");

        self.start(Operation {
            id: self.shared.ids.next_op(),
            deadline,
            kind: OpKind::Connect {
                conn,
                cont: Box::new(on_complete),
            },
        })
    }

    /// Accept one inbound connection on `listener`.
    pub fn begin_accept<F>(
        &self,
        listener: &Listener,
        deadline: Option<Instant>,
        on_complete: F,
    ) -> Result<PendingOp>
    where
        F: FnOnce(io::Result<Connection>) + Send + 'static,
    {
        self.ensure_open()?;
        if listener
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ResourceViolation::AcceptInFlight(listener.id).into());
        }

        let id = self.shared.ids.next_op();
        let pending = PendingAccept {
            id,
            listener: listener.id,
            deadline,
            in_flight: Arc::clone(&listener.in_flight),
            cont: Box::new(on_complete),
        };
        if self.shared.submit(Submission::Accept(pending)).is_err() {
            listener.in_flight.store(false, Ordering::Release);
            return Err(ResourceViolation::PortClosed.into());
        }

        Ok(PendingOp {
            id,
            kind: OpType::Accept,
            connection: None,
        })
    }

    /// Write some prefix of `data`; the completion reports how many bytes.
    pub fn begin_send<F>(
        &self,
        conn: Connection,
        data: Bytes,
        deadline: Option<Instant>,
        on_complete: F,
    ) -> Result<PendingOp>
    where
        F: FnOnce(Completion<usize>) + Send + 'static,
    {
        self.ensure_open()?;
        if conn.is_released() {
            return Err(ResourceViolation::Released.into());
        }
        self.start(Operation {
            id: self.shared.ids.next_op(),
            deadline,
            kind: OpKind::Send {
                conn,
                data,
                cont: Box::new(on_complete),
            },
        })
    }

    /// Read once into the connection's frame buffer scratch region. A
    /// completion of `Ok(0)` means the peer closed its side.
    pub fn begin_receive<F>(
        &self,
        conn: Connection,
        deadline: Option<Instant>,
        on_complete: F,
    ) -> Result<PendingOp>
    where
        F: FnOnce(Completion<usize>) + Send + 'static,
    {
        self.ensure_open()?;
        if conn.is_released() {
            return Err(ResourceViolation::Released.into());
        }
        self.start(Operation {
            id: self.shared.ids.next_op(),
            deadline,
            kind: OpKind::Receive {
                conn,
                cont: Box::new(on_complete),
            },
        })
    }

    /// Cancel one operation. A no-op if it already completed.
    pub fn cancel(&self, op: &PendingOp) {
        let _ = self.shared.submit(Submission::Cancel(CancelTarget::Op(op.id)));
    }

    /// Cancel whatever operation is outstanding on `connection`.
    pub fn cancel_connection(&self, connection: ConnectionId) {
        let _ = self
            .shared
            .submit(Submission::Cancel(CancelTarget::Connection(connection)));
    }

    /// Unregister a listener before its [`Listener`] is dropped. A pending
    /// accept fails, and later accepts on it fail with `NotFound`.
    pub fn close_listener(&self, listener: ListenerId) {
        let _ = self.shared.submit(Submission::RemoveListener(listener));
    }

    /// Cancel the pending accept on a listener, if any.
    pub fn cancel_accept(&self, listener: ListenerId) {
        let _ = self
            .shared
            .submit(Submission::Cancel(CancelTarget::Accept(listener)));
    }

    pub fn stats(&self) -> PortStats {
        self.shared.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(ResourceViolation::PortClosed.into());
        }
        Ok(())
    }

    fn start(&self, op: Operation) -> Result<PendingOp> {
        let pending = PendingOp {
            id: op.id,
            kind: op.op_type(),
            connection: Some(op.conn().id()),
        };
        self.shared
            .submit(Submission::Start(op))
            .map_err(|_| ResourceViolation::PortClosed)?;
        Ok(pending)
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::protocol::FrameStatus;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn port() -> CompletionPort {
        CompletionPort::new(PortConfig {
            workers: 2,
            event_capacity: 64,
        })
        .unwrap()
    }

    fn listen(handle: &PortHandle) -> (Listener, Endpoint) {
        let listener = handle
            .listen(&Endpoint::local(0), 16, FrameSettings::default())
            .unwrap();
        let endpoint = Endpoint::from(listener.local_addr());
        (listener, endpoint)
    }

    /// Accept a connection from a plain std client.
    fn accept_std(handle: &PortHandle) -> (Listener, Connection, std::net::TcpStream) {
        let (listener, endpoint) = listen(handle);
        let (tx, rx) = mpsc::channel();
        handle
            .begin_accept(&listener, None, move |result| tx.send(result).unwrap())
            .unwrap();
        let client = std::net::TcpStream::connect(endpoint.addr()).unwrap();
        let conn = rx.recv_timeout(WAIT).unwrap().unwrap();
        (listener, conn, client)
    }

    fn receive(handle: &PortHandle, conn: Connection) -> (Connection, io::Result<usize>) {
        let (tx, rx) = mpsc::channel();
        handle
            .begin_receive(conn, None, move |done| tx.send(done.end()).unwrap())
            .unwrap();
        rx.recv_timeout(WAIT).unwrap()
    }

    #[test]
    fn test_connect_send_receive_round_trip() {
        let port = port();
        let handle = port.handle();
        let (listener, endpoint) = listen(&handle);

        let (accept_tx, accept_rx) = mpsc::channel();
        handle
            .begin_accept(&listener, None, move |result| accept_tx.send(result).unwrap())
            .unwrap();

        let (connect_tx, connect_rx) = mpsc::channel();
        handle
            .begin_connect(&endpoint, FrameSettings::default(), None, move |done| {
                connect_tx.send(done.end()).unwrap()
            })
            .unwrap();

        let mut server = accept_rx.recv_timeout(WAIT).unwrap().unwrap();
        let (client, connected) = connect_rx.recv_timeout(WAIT).unwrap();
        connected.unwrap();
        assert!(!listener.accept_in_flight());

        let (send_tx, send_rx) = mpsc::channel();
        handle
            .begin_send(client, Bytes::from_static(b"ping<EOF>"), None, move |done| {
                send_tx.send(done.end()).unwrap()
            })
            .unwrap();
        let (_client, sent) = send_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(sent.unwrap(), 9);

        let message = loop {
            let (mut conn, read) = receive(&handle, server);
            let n = read.unwrap();
            assert!(n > 0);
            match conn.frame_mut().commit(n).unwrap() {
                FrameStatus::Complete(message) => break message,
                _ => server = conn,
            }
        };
        assert_eq!(&message[..], b"ping");

        let stats = handle.stats();
        assert_eq!(stats.max_outstanding_per_connection, 1);
        assert_eq!(stats.issued, stats.completed);
    }

    #[test]
    fn test_connect_refused() {
        let port = port();
        let handle = port.handle();

        let addr = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap()
        };

        let (tx, rx) = mpsc::channel();
        match handle.begin_connect(&Endpoint::from(addr), FrameSettings::default(), None, move |done| {
            tx.send(done.end()).unwrap()
        }) {
            Err(e) => assert_eq!(e.kind(), FailureKind::Connect),
            Ok(_) => {
                let (_conn, result) = rx.recv_timeout(WAIT).unwrap();
                assert!(result.is_err());
            }
        }
    }

    #[test]
    fn test_second_accept_is_rejected() {
        let port = port();
        let handle = port.handle();
        let (listener, _endpoint) = listen(&handle);

        let (tx, rx) = mpsc::channel();
        handle
            .begin_accept(&listener, None, move |result| tx.send(result).unwrap())
            .unwrap();
        assert!(listener.accept_in_flight());

        let err = handle.begin_accept(&listener, None, |_| {}).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Resource);

        handle.cancel_accept(listener.id());
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        // The slot is free again once the completion ran.
        handle.begin_accept(&listener, None, |_| {}).unwrap();
    }

    #[test]
    fn test_accept_on_closed_listener_fails() {
        let port = port();
        let handle = port.handle();
        let (listener, _endpoint) = listen(&handle);

        let (tx, rx) = mpsc::channel();
        let pending = tx.clone();
        handle
            .begin_accept(&listener, None, move |result| pending.send(result).unwrap())
            .unwrap();
        handle.close_listener(listener.id());
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);

        handle
            .begin_accept(&listener, None, move |result| tx.send(result).unwrap())
            .unwrap();
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!listener.accept_in_flight());
    }

    #[test]
    fn test_send_on_released_connection() {
        let port = port();
        let handle = port.handle();
        let (_listener, mut conn, _client) = accept_std(&handle);

        assert!(conn.close());
        let err = handle
            .begin_send(conn, Bytes::from_static(b"late"), None, |_| {})
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Resource);
    }

    #[test]
    fn test_receive_deadline_expires() {
        let port = port();
        let handle = port.handle();
        let (_listener, conn, _client) = accept_std(&handle);

        let (tx, rx) = mpsc::channel();
        let deadline = Instant::now() + Duration::from_millis(50);
        handle
            .begin_receive(conn, Some(deadline), move |done| tx.send(done.end()).unwrap())
            .unwrap();

        let (conn, result) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
        assert!(Instant::now() >= deadline);
        assert!(!conn.is_released());
        assert_eq!(handle.stats().timed_out, 1);
    }

    #[test]
    fn test_accept_deadline_expires() {
        let port = port();
        let handle = port.handle();
        let (listener, _endpoint) = listen(&handle);

        let (tx, rx) = mpsc::channel();
        handle
            .begin_accept(
                &listener,
                Some(Instant::now() + Duration::from_millis(30)),
                move |result| tx.send(result).unwrap(),
            )
            .unwrap();

        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_cancel_pending_receive() {
        let port = port();
        let handle = port.handle();
        let (_listener, conn, _client) = accept_std(&handle);
        let conn_id = conn.id();

        let (tx, rx) = mpsc::channel();
        let op = handle
            .begin_receive(conn, None, move |done| tx.send(done.end()).unwrap())
            .unwrap();
        assert_eq!(op.kind(), OpType::Receive);
        assert_eq!(op.connection(), Some(conn_id));

        handle.cancel(&op);
        let (conn, result) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(handle.stats().cancelled, 1);

        // Cancelling again is harmless.
        handle.cancel(&op);
        handle.cancel_connection(conn.id());
    }

    #[test]
    fn test_cancel_by_connection() {
        let port = port();
        let handle = port.handle();
        let (_listener, conn, _client) = accept_std(&handle);
        let conn_id = conn.id();

        let (tx, rx) = mpsc::channel();
        handle
            .begin_receive(conn, None, move |done| tx.send(done.end()).unwrap())
            .unwrap();
        handle.cancel_connection(conn_id);

        let (_conn, result) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn test_receive_sees_peer_close() {
        let port = port();
        let handle = port.handle();
        let (_listener, mut conn, mut client) = accept_std(&handle);

        client.write_all(b"abc").unwrap();
        drop(client);

        loop {
            let (mut next, read) = receive(&handle, conn);
            let n = read.unwrap();
            if n == 0 {
                assert_eq!(next.frame_mut().finish().as_deref(), Some(&b"abc"[..]));
                break;
            }
            assert_eq!(next.frame_mut().commit(n).unwrap(), FrameStatus::Incomplete);
            conn = next;
        }
    }

    #[test]
    fn test_drop_completes_pending_once() {
        let port = port();
        let handle = port.handle();
        let (listener, conn, _client) = accept_std(&handle);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (tx, rx) = mpsc::channel();
        handle
            .begin_receive(conn, None, move |done| {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(done.end()).unwrap();
            })
            .unwrap();

        drop(port);

        let (_conn, result) = rx.recv_timeout(WAIT).unwrap();
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_err());

        assert!(handle.is_closed());
        let err = handle.begin_accept(&listener, None, |_| {}).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Resource);
    }
}
