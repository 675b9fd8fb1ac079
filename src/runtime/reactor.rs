//! Readiness reactor that turns mio events into operation completions.
//!
//! One thread owns the `mio::Poll`. Callers never touch it: they push a
//! [`Submission`] onto the shared queue and wake the poll. Every operation
//! is first attempted speculatively; only when the syscall would block is
//! it parked under a slab token and its socket registered for the matching
//! readiness. When the event arrives the syscall is retried and the result
//! is dispatched to a worker as a continuation.
//!
//! An operation leaves the reactor exactly once, through one of: its own
//! syscall, cancellation, deadline expiry, or shutdown. Removal from the
//! slab is the single point that decides which.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use super::connection::{Connection, ConnectionId};
use super::port::{Completion, PortStats};
use super::token::{IdSource, ListenerId, OpId, OpType, TokenAllocator};
use super::workers::{Dispatcher, Job};
use crate::protocol::FrameSettings;

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// Stale deadline entries tolerated before the heap is compacted.
const DEADLINE_SLACK: usize = 64;

pub(crate) type ConnectCont = Box<dyn FnOnce(Completion<()>) + Send + 'static>;
pub(crate) type TransferCont = Box<dyn FnOnce(Completion<usize>) + Send + 'static>;
pub(crate) type AcceptCont = Box<dyn FnOnce(io::Result<Connection>) + Send + 'static>;

/// A connect, send or receive travelling through the reactor.
pub(crate) struct Operation {
    pub(crate) id: OpId,
    pub(crate) deadline: Option<Instant>,
    pub(crate) kind: OpKind,
}

pub(crate) enum OpKind {
    Connect {
        conn: Connection,
        cont: ConnectCont,
    },
    Receive {
        conn: Connection,
        cont: TransferCont,
    },
    Send {
        conn: Connection,
        data: Bytes,
        cont: TransferCont,
    },
}

impl Operation {
    pub(crate) fn op_type(&self) -> OpType {
        match self.kind {
            OpKind::Connect { .. } => OpType::Connect,
            OpKind::Receive { .. } => OpType::Receive,
            OpKind::Send { .. } => OpType::Send,
        }
    }

    pub(crate) fn conn(&self) -> &Connection {
        match &self.kind {
            OpKind::Connect { conn, .. }
            | OpKind::Receive { conn, .. }
            | OpKind::Send { conn, .. } => conn,
        }
    }

    fn conn_mut(&mut self) -> &mut Connection {
        match &mut self.kind {
            OpKind::Connect { conn, .. }
            | OpKind::Receive { conn, .. }
            | OpKind::Send { conn, .. } => conn,
        }
    }

    fn interest(&self) -> Interest {
        match self.kind {
            OpKind::Receive { .. } => Interest::READABLE,
            OpKind::Connect { .. } | OpKind::Send { .. } => Interest::WRITABLE,
        }
    }

    /// Run the syscall once. `None` means it would block.
    fn attempt(&mut self) -> Option<io::Result<usize>> {
        match &mut self.kind {
            OpKind::Connect { conn, .. } => {
                let stream = match conn.stream_mut() {
                    Ok(stream) => stream,
                    Err(e) => return Some(Err(e)),
                };
                match stream.take_error() {
                    Ok(Some(e)) | Err(e) => return Some(Err(e)),
                    Ok(None) => {}
                }
                match stream.peer_addr() {
                    Ok(_) => Some(Ok(0)),
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => None,
                    Err(e) => Some(Err(e)),
                }
            }
            OpKind::Receive { conn, .. } => loop {
                match conn.read_scratch() {
                    Ok(n) => return Some(Ok(n)),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Some(Err(e)),
                }
            },
            OpKind::Send { conn, data, .. } => {
                if data.is_empty() {
                    return Some(Ok(0));
                }
                loop {
                    match conn.write(data) {
                        Ok(n) => return Some(Ok(n)),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Some(Err(e)),
                    }
                }
            }
        }
    }
}

/// An accept waiting on a listener.
pub(crate) struct PendingAccept {
    pub(crate) id: OpId,
    pub(crate) listener: ListenerId,
    pub(crate) deadline: Option<Instant>,
    pub(crate) in_flight: Arc<AtomicBool>,
    pub(crate) cont: AcceptCont,
}

pub(crate) struct ListenerEntry {
    pub(crate) id: ListenerId,
    pub(crate) listener: TcpListener,
    pub(crate) frame: FrameSettings,
    pub(crate) pending: Option<PendingAccept>,
}

impl ListenerEntry {
    fn try_accept(&mut self) -> Option<io::Result<Connection>> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    return Some(Ok(Connection::accepted(stream, peer, self.frame)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return None,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// What a cancellation applies to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CancelTarget {
    Op(OpId),
    Connection(ConnectionId),
    Accept(ListenerId),
}

pub(crate) enum Submission {
    AddListener(ListenerEntry),
    RemoveListener(ListenerId),
    Accept(PendingAccept),
    Start(Operation),
    Cancel(CancelTarget),
    Shutdown,
}

#[derive(Default)]
struct SubmissionQueue {
    pending: Vec<Submission>,
    closed: bool,
}

/// Counters shared between the reactor and port handles.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    issued: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    max_outstanding_per_connection: AtomicU64,
}

impl Stats {
    pub(crate) fn snapshot(&self) -> PortStats {
        PortStats {
            issued: self.issued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            max_outstanding_per_connection: self
                .max_outstanding_per_connection
                .load(Ordering::Relaxed),
        }
    }
}

/// State shared by the reactor thread and every port handle.
pub(crate) struct Shared {
    queue: Mutex<SubmissionQueue>,
    waker: Waker,
    pub(crate) ids: IdSource,
    pub(crate) stats: Stats,
}

impl Shared {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            queue: Mutex::new(SubmissionQueue::default()),
            waker,
            ids: IdSource::default(),
            stats: Stats::default(),
        }
    }

    /// Queue a submission and wake the reactor. Hands the submission back
    /// once the port is shut down.
    pub(crate) fn submit(&self, submission: Submission) -> Result<(), Submission> {
        let mut queue = self.queue.lock();
        if queue.closed {
            return Err(submission);
        }
        queue.pending.push(submission);
        drop(queue);

        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }
}

enum Registration {
    Listener(ListenerEntry),
    Operation(Operation),
}

#[derive(Debug, Clone, Copy)]
enum Abort {
    Cancelled,
    TimedOut,
    Shutdown,
}

impl Abort {
    fn error(self) -> io::Error {
        match self {
            Abort::Cancelled => {
                io::Error::new(io::ErrorKind::ConnectionAborted, "operation cancelled")
            }
            Abort::TimedOut => io::Error::new(io::ErrorKind::TimedOut, "operation deadline expired"),
            Abort::Shutdown => {
                io::Error::new(io::ErrorKind::ConnectionAborted, "completion port shut down")
            }
        }
    }
}

pub(crate) struct Reactor {
    poll: Poll,
    events: Events,
    shared: Arc<Shared>,
    dispatcher: Dispatcher,
    registrations: TokenAllocator<Registration>,
    listeners: HashMap<ListenerId, Token>,
    /// Parked operations (and pending accepts) by id.
    index: HashMap<OpId, Token>,
    deadlines: BinaryHeap<Reverse<(Instant, OpId)>>,
    outstanding: HashMap<ConnectionId, u64>,
}

impl Reactor {
    pub(crate) fn new(
        poll: Poll,
        shared: Arc<Shared>,
        dispatcher: Dispatcher,
        event_capacity: usize,
    ) -> Self {
        Self {
            poll,
            events: Events::with_capacity(event_capacity.max(1)),
            shared,
            dispatcher,
            registrations: TokenAllocator::new(event_capacity.max(1)),
            listeners: HashMap::new(),
            index: HashMap::new(),
            deadlines: BinaryHeap::new(),
            outstanding: HashMap::new(),
        }
    }

    /// Run until a shutdown is submitted or polling fails.
    pub(crate) fn run(mut self) {
        info!("Reactor started");

        loop {
            match self.turn() {
                Ok(false) => {}
                Ok(true) => break,
                Err(e) => {
                    error!(error = %e, "Poll failed, shutting down reactor");
                    break;
                }
            }
        }

        self.shutdown();
    }

    /// One poll cycle. Returns `true` once a shutdown was requested.
    fn turn(&mut self) -> io::Result<bool> {
        let timeout = self
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(e);
        }

        let ready: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        for token in ready {
            if token != WAKER_TOKEN {
                self.on_ready(token);
            }
        }

        let stop = self.drain_submissions();
        self.expire_deadlines();
        Ok(stop)
    }

    /// Returns `true` once a shutdown was requested.
    fn drain_submissions(&mut self) -> bool {
        let batch = std::mem::take(&mut self.shared.queue.lock().pending);
        let mut stop = false;

        for submission in batch {
            match submission {
                Submission::AddListener(entry) => self.add_listener(entry),
                Submission::RemoveListener(id) => self.remove_listener(id),
                Submission::Accept(pending) => self.start_accept(pending),
                Submission::Start(op) => self.start(op),
                Submission::Cancel(target) => self.cancel(target),
                Submission::Shutdown => stop = true,
            }
        }
        stop
    }

    fn add_listener(&mut self, mut entry: ListenerEntry) {
        let token = self.registrations.next_token();
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut entry.listener, token, Interest::READABLE)
        {
            error!(listener = %entry.id, error = %e, "Failed to register listener");
            return;
        }
        debug!(listener = %entry.id, "Listener registered");
        self.listeners.insert(entry.id, token);
        self.registrations.alloc(Registration::Listener(entry));
    }

    fn remove_listener(&mut self, id: ListenerId) {
        let Some(token) = self.listeners.get(&id).copied() else {
            return;
        };
        let pending_id = match self.registrations.get(token) {
            Some(Registration::Listener(entry)) => entry.pending.as_ref().map(|p| p.id),
            _ => None,
        };
        if let Some(op_id) = pending_id {
            self.abort(op_id, Abort::Cancelled);
        }

        self.listeners.remove(&id);
        if let Some(Registration::Listener(mut entry)) = self.registrations.free(token) {
            let _ = self.poll.registry().deregister(&mut entry.listener);
            debug!(listener = %id, "Listener removed");
        }
    }

    fn start_accept(&mut self, mut pending: PendingAccept) {
        self.shared.stats.issued.fetch_add(1, Ordering::Relaxed);

        let Some(token) = self.listeners.get(&pending.listener).copied() else {
            let err = io::Error::new(io::ErrorKind::NotFound, "listener is closed");
            self.finish_accept(pending, Err(err));
            return;
        };
        let Some(Registration::Listener(entry)) = self.registrations.get_mut(token) else {
            let err = io::Error::new(io::ErrorKind::NotFound, "listener is closed");
            self.finish_accept(pending, Err(err));
            return;
        };

        match entry.try_accept() {
            Some(result) => self.finish_accept(pending, result),
            None => {
                trace!(listener = %pending.listener, op = ?pending.id, "Accept parked");
                if let Some(deadline) = pending.deadline.take() {
                    self.deadlines.push(Reverse((deadline, pending.id)));
                }
                self.index.insert(pending.id, token);
                entry.pending = Some(pending);
            }
        }
    }

    fn finish_accept(&self, pending: PendingAccept, result: io::Result<Connection>) {
        self.shared.stats.completed.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(conn) => debug!(
                listener = %pending.listener,
                conn = %conn.id(),
                peer = %conn.peer_addr(),
                "Accepted connection"
            ),
            Err(e) => debug!(listener = %pending.listener, error = %e, "Accept failed"),
        }

        pending.in_flight.store(false, Ordering::Release);
        let cont = pending.cont;
        self.dispatcher.dispatch(Box::new(move || cont(result)));
    }

    fn start(&mut self, mut op: Operation) {
        self.shared.stats.issued.fetch_add(1, Ordering::Relaxed);
        let conn_id = op.conn().id();
        let count = self.outstanding.entry(conn_id).or_insert(0);
        *count += 1;
        self.shared
            .stats
            .max_outstanding_per_connection
            .fetch_max(*count, Ordering::Relaxed);

        if let Some(result) = op.attempt() {
            self.complete(op, result);
            return;
        }

        let token = self.registrations.next_token();
        let interest = op.interest();
        let registered = match op.conn_mut().stream_mut() {
            Ok(stream) => self.poll.registry().register(stream, token, interest),
            Err(e) => Err(e),
        };
        if let Err(e) = registered {
            self.complete(op, Err(e));
            return;
        }

        trace!(conn = %conn_id, op = ?op.id, kind = %op.op_type(), "Operation parked");
        if let Some(deadline) = op.deadline {
            self.deadlines.push(Reverse((deadline, op.id)));
        }
        self.index.insert(op.id, token);
        self.registrations.alloc(Registration::Operation(op));
    }

    fn on_ready(&mut self, token: Token) {
        match self.registrations.get_mut(token) {
            Some(Registration::Listener(entry)) => {
                if entry.pending.is_none() {
                    return;
                }
                if let Some(result) = entry.try_accept() {
                    if let Some(pending) = entry.pending.take() {
                        self.index.remove(&pending.id);
                        self.finish_accept(pending, result);
                        self.compact_deadlines();
                    }
                }
            }
            Some(Registration::Operation(op)) => {
                let Some(result) = op.attempt() else {
                    return;
                };
                if let Some(Registration::Operation(mut op)) = self.registrations.free(token) {
                    self.index.remove(&op.id);
                    self.deregister(&mut op);
                    self.complete(op, result);
                    self.compact_deadlines();
                }
            }
            None => {}
        }
    }

    fn cancel(&mut self, target: CancelTarget) {
        match target {
            CancelTarget::Op(id) => {
                if self.abort(id, Abort::Cancelled) {
                    debug!(op = ?id, "Operation cancelled");
                }
            }
            CancelTarget::Connection(conn_id) => {
                let ids: Vec<OpId> = self
                    .registrations
                    .find(|reg| matches!(reg, Registration::Operation(op) if op.conn().id() == conn_id))
                    .into_iter()
                    .filter_map(|token| match self.registrations.get(token) {
                        Some(Registration::Operation(op)) => Some(op.id),
                        _ => None,
                    })
                    .collect();
                for id in ids {
                    self.abort(id, Abort::Cancelled);
                }
                debug!(conn = %conn_id, "Connection operations cancelled");
            }
            CancelTarget::Accept(listener) => {
                let pending_id = self.listeners.get(&listener).and_then(|token| {
                    match self.registrations.get(*token) {
                        Some(Registration::Listener(entry)) => entry.pending.as_ref().map(|p| p.id),
                        _ => None,
                    }
                });
                if let Some(id) = pending_id {
                    self.abort(id, Abort::Cancelled);
                    debug!(listener = %listener, "Accept cancelled");
                }
            }
        }
    }

    /// Earliest deadline of an operation still parked. Entries of
    /// operations that already left are dropped on the way.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if self.index.contains_key(&id) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Drop heap entries of finished operations once they outnumber the
    /// parked ones.
    fn compact_deadlines(&mut self) {
        if self.deadlines.len() <= 2 * self.index.len() + DEADLINE_SLACK {
            return;
        }
        let index = &self.index;
        self.deadlines.retain(|Reverse((_, id))| index.contains_key(id));
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if self.abort(id, Abort::TimedOut) {
                debug!(op = ?id, "Operation deadline expired");
            }
        }
    }

    /// Complete a parked operation or accept with `reason`. Returns `false`
    /// if it already left the reactor.
    fn abort(&mut self, id: OpId, reason: Abort) -> bool {
        let Some(token) = self.index.remove(&id) else {
            return false;
        };

        let is_listener = matches!(self.registrations.get(token), Some(Registration::Listener(_)));
        if is_listener {
            let pending = match self.registrations.get_mut(token) {
                Some(Registration::Listener(entry)) => entry.pending.take(),
                _ => None,
            };
            match pending {
                Some(pending) => {
                    self.count_abort(reason);
                    self.finish_accept(pending, Err(reason.error()));
                    true
                }
                None => false,
            }
        } else if let Some(Registration::Operation(mut op)) = self.registrations.free(token) {
            self.count_abort(reason);
            self.deregister(&mut op);
            self.complete(op, Err(reason.error()));
            true
        } else {
            false
        }
    }

    fn count_abort(&self, reason: Abort) {
        let counter = match reason {
            Abort::Cancelled => &self.shared.stats.cancelled,
            Abort::TimedOut => &self.shared.stats.timed_out,
            Abort::Shutdown => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn deregister(&self, op: &mut Operation) {
        if let Ok(stream) = op.conn_mut().stream_mut() {
            let _ = self.poll.registry().deregister(stream);
        }
    }

    fn complete(&mut self, op: Operation, result: io::Result<usize>) {
        self.shared.stats.completed.fetch_add(1, Ordering::Relaxed);

        let conn_id = op.conn().id();
        if let Some(count) = self.outstanding.get_mut(&conn_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.outstanding.remove(&conn_id);
            }
        }

        match &result {
            Ok(n) => trace!(
                conn = %conn_id,
                op = ?op.id,
                kind = %op.op_type(),
                bytes = *n,
                "Operation completed"
            ),
            Err(e) => debug!(
                conn = %conn_id,
                op = ?op.id,
                kind = %op.op_type(),
                error = %e,
                "Operation failed"
            ),
        }

        let job: Job = match op.kind {
            OpKind::Connect { conn, cont } => {
                Box::new(move || cont(Completion::new(conn, result.map(|_| ()))))
            }
            OpKind::Receive { conn, cont } | OpKind::Send { conn, cont, .. } => {
                Box::new(move || cont(Completion::new(conn, result)))
            }
        };
        self.dispatcher.dispatch(job);
    }

    fn shutdown(&mut self) {
        let leftover = {
            let mut queue = self.shared.queue.lock();
            queue.closed = true;
            std::mem::take(&mut queue.pending)
        };

        for submission in leftover {
            match submission {
                Submission::Start(op) => {
                    self.shared.stats.issued.fetch_add(1, Ordering::Relaxed);
                    self.complete(op, Err(Abort::Shutdown.error()));
                }
                Submission::Accept(pending) => {
                    self.shared.stats.issued.fetch_add(1, Ordering::Relaxed);
                    self.finish_accept(pending, Err(Abort::Shutdown.error()));
                }
                _ => {}
            }
        }

        let parked: Vec<OpId> = self.index.keys().copied().collect();
        let failed = parked.len();
        for id in parked {
            self.abort(id, Abort::Shutdown);
        }

        for registration in self.registrations.drain() {
            if let Registration::Listener(mut entry) = registration {
                let _ = self.poll.registry().deregister(&mut entry.listener);
            }
        }
        self.listeners.clear();

        info!(failed_pending = failed, "Reactor stopped");
    }
}
