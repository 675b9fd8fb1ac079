//! Framed echo server.
//!
//! The admission loop issues one accept at a time on the completion port
//! and waits for it on a per-cycle phase gate. Each accepted connection is
//! handed to an independent exchange (receive, handle, reply, close) that
//! runs entirely in continuations.

mod exchange;
pub mod limit;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{ResourceViolation, Result};
use crate::protocol::{FrameSettings, UnterminatedPolicy};
use crate::runtime::{Connection, ConnectionId, ListenerId, Listener, PhaseGate, PortHandle};
use exchange::ExchangeContext;
use limit::ConnectionLimit;

/// How often a blocked admission loop checks for a stop request.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 10;

/// Default deadline for each phase of a server exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// First pause after a failed accept; doubles per consecutive failure.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Produces the reply for one request.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Bytes) -> Bytes;
}

impl<F> Handler for F
where
    F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
{
    fn handle(&self, request: Bytes) -> Bytes {
        self(request)
    }
}

/// Replies with the request unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Handler for Echo {
    fn handle(&self, request: Bytes) -> Bytes {
        request
    }
}

/// When the next accept may be issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionPolicy {
    /// Accept again as soon as the previous connection is handed off.
    #[default]
    Concurrent,
    /// Accept again only after the previous exchange has finished.
    Sequential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    pub backlog: u32,
    pub admission: AdmissionPolicy,
    /// Upper bound on connections being served at once.
    pub max_connections: Option<usize>,
    /// Deadline for each phase of an exchange.
    pub exchange_timeout: Option<Duration>,
    pub frame: FrameSettings,
    pub unterminated: UnterminatedPolicy,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            admission: AdmissionPolicy::default(),
            max_connections: None,
            exchange_timeout: Some(DEFAULT_EXCHANGE_TIMEOUT),
            frame: FrameSettings::default(),
            unterminated: UnterminatedPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    accepted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Exchange counters for one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Delay between accept attempts while accepts keep failing.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    fn new() -> Self {
        Self {
            next: ACCEPT_BACKOFF_MIN,
        }
    }

    /// Pause to apply after another failure.
    fn failed(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(ACCEPT_BACKOFF_MAX);
        delay
    }

    fn succeeded(&mut self) {
        self.next = ACCEPT_BACKOFF_MIN;
    }
}

/// Outcome of one accept cycle.
struct Accepted {
    conn: ConnectionId,
    peer: SocketAddr,
    done: Arc<PhaseGate<()>>,
}

pub struct Server {
    port: PortHandle,
    listener: Listener,
    settings: ServerSettings,
    counters: Arc<Counters>,
    stopping: Arc<AtomicBool>,
    stopped: Arc<PhaseGate<()>>,
    limit: Option<ConnectionLimit>,
}

impl Server {
    /// Bind `endpoint` on `port`.
    pub fn bind(port: PortHandle, endpoint: &Endpoint, settings: ServerSettings) -> Result<Self> {
        let listener = port.listen(endpoint, settings.backlog, settings.frame)?;
        Ok(Self {
            port,
            listener,
            settings,
            counters: Arc::new(Counters::default()),
            stopping: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(PhaseGate::new()),
            limit: settings.max_connections.map(ConnectionLimit::new),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            port: self.port.clone(),
            listener: self.listener.id(),
            stopping: Arc::clone(&self.stopping),
            stopped: Arc::clone(&self.stopped),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Run the admission loop until [`ServerHandle::stop`] is called.
    ///
    /// Failed accepts and failed exchanges are logged and counted; only a
    /// resource violation (a closed port, for instance) ends the loop with
    /// an error.
    pub fn serve<H: Handler>(&self, handler: H) -> Result<()> {
        let ctx = Arc::new(ExchangeContext {
            port: self.port.clone(),
            handler: Arc::new(handler),
            unterminated: self.settings.unterminated,
            timeout: self.settings.exchange_timeout,
            counters: Arc::clone(&self.counters),
        });
        let cycle: Arc<PhaseGate<io::Result<Accepted>>> = Arc::new(PhaseGate::new());
        let mut backoff = AcceptBackoff::new();

        info!(
            addr = %self.local_addr(),
            admission = ?self.settings.admission,
            max_connections = ?self.settings.max_connections,
            "Server listening"
        );

        let result = loop {
            if self.is_stopping() {
                break Ok(());
            }
            if let Err(e) = cycle.reset() {
                break Err(e);
            }

            let permit = match &self.limit {
                Some(limit) => match limit.acquire_timeout(STOP_POLL) {
                    Some(permit) => Some(permit),
                    None => continue,
                },
                None => None,
            };

            let signal = Arc::clone(&cycle);
            let ctx = Arc::clone(&ctx);
            let counters = Arc::clone(&self.counters);
            let issued = self.port.begin_accept(&self.listener, None, move |accepted| {
                let outcome = accepted.map(|conn: Connection| {
                    counters.accepted.fetch_add(1, Ordering::Relaxed);
                    let done = Arc::new(PhaseGate::new());
                    let accepted = Accepted {
                        conn: conn.id(),
                        peer: conn.peer_addr(),
                        done: Arc::clone(&done),
                    };
                    exchange::start(ctx, conn, done, permit);
                    accepted
                });
                signal.signal(outcome);
            });
            if let Err(e) = issued {
                break Err(e);
            }

            let outcome = loop {
                match cycle.wait_timeout(STOP_POLL) {
                    Ok(outcome) => break outcome,
                    Err(_) if self.is_stopping() => self.port.cancel_accept(self.listener.id()),
                    Err(_) => {}
                }
            };

            match outcome {
                Some(Ok(accepted)) => {
                    backoff.succeeded();
                    debug!(conn = %accepted.conn, peer = %accepted.peer, "Connection admitted");
                    if self.settings.admission == AdmissionPolicy::Sequential {
                        self.wait_exchange(&accepted);
                    }
                }
                Some(Err(e)) if self.is_stopping() => {
                    debug!(error = %e, "Accept ended by stop request");
                    break Ok(());
                }
                Some(Err(e)) => {
                    let delay = backoff.failed();
                    warn!(error = %e, retry_in = ?delay, "Accept failed");
                    self.pause(delay);
                }
                None => break Err(ResourceViolation::SignalConsumed.into()),
            }
        };

        let stats = self.stats();
        info!(
            accepted = stats.accepted,
            completed = stats.completed,
            failed = stats.failed,
            "Server stopped"
        );
        self.stopped.signal(());
        result
    }

    fn wait_exchange(&self, accepted: &Accepted) {
        while accepted.done.wait_timeout(STOP_POLL).is_err() {
            if self.is_stopping() {
                self.port.cancel_connection(accepted.conn);
            }
        }
    }

    /// Sleep for `delay`, returning early on a stop request.
    fn pause(&self, delay: Duration) {
        let until = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= until || self.is_stopping() {
                return;
            }
            thread::sleep((until - now).min(STOP_POLL));
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// Remote control for a running [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    port: PortHandle,
    listener: ListenerId,
    stopping: Arc<AtomicBool>,
    stopped: Arc<PhaseGate<()>>,
    counters: Arc<Counters>,
}

impl ServerHandle {
    /// Ask the admission loop to exit, cancelling its pending accept.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.port.cancel_accept(self.listener);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_set()
    }

    /// Wait for `serve` to return. `false` if it is still running after
    /// `timeout`.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.stopped.wait_timeout(timeout).is_ok()
    }

    pub fn stats(&self) -> ServerStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Client, ClientSettings};
    use crate::error::FailureKind;
    use crate::protocol::find_delimiter;
    use crate::runtime::{CompletionPort, PortConfig};
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    const WAIT: Duration = Duration::from_secs(10);

    struct Running {
        port: CompletionPort,
        handle: ServerHandle,
        endpoint: Endpoint,
        thread: Option<JoinHandle<Result<()>>>,
    }

    impl Running {
        fn client(&self) -> Client {
            Client::new(
                self.port.handle(),
                ClientSettings {
                    timeout: Some(WAIT),
                    ..ClientSettings::default()
                },
            )
        }

        fn stop(mut self) -> Result<()> {
            self.handle.stop();
            assert!(self.handle.wait_stopped(WAIT));
            self.thread.take().unwrap().join().unwrap()
        }
    }

    impl Drop for Running {
        fn drop(&mut self) {
            if let Some(thread) = self.thread.take() {
                self.handle.stop();
                let _ = thread.join();
            }
        }
    }

    fn spawn_server<H: Handler>(settings: ServerSettings, handler: H) -> Running {
        let port = CompletionPort::new(PortConfig {
            workers: 4,
            event_capacity: 64,
        })
        .unwrap();
        let server = Server::bind(port.handle(), &Endpoint::local(0), settings).unwrap();
        let endpoint = Endpoint::from(server.local_addr());
        let handle = server.handle();
        let thread = thread::spawn(move || server.serve(handler));
        Running {
            port,
            handle,
            endpoint,
            thread: Some(thread),
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let started = Instant::now();
        while !condition() {
            assert!(started.elapsed() < WAIT, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Read a framed reply from a plain std socket, up to end of stream.
    fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
        stream.set_read_timeout(Some(WAIT)).unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        reply
    }

    #[test]
    fn test_echo_round_trip() {
        let server = spawn_server(ServerSettings::default(), Echo);

        let reply = server
            .client()
            .exchange(&server.endpoint, b"This is a test")
            .unwrap();
        assert_eq!(&reply[..], b"This is a test");

        wait_until(|| server.handle.stats().completed == 1);
        assert_eq!(server.port.stats().max_outstanding_per_connection, 1);
        server.stop().unwrap();
    }

    #[test]
    fn test_sequential_clients() {
        let server = spawn_server(ServerSettings::default(), Echo);
        let client = server.client();

        assert_eq!(&client.exchange(&server.endpoint, b"first").unwrap()[..], b"first");
        assert_eq!(&client.exchange(&server.endpoint, b"second").unwrap()[..], b"second");

        wait_until(|| server.handle.stats().completed == 2);
        assert_eq!(server.handle.stats().accepted, 2);
        server.stop().unwrap();
    }

    #[test]
    fn test_empty_message() {
        let server = spawn_server(ServerSettings::default(), Echo);
        let reply = server.client().exchange(&server.endpoint, b"").unwrap();
        assert!(reply.is_empty());
        server.stop().unwrap();
    }

    #[test]
    fn test_custom_handler() {
        let server = spawn_server(ServerSettings::default(), |request: Bytes| {
            Bytes::from(request.to_ascii_uppercase())
        });
        let reply = server.client().exchange(&server.endpoint, b"shout").unwrap();
        assert_eq!(&reply[..], b"SHOUT");
        server.stop().unwrap();
    }

    #[test]
    fn test_request_one_byte_at_a_time() {
        let server = spawn_server(ServerSettings::default(), Echo);

        let mut stream = TcpStream::connect(server.endpoint.addr()).unwrap();
        stream.set_nodelay(true).unwrap();
        for byte in b"hello<EOF>" {
            stream.write_all(&[*byte]).unwrap();
            thread::sleep(Duration::from_millis(2));
        }

        assert_eq!(read_to_end(&mut stream), b"hello<EOF>");
        server.stop().unwrap();
    }

    #[test]
    fn test_unterminated_request_fails_only_that_connection() {
        let server = spawn_server(ServerSettings::default(), Echo);

        let mut stream = TcpStream::connect(server.endpoint.addr()).unwrap();
        stream.write_all(b"partial").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();
        assert!(find_delimiter(&read_to_end(&mut stream)).is_none());

        wait_until(|| server.handle.stats().failed == 1);

        let reply = server.client().exchange(&server.endpoint, b"still up").unwrap();
        assert_eq!(&reply[..], b"still up");
        server.stop().unwrap();
    }

    #[test]
    fn test_best_effort_unterminated_request() {
        let settings = ServerSettings {
            unterminated: UnterminatedPolicy::BestEffort,
            ..ServerSettings::default()
        };
        let server = spawn_server(settings, Echo);

        let mut stream = TcpStream::connect(server.endpoint.addr()).unwrap();
        stream.write_all(b"partial").unwrap();
        stream.shutdown(Shutdown::Write).unwrap();

        assert_eq!(read_to_end(&mut stream), b"partial<EOF>");
        server.stop().unwrap();
    }

    #[test]
    fn test_exchange_timeout_releases_connection() {
        let settings = ServerSettings {
            exchange_timeout: Some(Duration::from_millis(100)),
            ..ServerSettings::default()
        };
        let server = spawn_server(settings, Echo);

        let mut idle = TcpStream::connect(server.endpoint.addr()).unwrap();
        wait_until(|| server.handle.stats().failed == 1);
        assert!(read_to_end(&mut idle).is_empty());
        server.stop().unwrap();
    }

    /// Start an exchange on another thread and report when it finishes.
    fn exchange_in_background(
        server: &Running,
        payload: &'static [u8],
    ) -> mpsc::Receiver<Result<Bytes>> {
        let client = server.client();
        let endpoint = server.endpoint;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || tx.send(client.exchange(&endpoint, payload)).unwrap());
        rx
    }

    #[test]
    fn test_concurrent_admission_does_not_wait() {
        let server = spawn_server(ServerSettings::default(), Echo);

        let mut slow = TcpStream::connect(server.endpoint.addr()).unwrap();
        wait_until(|| server.handle.stats().accepted == 1);

        let fast = exchange_in_background(&server, b"fast");
        assert_eq!(&fast.recv_timeout(WAIT).unwrap().unwrap()[..], b"fast");

        slow.write_all(b"slow<EOF>").unwrap();
        assert_eq!(read_to_end(&mut slow), b"slow<EOF>");
        server.stop().unwrap();
    }

    #[test]
    fn test_sequential_admission_waits_for_exchange() {
        let settings = ServerSettings {
            admission: AdmissionPolicy::Sequential,
            ..ServerSettings::default()
        };
        let server = spawn_server(settings, Echo);

        let mut slow = TcpStream::connect(server.endpoint.addr()).unwrap();
        wait_until(|| server.handle.stats().accepted == 1);

        let queued = exchange_in_background(&server, b"queued");
        assert!(queued.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(server.handle.stats().accepted, 1);

        slow.write_all(b"slow<EOF>").unwrap();
        assert_eq!(read_to_end(&mut slow), b"slow<EOF>");
        assert_eq!(&queued.recv_timeout(WAIT).unwrap().unwrap()[..], b"queued");
        server.stop().unwrap();
    }

    #[test]
    fn test_connection_limit() {
        let settings = ServerSettings {
            max_connections: Some(1),
            ..ServerSettings::default()
        };
        let server = spawn_server(settings, Echo);

        let mut slow = TcpStream::connect(server.endpoint.addr()).unwrap();
        wait_until(|| server.handle.stats().accepted == 1);

        let queued = exchange_in_background(&server, b"queued");
        assert!(queued.recv_timeout(Duration::from_millis(200)).is_err());

        slow.write_all(b"slow<EOF>").unwrap();
        assert_eq!(read_to_end(&mut slow), b"slow<EOF>");
        assert_eq!(&queued.recv_timeout(WAIT).unwrap().unwrap()[..], b"queued");
        server.stop().unwrap();
    }

    #[test]
    fn test_stop_while_idle() {
        let server = spawn_server(ServerSettings::default(), Echo);
        assert!(!server.handle.is_stopped());
        let handle = server.handle.clone();
        server.stop().unwrap();
        assert!(handle.is_stopped());
        assert_eq!(handle.stats(), ServerStats::default());
    }

    #[test]
    fn test_accept_backoff_doubles_and_resets() {
        let mut backoff = AcceptBackoff::new();
        assert_eq!(backoff.failed(), ACCEPT_BACKOFF_MIN);
        assert_eq!(backoff.failed(), ACCEPT_BACKOFF_MIN * 2);
        for _ in 0..20 {
            backoff.failed();
        }
        assert_eq!(backoff.failed(), ACCEPT_BACKOFF_MAX);

        backoff.succeeded();
        assert_eq!(backoff.failed(), ACCEPT_BACKOFF_MIN);
    }

    #[test]
    fn test_failing_accepts_are_rate_limited() {
        let server = spawn_server(ServerSettings::default(), Echo);
        wait_until(|| server.port.stats().issued >= 1);

        // Every accept from here on fails immediately.
        server.port.handle().close_listener(server.handle.listener);
        thread::sleep(Duration::from_millis(100));

        let before = server.port.stats().issued;
        thread::sleep(Duration::from_millis(500));
        let attempts = server.port.stats().issued - before;
        assert!(attempts <= 10, "{attempts} accepts issued in 500ms");

        let started = Instant::now();
        server.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_sequential_admission_survives_silent_peer() {
        let settings = ServerSettings {
            admission: AdmissionPolicy::Sequential,
            exchange_timeout: Some(Duration::from_millis(100)),
            ..ServerSettings::default()
        };
        let server = spawn_server(settings, Echo);

        let _silent = TcpStream::connect(server.endpoint.addr()).unwrap();
        wait_until(|| server.handle.stats().accepted == 1);

        let reply = server.client().exchange(&server.endpoint, b"next").unwrap();
        assert_eq!(&reply[..], b"next");
        assert_eq!(server.handle.stats().failed, 1);
        server.stop().unwrap();
    }

    #[test]
    fn test_default_exchange_timeout() {
        assert_eq!(
            ServerSettings::default().exchange_timeout,
            Some(DEFAULT_EXCHANGE_TIMEOUT)
        );
    }

    #[test]
    fn test_bind_conflict_is_connect_failure() {
        let port = CompletionPort::new(PortConfig::default()).unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::from(taken.local_addr().unwrap());

        let err = Server::bind(port.handle(), &endpoint, ServerSettings::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), FailureKind::Connect);
    }
}
