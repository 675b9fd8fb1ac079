//! Continuation-driven send and receive loops.
//!
//! A single completion rarely finishes a phase: a send may transfer only a
//! prefix of the buffer and a receive only part of a frame. These drivers
//! re-issue the operation from inside its own continuation until the phase
//! is done (the `Sending -> Sending` and `Receiving -> Receiving` self
//! loops), then report once through `on_done`.
//!
//! On failure the connection is released (`Connection::fail`) before the
//! error is reported.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::{ExchangeError, ProtocolViolation, ResourceViolation, Result};
use crate::protocol::{FrameStatus, UnterminatedPolicy};
use crate::runtime::{Connection, Phase, PortHandle};

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Report slot shared between the issuing call and its continuation, so the
/// callback runs once whether the issue fails synchronously or later.
struct OnDone<T>(Arc<Mutex<Option<Callback<T>>>>);

impl<T> OnDone<T> {
    fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        Self(Arc::new(Mutex::new(Some(Box::new(callback)))))
    }

    fn finish(&self, result: Result<T>) {
        let callback = self.0.lock().take();
        if let Some(callback) = callback {
            callback(result);
        }
    }
}

impl<T> Clone for OnDone<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

fn transfer_failure(conn: &mut Connection, source: io::Error) -> ExchangeError {
    let phase = conn.phase();
    conn.fail();
    ExchangeError::Transfer {
        connection: conn.id(),
        phase,
        source,
    }
}

fn protocol_failure(conn: &mut Connection, violation: ProtocolViolation) -> ExchangeError {
    conn.fail();
    ExchangeError::Protocol {
        connection: conn.id(),
        violation,
    }
}

/// Send all of `data`, re-issuing for whatever a completion left unsent.
///
/// `on_done` receives the connection back once every byte is written.
pub fn send_all<F>(
    port: &PortHandle,
    conn: Connection,
    data: Bytes,
    deadline: Option<Instant>,
    on_done: F,
) where
    F: FnOnce(Result<Connection>) + Send + 'static,
{
    issue_send(port.clone(), conn, data, deadline, OnDone::new(on_done));
}

fn issue_send(
    port: PortHandle,
    conn: Connection,
    data: Bytes,
    deadline: Option<Instant>,
    on_done: OnDone<Connection>,
) {
    let done = on_done.clone();
    let next_port = port.clone();
    let remaining = data.clone();

    let issued = port.begin_send(conn, data, deadline, move |completion| {
        let (mut conn, result) = completion.end();
        match result {
            Ok(n) if n < remaining.len() => {
                if n == 0 {
                    let source = io::Error::new(io::ErrorKind::WriteZero, "send wrote no bytes");
                    done.finish(Err(transfer_failure(&mut conn, source)));
                    return;
                }
                trace!(conn = %conn.id(), sent = n, left = remaining.len() - n, "Partial send");
                match conn.transition(Phase::Sending) {
                    Ok(()) => issue_send(next_port, conn, remaining.slice(n..), deadline, done),
                    Err(e) => {
                        conn.fail();
                        done.finish(Err(e));
                    }
                }
            }
            Ok(_) => done.finish(Ok(conn)),
            Err(source) => done.finish(Err(transfer_failure(&mut conn, source))),
        }
    });

    if let Err(e) = issued {
        on_done.finish(Err(e));
    }
}

/// Receive until the frame buffer yields one complete message.
///
/// End of stream before the delimiter is a protocol failure unless `policy`
/// is [`UnterminatedPolicy::BestEffort`], in which case the buffered bytes
/// (if more than one) are surfaced as the message.
pub fn receive_frame<F>(
    port: &PortHandle,
    conn: Connection,
    policy: UnterminatedPolicy,
    deadline: Option<Instant>,
    on_done: F,
) where
    F: FnOnce(Result<(Connection, Bytes)>) + Send + 'static,
{
    let on_done = OnDone::new(on_done);
    if conn.frame().is_consumed() {
        on_done.finish(Err(ResourceViolation::FrameConsumed(conn.id()).into()));
        return;
    }
    // Re-issues only follow Incomplete, so a completion never sees Drained.
    issue_receive(port.clone(), conn, policy, deadline, on_done);
}

fn issue_receive(
    port: PortHandle,
    conn: Connection,
    policy: UnterminatedPolicy,
    deadline: Option<Instant>,
    on_done: OnDone<(Connection, Bytes)>,
) {
    let done = on_done.clone();
    let next_port = port.clone();

    let issued = port.begin_receive(conn, deadline, move |completion| {
        let (mut conn, result) = completion.end();
        match result {
            Ok(0) => {
                if policy == UnterminatedPolicy::BestEffort {
                    if let Some(message) = conn.frame_mut().finish() {
                        trace!(conn = %conn.id(), len = message.len(), "Unterminated message accepted");
                        done.finish(Ok((conn, message)));
                        return;
                    }
                }
                let buffered = conn.frame().len();
                let violation = ProtocolViolation::Unterminated { buffered };
                done.finish(Err(protocol_failure(&mut conn, violation)));
            }
            Ok(n) => match conn.frame_mut().commit(n) {
                Ok(FrameStatus::Complete(message)) => done.finish(Ok((conn, message))),
                Ok(FrameStatus::Incomplete) => {
                    trace!(conn = %conn.id(), received = n, buffered = conn.frame().len(), "Frame incomplete");
                    match conn.transition(Phase::Receiving) {
                        Ok(()) => issue_receive(next_port, conn, policy, deadline, done),
                        Err(e) => {
                            conn.fail();
                            done.finish(Err(e));
                        }
                    }
                }
                Ok(FrameStatus::Drained) => {
                    debug_assert!(false, "receive completed on a consumed frame");
                    let id = conn.id();
                    conn.fail();
                    done.finish(Err(ResourceViolation::FrameConsumed(id).into()));
                }
                Err(violation) => done.finish(Err(protocol_failure(&mut conn, violation))),
            },
            Err(source) => done.finish(Err(transfer_failure(&mut conn, source))),
        }
    });

    if let Err(e) = issued {
        on_done.finish(Err(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::error::FailureKind;
    use crate::protocol::FrameSettings;
    use crate::runtime::{CompletionPort, Listener, PortConfig};
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(10);

    fn port() -> CompletionPort {
        CompletionPort::new(PortConfig {
            workers: 2,
            event_capacity: 64,
        })
        .unwrap()
    }

    fn accept_std(port: &PortHandle) -> (Listener, Connection, std::net::TcpStream) {
        let listener = port
            .listen(&Endpoint::local(0), 4, FrameSettings::default())
            .unwrap();
        let (tx, rx) = mpsc::channel();
        port.begin_accept(&listener, None, move |result| tx.send(result).unwrap())
            .unwrap();
        let peer = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        let mut conn = rx.recv_timeout(WAIT).unwrap().unwrap();
        conn.transition(Phase::Receiving).unwrap();
        (listener, conn, peer)
    }

    #[test]
    fn test_receive_frame_one_byte_at_a_time() {
        let port = port();
        let handle = port.handle();
        let (_listener, conn, mut peer) = accept_std(&handle);

        let writer = thread::spawn(move || {
            for byte in b"slow message<EOF>" {
                peer.write_all(&[*byte]).unwrap();
                peer.flush().unwrap();
                thread::sleep(Duration::from_millis(1));
            }
            peer
        });

        let (tx, rx) = mpsc::channel();
        receive_frame(&handle, conn, UnterminatedPolicy::Reject, None, move |result| {
            tx.send(result).unwrap()
        });
        let (conn, message) = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(&message[..], b"slow message");
        assert_eq!(conn.phase(), Phase::Receiving);
        writer.join().unwrap();
    }

    #[test]
    fn test_receive_frame_rejects_unterminated() {
        let port = port();
        let handle = port.handle();
        let (_listener, conn, mut peer) = accept_std(&handle);

        peer.write_all(b"partial").unwrap();
        drop(peer);

        let (tx, rx) = mpsc::channel();
        receive_frame(&handle, conn, UnterminatedPolicy::Reject, None, move |result| {
            tx.send(result).unwrap()
        });
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.kind(), FailureKind::Protocol);
        match err {
            ExchangeError::Protocol { violation, .. } => {
                assert_eq!(violation, ProtocolViolation::Unterminated { buffered: 7 });
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_receive_frame_best_effort() {
        let port = port();
        let handle = port.handle();
        let (_listener, conn, mut peer) = accept_std(&handle);

        peer.write_all(b"partial").unwrap();
        drop(peer);

        let (tx, rx) = mpsc::channel();
        receive_frame(&handle, conn, UnterminatedPolicy::BestEffort, None, move |result| {
            tx.send(result).unwrap()
        });
        let (_conn, message) = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(&message[..], b"partial");
    }

    #[test]
    fn test_receive_frame_times_out() {
        let port = port();
        let handle = port.handle();
        let (_listener, conn, _peer) = accept_std(&handle);

        let (tx, rx) = mpsc::channel();
        let deadline = Instant::now() + Duration::from_millis(50);
        receive_frame(&handle, conn, UnterminatedPolicy::Reject, Some(deadline), move |result| {
            tx.send(result).unwrap()
        });
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.kind(), FailureKind::Transfer);
        assert!(err.is_timeout());
    }

    #[test]
    fn test_send_all_large_payload() {
        let port = port();
        let handle = port.handle();
        let (_listener, mut conn, mut peer) = accept_std(&handle);
        conn.transition(Phase::Sending).unwrap();

        let payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let reader = thread::spawn(move || {
            let mut received = vec![0u8; expected.len()];
            peer.read_exact(&mut received).unwrap();
            assert!(received == expected);
        });

        let (tx, rx) = mpsc::channel();
        send_all(&handle, conn, Bytes::from(payload), None, move |result| {
            tx.send(result).unwrap()
        });
        let conn = rx.recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(conn.phase(), Phase::Sending);
        reader.join().unwrap();
        assert_eq!(handle.stats().max_outstanding_per_connection, 1);
    }

    #[test]
    fn test_receive_frame_refuses_consumed_frame() {
        let port = port();
        let handle = port.handle();
        let (_listener, mut conn, _peer) = accept_std(&handle);
        conn.frame_mut().append(b"done<EOF>").unwrap();
        let issued = handle.stats().issued;

        let (tx, rx) = mpsc::channel();
        receive_frame(&handle, conn, UnterminatedPolicy::Reject, None, move |result| {
            tx.send(result).unwrap()
        });
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.kind(), FailureKind::Resource);
        assert_eq!(handle.stats().issued, issued);
    }

    #[test]
    fn test_send_all_on_released_connection() {
        let port = port();
        let handle = port.handle();
        let (_listener, mut conn, _peer) = accept_std(&handle);
        conn.close();

        let (tx, rx) = mpsc::channel();
        send_all(&handle, conn, Bytes::from_static(b"x"), None, move |result| {
            tx.send(result).unwrap()
        });
        let err = rx.recv_timeout(WAIT).unwrap().unwrap_err();
        assert_eq!(err.kind(), FailureKind::Resource);
    }
}
