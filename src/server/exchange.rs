//! One server-side exchange: receive a framed request, run the handler,
//! send the framed reply, close.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::limit::Permit;
use super::{Counters, Handler};
use crate::error::ExchangeError;
use crate::machine;
use crate::protocol::{encode_frame, UnterminatedPolicy};
use crate::runtime::{Connection, ConnectionId, Phase, PhaseGate, PortHandle};

/// Everything an exchange needs, shared by all connections of a server.
pub(crate) struct ExchangeContext {
    pub(crate) port: PortHandle,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) unterminated: UnterminatedPolicy,
    pub(crate) timeout: Option<Duration>,
    pub(crate) counters: Arc<Counters>,
}

impl ExchangeContext {
    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|timeout| Instant::now() + timeout)
    }
}

/// Accounts for one exchange. Dropping it without `succeed` counts a
/// failure; either way it frees the permit and signals `done`.
struct Tracker {
    counters: Arc<Counters>,
    done: Arc<PhaseGate<()>>,
    permit: Option<Permit>,
    succeeded: bool,
}

impl Tracker {
    fn succeed(mut self) {
        self.succeeded = true;
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        let counter = if self.succeeded {
            &self.counters.completed
        } else {
            &self.counters.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.permit.take();
        self.done.signal(());
    }
}

fn report_failure(conn: ConnectionId, err: &ExchangeError) {
    if err.is_timeout() {
        warn!(conn = %conn, error = %err, "Exchange timed out");
    } else {
        warn!(conn = %conn, kind = ?err.kind(), error = %err, "Exchange failed");
    }
}

/// Drive `conn` through `Receiving -> Sending -> Closed`.
pub(crate) fn start(
    ctx: Arc<ExchangeContext>,
    mut conn: Connection,
    done: Arc<PhaseGate<()>>,
    permit: Option<Permit>,
) {
    let id = conn.id();
    let peer = conn.peer_addr();
    let tracker = Tracker {
        counters: Arc::clone(&ctx.counters),
        done,
        permit,
        succeeded: false,
    };

    if let Err(e) = conn.transition(Phase::Receiving) {
        conn.fail();
        report_failure(id, &e);
        return;
    }

    let deadline = ctx.deadline();
    let port = ctx.port.clone();
    let unterminated = ctx.unterminated;
    machine::receive_frame(&port, conn, unterminated, deadline, move |received| {
        let (mut conn, request) = match received {
            Ok(received) => received,
            Err(e) => {
                report_failure(id, &e);
                drop(tracker);
                return;
            }
        };
        debug!(conn = %id, peer = %peer, bytes = request.len(), "Request received");

        let request_len = request.len();
        let reply = ctx.handler.handle(request);
        if let Err(e) = conn.transition(Phase::Sending) {
            conn.fail();
            report_failure(id, &e);
            return;
        }

        let frame = encode_frame(&reply);
        machine::send_all(&ctx.port, conn, frame, ctx.deadline(), move |sent| match sent {
            Ok(mut conn) => {
                conn.close();
                info!(
                    conn = %id,
                    peer = %peer,
                    request = request_len,
                    reply = reply.len(),
                    "Exchange complete"
                );
                tracker.succeed();
            }
            Err(e) => report_failure(id, &e),
        });
    });
}
