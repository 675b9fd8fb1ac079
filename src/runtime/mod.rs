//! Completion-based networking runtime.
//!
//! A completion port built on top of mio readiness:
//! - `reactor`: one thread owning the poll, turning readiness into completions
//! - `workers`: threads that run completion continuations
//! - `port`: the public API (`CompletionPort`, `PortHandle`, `Listener`)
//! - `connection`: per-connection state machine and owned resources
//! - `gate`: the phase gate a driving thread blocks on
//! - `token`: operation tracking for completion correlation

mod connection;
mod gate;
mod port;
mod reactor;
mod token;
mod workers;

pub use connection::{Connection, ConnectionId, Phase, Role};
pub use gate::{Elapsed, PhaseGate};
pub use port::{Completion, CompletionPort, Listener, PendingOp, PortConfig, PortHandle, PortStats};
pub use token::{ListenerId, OpId, OpType};
