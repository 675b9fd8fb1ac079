//! framed-echo: a delimiter-framed request/response client and server.
//!
//! Messages are arbitrary bytes terminated by `<EOF>`. Every socket
//! operation is issued on a [`runtime::CompletionPort`] and finishes in a
//! continuation on a worker thread; callers only ever block on phase gates.

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod machine;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use client::{Client, ClientSettings, Session};
pub use endpoint::Endpoint;
pub use error::{ExchangeError, FailureKind, Result};
pub use server::{AdmissionPolicy, Echo, Handler, Server, ServerHandle, ServerSettings};
