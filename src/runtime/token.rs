//! Operation token tracking for completion correlation.
//!
//! Every operation that has to wait for readiness is parked under a slab
//! token; the reactor registers the socket with that token so an event maps
//! straight back to the parked operation. Operation and listener ids are
//! separate, monotonically increasing identifiers that stay unique even
//! when slab slots are reused.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use mio::Token;
use slab::Slab;

/// Type of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Accept on a listener.
    Accept,
    /// Outbound connect.
    Connect,
    /// Read into a connection's frame buffer.
    Receive,
    /// Write from a caller-provided buffer.
    Send,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpType::Accept => "accept",
            OpType::Connect => "connect",
            OpType::Receive => "receive",
            OpType::Send => "send",
        };
        f.write_str(name)
    }
}

/// Unique identifier of one issued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

/// Unique identifier of a listener registered with a completion port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Source of fresh operation and listener ids.
#[derive(Debug, Default)]
pub(crate) struct IdSource {
    next_op: AtomicU64,
    next_listener: AtomicU64,
}

impl IdSource {
    pub(crate) fn next_op(&self) -> OpId {
        OpId(self.next_op.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_listener(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }
}

/// Allocator for readiness tokens with O(1) lookup.
///
/// Uses a slab to hand out stable tokens for registered sources.
pub(crate) struct TokenAllocator<T> {
    slots: Slab<T>,
}

impl<T> TokenAllocator<T> {
    /// Create a new token allocator with specified capacity.
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Slab::with_capacity(capacity),
        }
    }

    /// Token the next `alloc` will return.
    pub(crate) fn next_token(&self) -> Token {
        Token(self.slots.vacant_key())
    }

    pub(crate) fn alloc(&mut self, entry: T) -> Token {
        Token(self.slots.insert(entry))
    }

    pub(crate) fn get(&self, token: Token) -> Option<&T> {
        self.slots.get(token.0)
    }

    pub(crate) fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.slots.get_mut(token.0)
    }

    /// Free a token, returning the entry that was parked under it.
    pub(crate) fn free(&mut self, token: Token) -> Option<T> {
        self.slots.try_remove(token.0)
    }

    /// Tokens of all entries matching `pred`.
    pub(crate) fn find(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<Token> {
        self.slots
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(key, _)| Token(key))
            .collect()
    }

    /// Remove every entry.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.slots.drain().collect()
    }

    /// Number of currently allocated tokens.
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}
