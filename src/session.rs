//! Connection-session identity.
//!
//! Every connect/disconnect span of a board gets a fresh
//! [`ConnectionId`].  Registers and events remember the id they were
//! created under; once the device moves on to another id they are stale
//! and every operation on them fails with
//! [`Error::InvalidatedSession`](crate::Error::InvalidatedSession).

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Mint a new id.  Ids are never reused within a process, so handles
    /// from two different devices can never alias.
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}
