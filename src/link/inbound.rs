//! Inbound traffic from the board.
//!
//! The transport (or the connection-lifecycle notifier wrapped around it)
//! reports everything it learns as an [`Inbound`] message.  The device
//! consumes them one at a time, in order.

use crate::register::RegisterAddr;

use super::transport::{RequestId, TransportError};

/// One undecoded entry from the board's flash log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogEntry {
    /// Board tick at which the entry was written, in milliseconds.
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

/// Messages pushed from the transport into the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A link to the board came up; a new connection session starts.
    Connected,
    /// The link dropped; every handle of the current session is now stale.
    Disconnected,
    /// A streamed register fired.
    Notification {
        source: RegisterAddr,
        timestamp_ms: u64,
        payload: Vec<u8>,
    },
    /// A notification stream reported a failure.
    StreamError {
        source: RegisterAddr,
        error: TransportError,
    },
    /// Completion of a request: read data, command acknowledgement, or
    /// query answer.
    Response {
        request: RequestId,
        result: Result<Vec<u8>, TransportError>,
    },
    /// One chunk of a log download.  `total_entries` is the number of
    /// entries the board had buffered when the download started.
    LogChunk {
        request: RequestId,
        total_entries: u32,
        entries: Vec<RawLogEntry>,
    },
}

impl Inbound {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Notification { .. } => "notification",
            Self::StreamError { .. } => "stream-error",
            Self::Response { .. } => "response",
            Self::LogChunk { .. } => "log-chunk",
        }
    }
}
