//! Transport abstraction: any channel that reaches the board.
//!
//! Concrete implementations live outside this crate:
//! - BLE GATT (write characteristic + notify characteristic)
//! - USB serial bridges
//! - in-process simulators for tests
//!
//! Every call returns as soon as the request is queued.  Results arrive
//! later as [`Inbound`](super::Inbound) messages correlated by
//! [`RequestId`].

use core::fmt;

use crate::register::RegisterAddr;

/// Correlates an outbound request with its inbound response.
/// Minted by the transport; unique per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Byte-oriented request channel to the board.
pub trait Transport {
    /// Queue a write of `payload` to `target`.
    fn send_command(
        &mut self,
        target: RegisterAddr,
        payload: &[u8],
    ) -> Result<RequestId, TransportError>;

    /// Start streaming `source` notifications to the host.
    fn subscribe(&mut self, source: RegisterAddr) -> Result<(), TransportError>;

    /// Stop streaming `source` notifications.
    fn unsubscribe(&mut self, source: RegisterAddr) -> Result<(), TransportError>;

    /// Queue a read of `source`.
    fn read_register(&mut self, source: RegisterAddr) -> Result<RequestId, TransportError>;
}

/// Errors reported by a [`Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No link to the board.
    NotConnected,
    /// The link dropped while the request was outstanding.
    ConnectionLost,
    /// The board did not answer in time.
    Timeout,
    /// The board refused the request with a firmware status code.
    Rejected(u8),
    /// Any other I/O failure, described by the adapter.
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Timeout => write!(f, "timed out"),
            Self::Rejected(code) => write!(f, "rejected by board (status {code:#04x})"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

/// A transport that is never connected.
/// Useful as a placeholder before a link is established.
pub struct NullTransport;

impl Transport for NullTransport {
    fn send_command(
        &mut self,
        _target: RegisterAddr,
        _payload: &[u8],
    ) -> Result<RequestId, TransportError> {
        Err(TransportError::NotConnected)
    }

    fn subscribe(&mut self, _source: RegisterAddr) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    fn unsubscribe(&mut self, _source: RegisterAddr) -> Result<(), TransportError> {
        Err(TransportError::NotConnected)
    }

    fn read_register(&mut self, _source: RegisterAddr) -> Result<RequestId, TransportError> {
        Err(TransportError::NotConnected)
    }
}
