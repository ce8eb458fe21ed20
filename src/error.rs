//! Unified error type for the event core.
//!
//! Construction-time validation failures (bad arguments, identifier
//! collisions, stale handles) are returned synchronously from the call
//! that caused them.  Runtime failures from the board travel through the
//! completion channel of the operation they belong to, wrapped in the
//! same [`Error`] so callers match on one type.

use core::fmt;

use crate::codec::DecodeError;
use crate::config::ConfigError;
use crate::link::TransportError;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the crate funnels into this type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The event or register belongs to a connection that has dropped.
    InvalidatedSession,
    /// A filter or configuration parameter is malformed.
    InvalidArgument(&'static str),
    /// The identifier is already bound in this device session.
    DuplicateIdentifier(String),
    /// Registers from different device sessions were combined.
    CrossSession,
    /// A captured command block contains a call the board cannot run.
    InvalidCommandSequence(&'static str),
    /// A log download for this event is already in flight.
    DownloadInProgress,
    /// The transport reported a failure.
    Transport(TransportError),
    /// The board has no room for another filter.
    ResourceExhausted(&'static str),
    /// A payload or log entry could not be decoded.
    Decode(DecodeError),
    /// A restoration recipe references an identifier that is no longer bound.
    UnknownIdentifier(String),
    /// Session configuration failed validation.
    Config(ConfigError),
    /// A logical command or recipe could not be (de)serialised.
    Encoding(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidatedSession => write!(f, "connection session has been invalidated"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::DuplicateIdentifier(id) => write!(f, "identifier '{id}' is already bound"),
            Self::CrossSession => write!(f, "registers belong to different device sessions"),
            Self::InvalidCommandSequence(msg) => write!(f, "invalid command sequence: {msg}"),
            Self::DownloadInProgress => write!(f, "log download already in progress"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            Self::Decode(e) => write!(f, "decode: {e}"),
            Self::UnknownIdentifier(id) => write!(f, "identifier '{id}' is not bound"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Encoding(msg) => write!(f, "encoding: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
