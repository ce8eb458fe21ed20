//! Session configuration parameters
//!
//! Tunables for one [`Device`](crate::device::Device).  Values are checked
//! by [`SessionConfig::validate`] before a device accepts them; out-of-range
//! values are rejected, never clamped.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Upper bound on filters the board's data-processing module can host.
pub const MAX_BOARD_FILTERS: u8 = 254;

/// Core session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    // --- Log transfer ---
    /// Number of log entries the board sends per download chunk
    pub download_chunk_entries: u16,
    /// Erase downloaded entries from board flash once a download succeeds
    pub clear_log_after_download: bool,

    // --- Event graph ---
    /// Maximum number of derived events alive per connection
    pub max_filters: u8,

    // --- Inbound traffic ---
    /// Maximum inbound messages handled per `Device::drain` call
    pub inbox_drain_limit: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            download_chunk_entries: 64,
            clear_log_after_download: true,
            max_filters: 16,
            inbox_drain_limit: 64,
        }
    }
}

impl SessionConfig {
    /// Range-check every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download_chunk_entries == 0 {
            return Err(ConfigError::ValidationFailed(
                "download_chunk_entries must be non-zero",
            ));
        }
        if self.max_filters == 0 || self.max_filters > MAX_BOARD_FILTERS {
            return Err(ConfigError::ValidationFailed(
                "max_filters must be within 1..=254",
            ));
        }
        if self.inbox_drain_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "inbox_drain_limit must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Errors from [`SessionConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ValidationFailed(msg) => write!(f, "validation failed: {}", msg),
        }
    }
}
