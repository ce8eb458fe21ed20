//! Logical commands sent to the board.
//!
//! The core never builds firmware frames.  It describes what it wants in
//! a [`DeviceCommand`], serialises it with postcard and hands the bytes to
//! [`Transport::send_command`](super::Transport::send_command) addressed
//! to the module that owns the operation.  Adapters decode the command
//! and emit whatever the firmware expects.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::FilterSpec;
use crate::register::{EVENT_MODULE, FILTER_MODULE, LOGGING_MODULE, RegisterAddr};

/// One remotely executable step of a command program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// Write `payload` to `target`.
    Write { target: RegisterAddr, payload: Vec<u8> },
    /// Read `source` on the board, re-firing its data event there.
    Read { source: RegisterAddr },
}

/// Logical operations the core asks the board to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceCommand {
    /// Instantiate a filter whose output lives at `output`.
    CreateFilter {
        output: RegisterAddr,
        source: RegisterAddr,
        filter: FilterSpec,
    },
    /// Tear down the filter at `output` and everything bound to it.
    RemoveFilter { output: RegisterAddr },
    /// Append an entry to flash every time `source` fires.
    StartLogging { source: RegisterAddr },
    StopLogging { source: RegisterAddr },
    /// Ask whether `source` is being logged.  Answered with one byte.
    QueryLogging { source: RegisterAddr },
    /// Stream the buffered entries of `source` back in chunks.
    DownloadLog {
        source: RegisterAddr,
        chunk_entries: u16,
    },
    /// Erase the downloaded entries of `source` from flash.
    ClearLog { source: RegisterAddr },
    /// Run `instructions` every time `trigger` fires, replacing any
    /// previously bound program.
    BindProgram {
        trigger: RegisterAddr,
        instructions: Vec<Instruction>,
    },
    /// Remove the program bound to `trigger`.
    EraseProgram { trigger: RegisterAddr },
}

impl DeviceCommand {
    /// Module register the command is addressed to.
    pub fn target(&self) -> RegisterAddr {
        let module = match self {
            Self::CreateFilter { .. } | Self::RemoveFilter { .. } => FILTER_MODULE,
            Self::StartLogging { .. }
            | Self::StopLogging { .. }
            | Self::QueryLogging { .. }
            | Self::DownloadLog { .. }
            | Self::ClearLog { .. } => LOGGING_MODULE,
            Self::BindProgram { .. } | Self::EraseProgram { .. } => EVENT_MODULE,
        };
        RegisterAddr::module_root(module)
    }

    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateFilter { .. } => "create-filter",
            Self::RemoveFilter { .. } => "remove-filter",
            Self::StartLogging { .. } => "start-logging",
            Self::StopLogging { .. } => "stop-logging",
            Self::QueryLogging { .. } => "query-logging",
            Self::DownloadLog { .. } => "download-log",
            Self::ClearLog { .. } => "clear-log",
            Self::BindProgram { .. } => "bind-program",
            Self::EraseProgram { .. } => "erase-program",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|_| Error::Encoding("device command"))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|_| Error::Encoding("device command"))
    }
}
