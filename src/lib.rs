//! wearevent: event/filter dataflow core for a remote sensor board.
//!
//! Models the discrete occurrences a wearable board produces (button
//! presses, threshold crossings, periodic samples) as [`Event`]s, lets
//! callers compose them with on-board filters, and routes each event to
//! host notifications, on-board command programs and the board's flash
//! log.  The transport to the board is a collaborator behind
//! [`Transport`]; this crate owns identity, lifecycle and the protocols
//! built on top of it.
//!
//! ```no_run
//! use wearevent::{DataKind, Device, Inbound, NullTransport, RegisterAddr, SessionConfig};
//!
//! # fn main() -> wearevent::Result<()> {
//! let mut device = Device::new(NullTransport, SessionConfig::default())?;
//! device.handle(Inbound::Connected);
//!
//! let button = device.event(RegisterAddr::new(0x01, 0x01, 0), DataKind::Bool)?;
//! let presses = device.derive_accumulate_as(&button, "presses")?;
//! device.start_notifications(&presses, |count| println!("presses: {count:?}"))?;
//! # Ok(())
//! # }
//! ```

#![deny(unused_must_use)]

pub mod codec;
pub mod config;
pub mod datalog;
pub mod device;
pub mod graph;
pub mod link;
pub mod notify;
pub mod program;
pub mod register;
pub mod registry;
pub mod session;

mod error;

pub use codec::{DecodeError, EntryDecoder, LeDecoder};
pub use config::{ConfigError, SessionConfig};
pub use datalog::{LogEntry, LoggingQuery, LogHandler, ProgressHandler};
pub use device::Device;
pub use error::{Error, Result};
pub use graph::{Comparison, Event, EventId, FilterSpec, FilterState};
pub use link::{
    DeviceCommand, Inbound, Inbox, Instruction, NullTransport, RawLogEntry, RequestId,
    Transport, TransportError,
};
pub use notify::NotificationHandler;
pub use program::{CommandRecorder, Completion, ReadHandler, RegisterOps};
pub use register::{DataKind, DataRegister, Register, RegisterAddr, Value};
pub use registry::{EventRecipe, RegistrySnapshot, SourceRef};
pub use session::ConnectionId;
