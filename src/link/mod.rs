//! Link to the board: the boundary between the event core and the
//! transport collaborator.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        Link                                │
//! │                                                            │
//! │  Device ──▶ Transport (trait) ──▶ BLE / serial / sim       │
//! │    │          send_command · subscribe · read_register     │
//! │    │                                                       │
//! │    ◀── Inbound ◀── Inbox (channel) ◀── transport thread    │
//! │         notifications · responses · log chunks · lifecycle │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Outbound traffic is either a raw register write or a postcard-encoded
//! [`DeviceCommand`]; the transport adapter owns translation to firmware
//! frames.  Inbound traffic is pushed back as [`Inbound`] messages, either
//! directly through [`Device::handle`] or queued in an [`Inbox`].
//!
//! [`Device::handle`]: crate::device::Device::handle

pub mod channels;
pub mod commands;
pub mod inbound;
pub mod transport;

pub use channels::{Inbox, post};
pub use commands::{DeviceCommand, Instruction};
pub use inbound::{Inbound, RawLogEntry};
pub use transport::{NullTransport, RequestId, Transport, TransportError};
