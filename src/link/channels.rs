//! Inbound message queue.
//!
//! Uses an `embassy-sync` bounded channel to bridge the transport's own
//! delivery thread with the thread that owns the [`Device`].  The
//! transport only ever calls [`post`]; the owner drains with
//! [`Device::drain`] or awaits [`Device::next_inbound`].
//!
//! ```text
//! ┌────────────────┐   Inbound   ┌──────────────┐
//! │ Transport      │────────────▶│ Device owner │
//! │ (BLE callback) │   (Inbox)   │  (handle)    │
//! └────────────────┘             └──────────────┘
//! ```
//!
//! [`Device`]: crate::device::Device
//! [`Device::drain`]: crate::device::Device::drain
//! [`Device::next_inbound`]: crate::device::Device::next_inbound

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::warn;

use super::inbound::Inbound;

/// Channel depth for inbound messages.
pub const INBOX_DEPTH: usize = 64;

/// Inbound queue: transport → device owner.
pub type Inbox = Channel<CriticalSectionRawMutex, Inbound, INBOX_DEPTH>;

/// Queue `msg` without blocking.  Returns `false` (and drops the
/// message) when the inbox is full.
pub fn post(inbox: &Inbox, msg: Inbound) -> bool {
    let name = msg.name();
    if inbox.try_send(msg).is_err() {
        warn!("inbox full, dropping {} message", name);
        return false;
    }
    true
}
