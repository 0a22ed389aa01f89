use std::time::SystemTime;

pub mod mailbox;
pub mod queue;

pub use mailbox::{mailbox, MailboxReceiver, MailboxSender};
pub use queue::BoundedQueue;

/// Returns the current UNIX timestamp in microseconds.
#[inline]
pub fn unix_micros() -> u64 {
    SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default().as_micros() as u64
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;

    /// Bits in one megabit, as used for link rates.
    pub const MBIT: u64 = 1_000_000;

    /// Default port of the Control Server.
    pub const DEFAULT_CONTROL_PORT: u16 = 32202;
    /// Default port of a node's traffic adapter.
    pub const DEFAULT_ADAPTER_PORT: u16 = 16850;
    /// Default port of a passive flow responder.
    pub const DEFAULT_RESPONDER_PORT: u16 = 17850;
}
