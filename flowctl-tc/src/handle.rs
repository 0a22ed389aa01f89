//! TC handle computation and common request infrastructure.
//!
//! TC handles are 32-bit values split into major:minor (16:16 bits).

use rtnetlink::packet_route::tc::TcHandle;

/// Number of bands of the prio root qdisc.
pub const BAND_COUNT: u8 = 3;

/// Maps the low four bits of a socket priority to a prio band. This is the kernel's
/// default `prio` map, so traffic is classified the same way with or without us.
pub const PRIOMAP: [u8; 16] = [1, 2, 2, 2, 1, 2, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1];

/// Handle of the prio root qdisc, `1:0`.
pub const PRIO_ROOT_HANDLE: u32 = 0x0001_0000;

/// The offset added to band numbers to compute TBF qdisc majors.
pub const ID_OFFSET: u32 = 10;

/// Common fields shared by all qdisc requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QdiscRequestInner {
    /// The network interface index.
    pub interface_index: i32,
    /// The parent handle (where this qdisc attaches).
    pub parent: TcHandle,
    /// This qdisc's own handle.
    pub handle: TcHandle,
}

impl QdiscRequestInner {
    /// Create a new request for the given interface, defaulting to root parent.
    pub fn new(index: i32) -> Self {
        Self { interface_index: index, parent: TcHandle::ROOT, handle: TcHandle::default() }
    }

    /// Set the parent handle.
    pub fn with_parent(mut self, parent: TcHandle) -> Self {
        self.parent = parent;
        self
    }

    /// Set this qdisc's handle.
    pub fn with_handle(mut self, handle: TcHandle) -> Self {
        self.handle = handle;
        self
    }
}

/// Returns the zero-based prio band a socket priority is classified into.
///
/// Many priorities share a band: the mapping buckets priorities, it never assigns one
/// band per priority.
pub fn band_for_priority(priority: u32) -> u8 {
    PRIOMAP[(priority & 0xF) as usize]
}

/// Compute the prio class handle of a zero-based band.
///
/// # Example
///
/// ```
/// use flowctl_tc::handle::prio_class_handle;
/// assert_eq!(prio_class_handle(0), 0x0001_0001); // 1:1
/// ```
pub fn prio_class_handle(band: u8) -> u32 {
    PRIO_ROOT_HANDLE | (band as u32 + 1)
}

/// Compute the handle of the TBF qdisc attached to a zero-based band.
///
/// # Example
///
/// ```
/// use flowctl_tc::handle::tbf_handle;
/// assert_eq!(tbf_handle(2), 0x000D_0000); // 13:0
/// ```
pub fn tbf_handle(band: u8) -> u32 {
    let major = ID_OFFSET + band as u32 + 1;
    major << 16 // minor must be 0 for qdiscs
}

/// Formats a handle the way `tc` prints it, `major:minor` in hex.
pub fn display_handle(handle: u32) -> String {
    format!("{:x}:{:x}", handle >> 16, handle & 0xFFFF)
}
