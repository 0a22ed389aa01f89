//! Prio root qdisc support.

use rtnetlink::packet_core::{
    NetlinkMessage, NLM_F_ACK, NLM_F_CREATE, NLM_F_REPLACE, NLM_F_REQUEST,
};
use rtnetlink::packet_route::{
    tc::{TcAttribute, TcHandle, TcMessage},
    RouteNetlinkMessage,
};

use super::handle::{QdiscRequestInner, BAND_COUNT, PRIOMAP, PRIO_ROOT_HANDLE};
use super::nla::build_options;

/// The kernel's `tc_prio_qopt` structure.
///
/// ```c
/// struct tc_prio_qopt {
///     int   bands;
///     __u8  priomap[TC_PRIO_MAX + 1];
/// };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioQopt {
    pub bands: u32,
    pub priomap: [u8; 16],
}

impl Default for PrioQopt {
    fn default() -> Self {
        Self { bands: BAND_COUNT as u32, priomap: PRIOMAP }
    }
}

impl PrioQopt {
    /// Serialize to bytes in kernel format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(4 + self.priomap.len());
        vec.extend_from_slice(&self.bands.to_ne_bytes());
        vec.extend_from_slice(&self.priomap);
        vec
    }
}

/// Builder for the prio root qdisc, `1:0`.
///
/// Prio dequeues strictly by band: band 0 first, then 1, then 2. Each band is a class
/// `1:(band + 1)` that a TBF rate limiter attaches to.
#[derive(Debug, Clone)]
pub struct QdiscPrioRequest {
    pub inner: QdiscRequestInner,
    pub options: PrioQopt,
}

impl QdiscPrioRequest {
    pub fn new(inner: QdiscRequestInner) -> Self {
        Self { inner, options: PrioQopt::default() }
    }

    /// Build the netlink message. Always replaces whatever root qdisc is installed.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = TcHandle::ROOT;
        tc_message.header.handle = TcHandle::from(PRIO_ROOT_HANDLE);

        tc_message.attributes.push(TcAttribute::Kind("prio".to_string()));
        // Prio takes its options as a raw struct, not nested attributes.
        tc_message.attributes.push(TcAttribute::Other(build_options(self.options.to_bytes())));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_CREATE | NLM_F_REPLACE | NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}

/// Builder for deleting the root qdisc of an interface, restoring the kernel default.
#[derive(Debug, Clone)]
pub struct QdiscDeleteRootRequest {
    pub inner: QdiscRequestInner,
}

impl QdiscDeleteRootRequest {
    pub fn new(inner: QdiscRequestInner) -> Self {
        Self { inner }
    }

    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = TcHandle::ROOT;

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::DelQueueDiscipline(tc_message));
        nl_req.header.flags = NLM_F_REQUEST | NLM_F_ACK;

        nl_req
    }
}
