//! Token Bucket Filter (TBF) qdisc support.
//!
//! One TBF sits under every prio band and caps the rate of that band.

use rtnetlink::packet_core::{
    NetlinkMessage, NLM_F_ACK, NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST,
};
use rtnetlink::packet_route::{
    tc::{TcAttribute, TcMessage},
    RouteNetlinkMessage,
};

use super::core::{transmit_ticks, MTU_ETHERNET};
use super::handle::QdiscRequestInner;
use super::nla::{build_nla, build_options};

/// Default rate table (256 zeroed u32 entries). Modern kernels only use it for linklayer
/// detection, and `rtab[0] == 0` makes them pick Ethernet without inspecting it further.
const DEFAULT_RATE_TABLE: [u8; 1024] = [0u8; 1024];

// TBF-specific TCA_OPTIONS sub-attributes (from linux/pkt_sched.h)
const TCA_TBF_PARMS: u16 = 1;
const TCA_TBF_RTAB: u16 = 2;
const TCA_TBF_RATE64: u16 = 4;
const TCA_TBF_BURST: u16 = 6;

/// The kernel's `tc_ratespec` structure.
///
/// ```c
/// struct tc_ratespec {
///     unsigned char cell_log;
///     __u8 linklayer;
///     unsigned short overhead;
///     short cell_align;
///     unsigned short mpu;
///     __u32 rate;
/// };
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcRateSpec {
    pub cell_log: u8,
    /// Link layer type (0 = unaware, 1 = ethernet, 2 = ATM).
    pub linklayer: u8,
    pub overhead: u16,
    pub cell_align: i16,
    pub mpu: u16,
    /// Rate in bytes per second, saturated at `u32::MAX`.
    pub rate: u32,
}

impl TcRateSpec {
    pub fn new(rate_bytes_per_sec: u64, mtu: u32) -> Self {
        Self {
            rate: rate_bytes_per_sec.min(u32::MAX as u64) as u32,
            cell_log: Self::compute_cell_log(mtu),
            cell_align: -1,
            ..Default::default()
        }
    }

    /// Smallest `cell_log` with `mtu >> cell_log <= 255`.
    pub fn compute_cell_log(mtu: u32) -> u8 {
        let mut cell_log = 0u8;
        while (mtu >> cell_log) > 255 {
            cell_log += 1;
        }
        cell_log
    }

    /// Serialize to bytes in kernel format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(12);
        vec.push(self.cell_log);
        vec.push(self.linklayer);
        vec.extend_from_slice(&self.overhead.to_ne_bytes());
        vec.extend_from_slice(&self.cell_align.to_ne_bytes());
        vec.extend_from_slice(&self.mpu.to_ne_bytes());
        vec.extend_from_slice(&self.rate.to_ne_bytes());
        vec
    }
}

/// The kernel's `tc_tbf_qopt` structure, plus the byte-denominated values that travel
/// as separate attributes.
///
/// ```c
/// struct tc_tbf_qopt {
///     struct tc_ratespec rate;
///     struct tc_ratespec peakrate;
///     __u32 limit;
///     __u32 buffer;
///     __u32 mtu;
/// };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbfQopt {
    pub rate: TcRateSpec,
    /// Unused, left zeroed.
    pub peakrate: TcRateSpec,
    /// Maximum bytes that can queue waiting for tokens.
    pub limit: u32,
    /// Bucket size in scheduler ticks.
    pub buffer: u32,
    pub mtu: u32,
    /// Bucket size in bytes.
    pub burst_bytes: u32,
    /// The full rate, for rates that do not fit `tc_ratespec`.
    pub rate64: u64,
}

impl TbfQopt {
    /// Computes the TBF parameters for a rate in bytes per second.
    pub fn from_rate(rate_bytes_per_sec: u64, burst_bytes: u32, limit_bytes: u32) -> Self {
        Self {
            rate: TcRateSpec::new(rate_bytes_per_sec, MTU_ETHERNET),
            peakrate: TcRateSpec::default(),
            limit: limit_bytes,
            buffer: transmit_ticks(burst_bytes, rate_bytes_per_sec),
            mtu: MTU_ETHERNET,
            burst_bytes,
            rate64: rate_bytes_per_sec,
        }
    }

    /// Returns `true` if the rate does not fit the 32-bit `tc_ratespec` field.
    pub fn needs_rate64(&self) -> bool {
        self.rate64 > u32::MAX as u64
    }

    /// Serialize the `tc_tbf_qopt` structure.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(12 + 12 + 4 + 4 + 4);
        vec.extend_from_slice(&self.rate.to_bytes());
        vec.extend_from_slice(&self.peakrate.to_bytes());
        vec.extend_from_slice(&self.limit.to_ne_bytes());
        vec.extend_from_slice(&self.buffer.to_ne_bytes());
        vec.extend_from_slice(&self.mtu.to_ne_bytes());
        vec
    }
}

/// Builder for a TBF qdisc under a prio band.
#[derive(Debug, Clone)]
pub struct QdiscTbfRequest {
    pub inner: QdiscRequestInner,
    pub options: TbfQopt,
    /// If true, replace an existing qdisc instead of failing if it exists.
    pub replace: bool,
}

impl QdiscTbfRequest {
    pub fn new(inner: QdiscRequestInner, options: TbfQopt) -> Self {
        Self { inner, options, replace: false }
    }

    /// When `true`, uses `NLM_F_REPLACE` to update an existing qdisc in place.
    /// When `false` (default), uses `NLM_F_EXCL` to fail if the qdisc exists.
    pub fn with_replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    /// Build the netlink message to create or replace this TBF qdisc.
    pub fn build(self) -> NetlinkMessage<RouteNetlinkMessage> {
        let mut tc_message = TcMessage::with_index(self.inner.interface_index);
        tc_message.header.parent = self.inner.parent;
        tc_message.header.handle = self.inner.handle;

        tc_message.attributes.push(TcAttribute::Kind("tbf".to_string()));

        let mut nlas = build_nla(TCA_TBF_PARMS, &self.options.to_bytes());
        nlas.extend(build_nla(TCA_TBF_RTAB, &DEFAULT_RATE_TABLE));
        nlas.extend(build_nla(TCA_TBF_BURST, &self.options.burst_bytes.to_ne_bytes()));
        if self.options.needs_rate64() {
            nlas.extend(build_nla(TCA_TBF_RATE64, &self.options.rate64.to_ne_bytes()));
        }
        tc_message.attributes.push(TcAttribute::Other(build_options(nlas)));

        let mut nl_req = NetlinkMessage::from(RouteNetlinkMessage::NewQueueDiscipline(tc_message));
        nl_req.header.flags = if self.replace {
            NLM_F_CREATE | NLM_F_REPLACE | NLM_F_REQUEST | NLM_F_ACK
        } else {
            NLM_F_CREATE | NLM_F_EXCL | NLM_F_REQUEST | NLM_F_ACK
        };

        tracing::trace!(?nl_req, "built tbf request");

        nl_req
    }
}
