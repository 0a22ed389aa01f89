//! Netlink attribute building utilities.

use nix::libc::TCA_OPTIONS;
use rtnetlink::packet_utils::nla::{DefaultNla, NLA_HEADER_SIZE};

/// Build a single NLA: a 4-byte header (length, type, native endian) followed by the
/// value, zero-padded to 4-byte alignment. Reference: <linux/netlink.h>.
pub(crate) fn build_nla(nla_type: u16, value: &[u8]) -> Vec<u8> {
    let nla_len = NLA_HEADER_SIZE + value.len();
    let padded_len = (nla_len + 3) & !3;

    let mut buf = vec![0u8; padded_len];
    buf[0..2].copy_from_slice(&(nla_len as u16).to_ne_bytes());
    buf[2..4].copy_from_slice(&nla_type.to_ne_bytes());
    buf[NLA_HEADER_SIZE..nla_len].copy_from_slice(value);

    buf
}

/// Wrap qdisc-specific configuration in a `TCA_OPTIONS` attribute. Depending on the
/// qdisc, `options` is either a run of nested NLAs (tbf) or a raw struct (prio).
pub(crate) fn build_options(options: Vec<u8>) -> DefaultNla {
    DefaultNla::new(TCA_OPTIONS, options)
}
