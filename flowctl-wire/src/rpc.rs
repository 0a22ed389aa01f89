//! Typed control-plane messages.
//!
//! Every message is a one-byte method tag followed by fixed-field records. Decoding
//! validates presence and arity of every field and rejects trailing bytes, so a
//! malformed request is refused at the boundary instead of reaching the handlers.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// IANA protocol number for TCP.
pub const PROTOCOL_TCP: u8 = 6;

const TAG_TEST_CONNECTION: u8 = 0x01;
const TAG_PASS_FLOW_INFO: u8 = 0x02;
const TAG_UNREGISTER_SERVER: u8 = 0x03;
const TAG_UPDATE_FLOW_PARAMETERS: u8 = 0x10;

const REPLY_ACK: u8 = 0x00;
const REPLY_REJECTED: u8 = 0x01;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Smallest possible encoding of a socket address (family + IPv4 + port).
const MIN_ADDR_LEN: usize = 1 + 4 + 2;
/// Smallest possible encoding of [`FlowAttributes`].
const MIN_ATTRIBUTES_LEN: usize = 2 * MIN_ADDR_LEN + 1 + 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Message truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("Unknown method tag {0:#04x}")]
    UnknownMethod(u8),
    #[error("Unknown reply tag {0:#04x}")]
    UnknownReply(u8),
    #[error("Invalid address family {0}")]
    InvalidAddressFamily(u8),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// The identifying attributes of a flow: its 5-tuple plus the socket priority it runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowAttributes {
    /// Source IP and port.
    pub src: SocketAddr,
    /// Destination IP and port.
    pub dst: SocketAddr,
    /// IP protocol number.
    pub protocol: u8,
    /// Socket priority the flow is tagged with.
    pub priority: u32,
}

impl Default for FlowAttributes {
    fn default() -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self { src: unspecified, dst: unspecified, protocol: PROTOCOL_TCP, priority: 0 }
    }
}

/// A flow whose send/ack cycle has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedFlow {
    pub attributes: FlowAttributes,
    /// Flow completion time, in microseconds.
    pub completion_time_us: u64,
    /// Number of payload bytes sent.
    pub size_bytes: u64,
}

/// A priority/rate prescription for a node's outbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    pub priority: u32,
    /// Rate limit in bits per second.
    pub rate_bps: u64,
}

/// One reporting window of a node: its running flows and the flows it completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowReport {
    /// The control-plane address of the reporting node's traffic adapter.
    pub node: SocketAddr,
    pub waiting: Vec<FlowAttributes>,
    pub completed: Vec<CompletedFlow>,
}

impl FlowReport {
    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty() && self.completed.is_empty()
    }
}

/// Requests served by the control server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Liveness probe, does nothing.
    TestConnection,
    /// A node's periodic flow report.
    PassFlowInfo(FlowReport),
    /// A node is shutting down; the argument is its control-plane address.
    UnregisterServer(SocketAddr),
}

impl ControlRequest {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();

        match self {
            Self::TestConnection => dst.put_u8(TAG_TEST_CONNECTION),
            Self::PassFlowInfo(report) => {
                dst.put_u8(TAG_PASS_FLOW_INFO);
                put_addr(&mut dst, report.node);

                dst.put_u32(report.waiting.len() as u32);
                for attributes in &report.waiting {
                    put_attributes(&mut dst, attributes);
                }

                dst.put_u32(report.completed.len() as u32);
                for flow in &report.completed {
                    put_attributes(&mut dst, &flow.attributes);
                    dst.put_u64(flow.completion_time_us);
                    dst.put_u64(flow.size_bytes);
                }
            }
            Self::UnregisterServer(node) => {
                dst.put_u8(TAG_UNREGISTER_SERVER);
                put_addr(&mut dst, *node);
            }
        }

        dst.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self, Error> {
        ensure(&src, 1)?;

        let request = match src.get_u8() {
            TAG_TEST_CONNECTION => Self::TestConnection,
            TAG_PASS_FLOW_INFO => {
                let node = get_addr(&mut src)?;

                let count = get_count(&mut src, MIN_ATTRIBUTES_LEN)?;
                let mut waiting = Vec::with_capacity(count);
                for _ in 0..count {
                    waiting.push(get_attributes(&mut src)?);
                }

                let count = get_count(&mut src, MIN_ATTRIBUTES_LEN + 16)?;
                let mut completed = Vec::with_capacity(count);
                for _ in 0..count {
                    let attributes = get_attributes(&mut src)?;
                    ensure(&src, 16)?;
                    completed.push(CompletedFlow {
                        attributes,
                        completion_time_us: src.get_u64(),
                        size_bytes: src.get_u64(),
                    });
                }

                Self::PassFlowInfo(FlowReport { node, waiting, completed })
            }
            TAG_UNREGISTER_SERVER => Self::UnregisterServer(get_addr(&mut src)?),
            tag => return Err(Error::UnknownMethod(tag)),
        };

        ensure_consumed(&src)?;
        Ok(request)
    }
}

/// Requests served by a node's traffic adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterRequest {
    UpdateFlowParameters(Action),
}

impl AdapterRequest {
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(13);

        match self {
            Self::UpdateFlowParameters(action) => {
                dst.put_u8(TAG_UPDATE_FLOW_PARAMETERS);
                dst.put_u32(action.priority);
                dst.put_u64(action.rate_bps);
            }
        }

        dst.freeze()
    }

    pub fn decode(mut src: Bytes) -> Result<Self, Error> {
        ensure(&src, 1)?;

        let request = match src.get_u8() {
            TAG_UPDATE_FLOW_PARAMETERS => {
                ensure(&src, 12)?;
                Self::UpdateFlowParameters(Action {
                    priority: src.get_u32(),
                    rate_bps: src.get_u64(),
                })
            }
            tag => return Err(Error::UnknownMethod(tag)),
        };

        ensure_consumed(&src)?;
        Ok(request)
    }
}

/// The reply to any request. Control-plane methods return nothing, so a reply only
/// states whether the request was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Rejected,
}

impl Reply {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Ack => Bytes::from_static(&[REPLY_ACK]),
            Self::Rejected => Bytes::from_static(&[REPLY_REJECTED]),
        }
    }

    pub fn decode(mut src: Bytes) -> Result<Self, Error> {
        ensure(&src, 1)?;

        let reply = match src.get_u8() {
            REPLY_ACK => Self::Ack,
            REPLY_REJECTED => Self::Rejected,
            tag => return Err(Error::UnknownReply(tag)),
        };

        ensure_consumed(&src)?;
        Ok(reply)
    }
}

#[inline]
fn ensure(src: &impl Buf, needed: usize) -> Result<(), Error> {
    let remaining = src.remaining();
    if remaining < needed {
        return Err(Error::Truncated { needed, remaining });
    }

    Ok(())
}

#[inline]
fn ensure_consumed(src: &impl Buf) -> Result<(), Error> {
    match src.remaining() {
        0 => Ok(()),
        n => Err(Error::TrailingBytes(n)),
    }
}

/// Reads a list length, checking that the remaining input can hold that many items.
fn get_count(src: &mut impl Buf, min_item_len: usize) -> Result<usize, Error> {
    ensure(src, 4)?;
    let count = src.get_u32() as usize;
    ensure(src, count.saturating_mul(min_item_len))?;

    Ok(count)
}

fn put_addr(dst: &mut impl BufMut, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            dst.put_u8(FAMILY_V4);
            dst.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            dst.put_u8(FAMILY_V6);
            dst.put_slice(&ip.octets());
        }
    }
    dst.put_u16(addr.port());
}

fn get_addr(src: &mut impl Buf) -> Result<SocketAddr, Error> {
    ensure(src, 1)?;

    let ip = match src.get_u8() {
        FAMILY_V4 => {
            ensure(src, 4 + 2)?;
            let mut octets = [0u8; 4];
            src.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_V6 => {
            ensure(src, 16 + 2)?;
            let mut octets = [0u8; 16];
            src.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        family => return Err(Error::InvalidAddressFamily(family)),
    };

    Ok(SocketAddr::new(ip, src.get_u16()))
}

fn put_attributes(dst: &mut impl BufMut, attributes: &FlowAttributes) {
    put_addr(dst, attributes.src);
    put_addr(dst, attributes.dst);
    dst.put_u8(attributes.protocol);
    dst.put_u32(attributes.priority);
}

fn get_attributes(src: &mut impl Buf) -> Result<FlowAttributes, Error> {
    let src_addr = get_addr(src)?;
    let dst_addr = get_addr(src)?;
    ensure(src, 5)?;

    Ok(FlowAttributes {
        src: src_addr,
        dst: dst_addr,
        protocol: src.get_u8(),
        priority: src.get_u32(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attributes(priority: u32) -> FlowAttributes {
        FlowAttributes {
            src: "10.0.0.1:40000".parse().unwrap(),
            dst: "[fd00::2]:17850".parse().unwrap(),
            protocol: PROTOCOL_TCP,
            priority,
        }
    }

    #[test]
    fn flow_report_survives_the_wire() {
        let report = FlowReport {
            node: "10.0.0.1:16850".parse().unwrap(),
            waiting: vec![attributes(0), attributes(4)],
            completed: vec![CompletedFlow {
                attributes: attributes(2),
                completion_time_us: 1_250,
                size_bytes: 1_500,
            }],
        };

        let request = ControlRequest::PassFlowInfo(report);
        assert_eq!(ControlRequest::decode(request.encode()).unwrap(), request);
    }

    #[test]
    fn truncated_report_is_rejected() {
        let request = ControlRequest::PassFlowInfo(FlowReport {
            node: "10.0.0.1:16850".parse().unwrap(),
            waiting: vec![attributes(0)],
            completed: vec![],
        });

        let encoded = request.encode();
        let truncated = encoded.slice(..encoded.len() - 3);
        assert!(matches!(ControlRequest::decode(truncated), Err(Error::Truncated { .. })));
    }

    #[test]
    fn oversized_count_is_rejected_before_allocating() {
        let mut dst = BytesMut::new();
        dst.put_u8(TAG_PASS_FLOW_INFO);
        put_addr(&mut dst, "10.0.0.1:1".parse().unwrap());
        dst.put_u32(u32::MAX);

        assert!(matches!(ControlRequest::decode(dst.freeze()), Err(Error::Truncated { .. })));
    }

    #[test]
    fn action_arity_is_checked() {
        let mut short = BytesMut::new();
        short.put_u8(TAG_UPDATE_FLOW_PARAMETERS);
        short.put_u32(3);
        assert!(matches!(AdapterRequest::decode(short.freeze()), Err(Error::Truncated { .. })));

        let mut long = BytesMut::new();
        long.put_u8(TAG_UPDATE_FLOW_PARAMETERS);
        long.put_u32(3);
        long.put_u64(100_000);
        long.put_u32(9);
        assert_eq!(AdapterRequest::decode(long.freeze()), Err(Error::TrailingBytes(4)));
    }

    #[test]
    fn unknown_tags_are_rejected() {
        assert_eq!(
            ControlRequest::decode(Bytes::from_static(&[0x7f])),
            Err(Error::UnknownMethod(0x7f))
        );
        assert_eq!(
            AdapterRequest::decode(Bytes::from_static(&[TAG_TEST_CONNECTION])),
            Err(Error::UnknownMethod(TAG_TEST_CONNECTION))
        );
        assert_eq!(Reply::decode(Bytes::from_static(&[9])), Err(Error::UnknownReply(9)));
        assert!(matches!(ControlRequest::decode(Bytes::new()), Err(Error::Truncated { .. })));
    }

    #[test]
    fn invalid_address_family() {
        let src = Bytes::from_static(&[TAG_UNREGISTER_SERVER, 5, 0, 0, 0, 0, 0, 0]);
        assert_eq!(ControlRequest::decode(src), Err(Error::InvalidAddressFamily(5)));
    }
}
