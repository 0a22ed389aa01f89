//! Request/reply sockets for the flowctl control plane.
//!
//! A [`RepSocket`] accepts any number of TCP connections and yields the requests they
//! carry as a [`Stream`](futures::Stream); a [`ReqSocket`] sends requests over a single
//! connection and matches replies back to callers by message ID. Both frame their
//! payloads with [`flowctl_wire::reqrep::Codec`].

mod rep;
mod req;

pub use rep::*;
pub use req::*;

/// Capacity of the channels between a socket front-end and its driver task.
pub(crate) const DEFAULT_QUEUE_SIZE: usize = 1024;
