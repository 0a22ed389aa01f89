//! Wire formats shared by flowctl nodes and the control server.
//!
//! - [`reqrep`]: the length-prefixed request/reply frame used by every RPC connection.
//! - [`rpc`]: the typed messages carried inside those frames.
//! - [`flow`]: the sentinel tokens that delimit synthetic flows on a data connection.

pub mod flow;
pub mod reqrep;
pub mod rpc;
