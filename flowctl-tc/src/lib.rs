//! # Traffic Control
//!
//! Builders and helpers for the Linux traffic control (tc) requests flowctl needs,
//! sent over rtnetlink.
//!
//! ## Hierarchy
//!
//! ```text
//!                      ┌───────────────────────────┐
//!                      │   Prio root qdisc (1:0)   │
//!                      │  skb->priority → band via │
//!                      │         PRIOMAP           │
//!                      └───────────────────────────┘
//!                                   │
//!          ┌────────────────────────┼────────────────────────┐
//!          ▼                        ▼                        ▼
//!   ┌──────────────┐         ┌──────────────┐         ┌──────────────┐
//!   │ Band 0 (1:1) │         │ Band 1 (1:2) │         │ Band 2 (1:3) │
//!   │ served first │         │              │         │ served last  │
//!   └──────────────┘         └──────────────┘         └──────────────┘
//!          │                        │                        │
//!          ▼                        ▼                        ▼
//!   ┌──────────────┐         ┌──────────────┐         ┌──────────────┐
//!   │  TBF (b:0)   │         │  TBF (c:0)   │         │  TBF (d:0)   │
//!   │ band rate    │         │ band rate    │         │ band rate    │
//!   └──────────────┘         └──────────────┘         └──────────────┘
//! ```
//!
//! Sockets are tagged with `SO_PRIORITY`; prio strictly orders the bands and every
//! band's TBF caps its rate. Changing an action's rate replaces the TBF of the band the
//! action's priority maps to.

pub mod core;
mod error;
pub mod handle;
pub mod link;
mod nla;
pub mod prio;
pub mod requests;
pub mod tbf;

pub use error::{ErrorClass, KernelError};

/// Opens a new rtnetlink connection, spawning its driver on the current runtime.
///
/// Returns the handle and the connection task, which should be aborted once the handle
/// is no longer needed.
pub fn connect() -> Result<(rtnetlink::Handle, tokio::task::JoinHandle<()>), KernelError> {
    let (connection, handle, _) = rtnetlink::new_connection()?;
    let task = tokio::spawn(connection);

    Ok((handle, task))
}
