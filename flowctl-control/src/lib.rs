//! # flowctl-control
//!
//! The Control Server shell. Nodes report their running and completed flows to it; each
//! report goes through a pluggable [`Decision`] whose [`Action`](flowctl_wire::rpc::Action)
//! is pushed back to the reporting node's traffic adapter.

mod decision;
mod server;

pub use decision::{Decision, FixedDecision, NodeState};
pub use server::{
    ControlError, ControlOptions, ControlServer, ControlStats, DEFAULT_CLEANUP_INTERVAL,
    DEFAULT_TASK_QUEUE,
};
