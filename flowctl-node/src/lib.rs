//! # flowctl-node
//!
//! Everything that runs on a traffic-generating node:
//!
//! - [`worker::FlowWorker`]s open one persistent connection each and send flows over it,
//!   one after another, with sizes and gaps drawn by a [`sampler::FlowSampler`].
//! - Every worker publishes its current flow in a [`registry::FlowRegistry`] slot and
//!   pushes finished flows into the [`completion::CompletionChannel`].
//! - The [`coordinator::Coordinator`] spawns the workers and periodically reports the
//!   registry snapshot and the drained completions to the Control Server.
//! - The [`adapter::TrafficAdapter`] receives the Control Server's actions and applies
//!   them to the kernel's queueing disciplines.
//! - A [`responder::Responder`] acknowledges the flows other nodes send to this one.

pub mod adapter;
pub mod completion;
pub mod coordinator;
pub mod distribution;
pub mod registry;
pub mod responder;
pub mod sampler;
pub mod telemetry;
pub mod worker;

pub use adapter::{AdapterOptions, TrafficAdapter};
pub use coordinator::{Coordinator, CoordinatorOptions};
pub use responder::{Responder, ResponderOptions};
pub use worker::{FlowWorker, WorkerOptions};
