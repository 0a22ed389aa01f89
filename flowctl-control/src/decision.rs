use std::net::SocketAddr;

use flowctl_common::unix_micros;
use flowctl_rpc::ReqSocket;
use flowctl_wire::rpc::{Action, CompletedFlow, FlowAttributes};

/// Turns a node's flow report into the action that node should apply.
///
/// Called once per report, from a single task, so implementations are free to keep
/// per-node state without locking.
pub trait Decision: Send + 'static {
    fn decide(
        &mut self,
        node: SocketAddr,
        waiting: &[FlowAttributes],
        completed: &[CompletedFlow],
    ) -> Action;

    /// Called once a node's unregistration has been processed.
    fn unregister(&mut self, _node: SocketAddr) {}

    /// Called when the Control Server shuts down.
    fn stop(&mut self) {}
}

impl<F> Decision for F
where
    F: FnMut(SocketAddr, &[FlowAttributes], &[CompletedFlow]) -> Action + Send + 'static,
{
    fn decide(
        &mut self,
        node: SocketAddr,
        waiting: &[FlowAttributes],
        completed: &[CompletedFlow],
    ) -> Action {
        self(node, waiting, completed)
    }
}

/// Answers every report with the same action.
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub Action);

impl Decision for FixedDecision {
    fn decide(&mut self, _: SocketAddr, _: &[FlowAttributes], _: &[CompletedFlow]) -> Action {
        self.0
    }
}

/// What the Control Server tracks per reporting node.
#[derive(Debug, Default)]
pub struct NodeState {
    /// Connection to the node's traffic adapter, opened on first use.
    pub(crate) client: Option<ReqSocket>,
    /// Reports received from the node.
    pub reports: u64,
    /// UNIX timestamp of the last report, in microseconds.
    pub last_report_us: u64,
    /// The last action pushed to the node.
    pub last_action: Option<Action>,
}

impl NodeState {
    pub(crate) fn record_report(&mut self) {
        self.reports += 1;
        self.last_report_us = unix_micros();
    }
}
