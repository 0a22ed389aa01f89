use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use flowctl_common::constants::DEFAULT_CONTROL_PORT;
use flowctl_rpc::{RepError, RepSocket, ReqError, ReqOptions, ReqSocket};
use flowctl_wire::rpc::{Action, AdapterRequest, ControlRequest, FlowReport, Reply};
use futures::StreamExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::MissedTickBehavior};
use tracing::Instrument;

use crate::{Decision, NodeState};

/// Default capacity of the report queue.
pub const DEFAULT_TASK_QUEUE: usize = 4;
/// Default interval at which unregistrations are processed.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("RPC error: {0}")]
    Rpc(#[from] RepError),
}

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub listen: SocketAddr,
    /// Reports queued for the decision function before the listener blocks.
    pub task_queue: usize,
    pub cleanup_interval: Duration,
    /// Options for the connections to the nodes' traffic adapters.
    pub node_rpc: ReqOptions,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_CONTROL_PORT),
            task_queue: DEFAULT_TASK_QUEUE,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            node_rpc: ReqOptions::default(),
        }
    }
}

impl ControlOptions {
    pub fn listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    /// Sets the report queue capacity. Values below 1 are treated as 1.
    pub fn task_queue(mut self, capacity: usize) -> Self {
        self.task_queue = capacity.max(1);
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn node_rpc(mut self, options: ReqOptions) -> Self {
        self.node_rpc = options;
        self
    }
}

/// Statistics for a Control Server, shared with its tasks.
#[derive(Debug, Default)]
pub struct ControlStats {
    /// Reports queued for the decision function
    reports: AtomicUsize,
    /// Actions acknowledged by a node
    actions_sent: AtomicUsize,
    /// Actions that could not be delivered
    push_failures: AtomicUsize,
    /// Unregistrations processed
    unregistered: AtomicUsize,
    /// Nodes currently tracked
    nodes: AtomicUsize,
}

impl ControlStats {
    #[inline]
    pub(crate) fn increment_reports(&self) {
        self.reports.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_actions_sent(&self) {
        self.actions_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_push_failures(&self) {
        self.push_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_unregistered(&self) {
        self.unregistered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_nodes(&self, nodes: usize) {
        self.nodes.store(nodes, Ordering::Relaxed);
    }

    #[inline]
    pub fn reports(&self) -> usize {
        self.reports.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn actions_sent(&self) -> usize {
        self.actions_sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn push_failures(&self) -> usize {
        self.push_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn unregistered(&self) -> usize {
        self.unregistered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn nodes(&self) -> usize {
        self.nodes.load(Ordering::Relaxed)
    }
}

/// Unregistrations waiting for the next cleanup pass.
type PendingUnregistrations = Arc<Mutex<Vec<SocketAddr>>>;

/// The Control Server: collects node reports, runs them through a [`Decision`] and
/// pushes the resulting actions back to the nodes.
#[derive(Debug)]
pub struct ControlServer {
    local_addr: SocketAddr,
    stats: Arc<ControlStats>,
    listener: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Binds the RPC listener and starts the decision task.
    pub async fn start<D: Decision>(
        options: ControlOptions,
        decision: D,
    ) -> Result<Self, ControlError> {
        let mut socket = RepSocket::new();
        socket.bind(options.listen).await?;
        let local_addr = socket.local_addr().ok_or(RepError::SocketClosed)?;

        let span = tracing::info_span!(parent: None, "control_server", %local_addr);
        span.in_scope(|| tracing::info!("control server started"));

        let stats = Arc::new(ControlStats::default());
        let pending = PendingUnregistrations::default();
        let (to_consumer, from_listener) = mpsc::channel(options.task_queue.max(1));

        let listener = tokio::spawn(
            listen(socket, to_consumer, Arc::clone(&pending), Arc::clone(&stats))
                .instrument(span.clone()),
        );

        let mut cleanup = tokio::time::interval(options.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let consumer = Consumer {
            decision,
            nodes: FxHashMap::default(),
            from_listener,
            pending,
            cleanup,
            node_rpc: options.node_rpc,
            stats: Arc::clone(&stats),
        };
        let consumer = tokio::spawn(consumer.run().instrument(span));

        Ok(Self { local_addr, stats, listener: Some(listener), consumer: Some(consumer) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ControlStats {
        &self.stats
    }

    /// Closes the listener, lets the decision task finish the queued work, and calls
    /// [`Decision::stop`]. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            let _ = listener.await;
        }

        if let Some(consumer) = self.consumer.take() {
            if let Err(e) = consumer.await {
                tracing::warn!(?e, "control server consumer panicked");
            }
            tracing::debug!(local_addr = %self.local_addr, "control server stopped");
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(consumer) = self.consumer.take() {
            consumer.abort();
        }
    }
}

async fn listen(
    mut socket: RepSocket,
    to_consumer: mpsc::Sender<FlowReport>,
    pending: PendingUnregistrations,
    stats: Arc<ControlStats>,
) {
    while let Some(mut request) = socket.next().await {
        let reply = match ControlRequest::decode(request.take_msg()) {
            Ok(ControlRequest::TestConnection) => Reply::Ack,
            Ok(ControlRequest::PassFlowInfo(report)) => {
                tracing::debug!(
                    node = %report.node,
                    waiting = report.waiting.len(),
                    completed = report.completed.len(),
                    "received report"
                );

                // Waits for room in the queue: reports are never dropped.
                match to_consumer.send(report).await {
                    Ok(()) => {
                        stats.increment_reports();
                        Reply::Ack
                    }
                    Err(_) => Reply::Rejected,
                }
            }
            Ok(ControlRequest::UnregisterServer(node)) => {
                tracing::debug!(%node, "unregistration queued");
                pending.lock().push(node);
                Reply::Ack
            }
            Err(e) => {
                tracing::warn!(?e, source = %request.source(), "malformed control request");
                Reply::Rejected
            }
        };

        if let Err(e) = request.respond(reply.encode()) {
            tracing::debug!(?e, "failed to respond");
        }
    }
}

/// Feeds queued reports to the decision function, one at a time.
struct Consumer<D> {
    decision: D,
    nodes: FxHashMap<SocketAddr, NodeState>,
    from_listener: mpsc::Receiver<FlowReport>,
    pending: PendingUnregistrations,
    cleanup: tokio::time::Interval,
    node_rpc: ReqOptions,
    stats: Arc<ControlStats>,
}

impl<D: Decision> Consumer<D> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                report = self.from_listener.recv() => match report {
                    Some(report) => self.on_report(report).await,
                    None => break,
                },
                _ = self.cleanup.tick() => self.process_unregistrations(),
            }
        }

        self.process_unregistrations();
        self.decision.stop();
        tracing::debug!("decision task stopped");
    }

    async fn on_report(&mut self, report: FlowReport) {
        let node = report.node;
        let action = self.decision.decide(node, &report.waiting, &report.completed);

        let state = self.nodes.entry(node).or_default();
        state.record_report();
        self.stats.set_nodes(self.nodes.len());

        if let Err(e) = self.push(node, action).await {
            self.stats.increment_push_failures();
            tracing::warn!(?e, %node, ?action, "failed to push action");
        }
    }

    /// Sends `action` to the node's traffic adapter, connecting first if needed.
    /// A failed connection is dropped and re-established on the next report.
    async fn push(&mut self, node: SocketAddr, action: Action) -> Result<(), ReqError> {
        let state = self.nodes.entry(node).or_default();

        let client = match &state.client {
            Some(client) => client.clone(),
            None => {
                let client = ReqSocket::connect_with(node, self.node_rpc.clone()).await?;
                state.client = Some(client.clone());
                client
            }
        };

        let request = AdapterRequest::UpdateFlowParameters(action).encode();
        match client.request(request).await {
            Ok(reply) => {
                if !matches!(Reply::decode(reply), Ok(Reply::Ack)) {
                    tracing::warn!(%node, ?action, "node did not acknowledge action");
                }

                state.last_action = Some(action);
                self.stats.increment_actions_sent();
                Ok(())
            }
            Err(e) => {
                state.client = None;
                Err(e)
            }
        }
    }

    fn process_unregistrations(&mut self) {
        let pending = std::mem::take(&mut *self.pending.lock());

        for node in pending {
            if let Some(state) = self.nodes.remove(&node) {
                tracing::info!(%node, reports = state.reports, "node unregistered");
            }

            self.decision.unregister(node);
            self.stats.set_nodes(self.nodes.len());
            self.stats.increment_unregistered();
        }
    }
}
