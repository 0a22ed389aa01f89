//! The Flow Coordinator: owns a node's workers, its registry and completion channel, and
//! its traffic adapter, and reports the node's flows to the Control Server.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use flowctl_common::constants::DEFAULT_CONTROL_PORT;
use flowctl_rpc::{ReqError, ReqOptions, ReqSocket};
use flowctl_wire::{
    flow::FlowTokens,
    rpc::{ControlRequest, FlowReport, Reply},
};
use thiserror::Error;
use tokio::{
    sync::Mutex,
    task::{JoinHandle, JoinSet},
};
use tracing::Instrument;

use crate::{
    adapter::{AdapterError, AdapterOptions, QdiscBackend, TrafficAdapter},
    completion::{CompletionChannel, DEFAULT_COMPLETION_CAPACITY},
    distribution::{self, default_classes, DistributionError, FlowClass},
    registry::FlowRegistry,
    sampler::{CdfError, CdfTable, FlowSampler},
    telemetry::telemetry_path,
    worker::{FlowInterval, FlowSize, FlowWorker, TransportError, WorkerOptions},
};

/// Default interval between two flow reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Invalid flow distribution: {0}")]
    Distribution(#[from] DistributionError),
    #[error("Invalid CDF table: {0}")]
    Cdf(#[from] CdfError),
    #[error("Flow class with priority {0} has no fixed size and no CDF table is configured")]
    MissingSize(u32),
    #[error("Completion channel capacity must be non-zero")]
    ZeroCompletionCapacity,
    #[error("Control server unreachable: {0}")]
    ControlPlane(#[from] ReqError),
    #[error("Traffic adapter error: {0}")]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Address of the Control Server.
    pub control_addr: SocketAddr,
    /// Responders to send flows to.
    pub peers: Vec<SocketAddr>,
    /// Number of workers across all peers.
    pub total_flows: usize,
    pub classes: Vec<FlowClass>,
    /// Table flow sizes and intervals are drawn from, if any.
    pub cdf_path: Option<PathBuf>,
    /// Offered load in Mbit/s, used to derive arrival rates from the CDF table.
    pub load_mbps: f64,
    /// Interval between flows when no CDF table is configured.
    pub flow_interval: Duration,
    pub report_interval: Duration,
    pub completion_capacity: usize,
    /// Directory for the per-worker CSV files. No telemetry files if `None`.
    pub telemetry_dir: Option<PathBuf>,
    pub tokens: FlowTokens,
    /// Stop every worker after this many flows. Unbounded if `None`.
    pub max_flows_per_worker: Option<u64>,
    pub adapter: AdapterOptions,
    pub rpc: ReqOptions,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            control_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_CONTROL_PORT),
            peers: Vec::new(),
            total_flows: 0,
            classes: default_classes(),
            cdf_path: None,
            load_mbps: 1.0,
            flow_interval: Duration::ZERO,
            report_interval: DEFAULT_REPORT_INTERVAL,
            completion_capacity: DEFAULT_COMPLETION_CAPACITY,
            telemetry_dir: None,
            tokens: FlowTokens::default(),
            max_flows_per_worker: None,
            adapter: AdapterOptions::default(),
            rpc: ReqOptions::default(),
        }
    }
}

impl CoordinatorOptions {
    pub fn control_addr(mut self, control_addr: SocketAddr) -> Self {
        self.control_addr = control_addr;
        self
    }

    pub fn peers(mut self, peers: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.peers = peers.into_iter().collect();
        self
    }

    pub fn total_flows(mut self, total_flows: usize) -> Self {
        self.total_flows = total_flows;
        self
    }

    pub fn classes(mut self, classes: Vec<FlowClass>) -> Self {
        self.classes = classes;
        self
    }

    pub fn cdf_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cdf_path = Some(path.into());
        self
    }

    pub fn load_mbps(mut self, load_mbps: f64) -> Self {
        self.load_mbps = load_mbps;
        self
    }

    pub fn flow_interval(mut self, interval: Duration) -> Self {
        self.flow_interval = interval;
        self
    }

    pub fn report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    pub fn completion_capacity(mut self, capacity: usize) -> Self {
        self.completion_capacity = capacity;
        self
    }

    pub fn telemetry_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.telemetry_dir = Some(dir.into());
        self
    }

    pub fn tokens(mut self, tokens: FlowTokens) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn max_flows_per_worker(mut self, max_flows: u64) -> Self {
        self.max_flows_per_worker = Some(max_flows);
        self
    }

    pub fn adapter(mut self, adapter: AdapterOptions) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn rpc(mut self, rpc: ReqOptions) -> Self {
        self.rpc = rpc;
        self
    }

    /// Builds the options of every worker, in registry order.
    fn worker_options(&self) -> Result<Vec<WorkerOptions>, CoordinatorError> {
        if self.completion_capacity == 0 {
            return Err(CoordinatorError::ZeroCompletionCapacity);
        }

        let planned = distribution::plan(&self.peers, &self.classes, self.total_flows)?;

        let table = match &self.cdf_path {
            Some(path) => Some(Arc::new(CdfTable::load(path)?)),
            None => None,
        };

        planned
            .into_iter()
            .enumerate()
            .map(|(index, planned)| {
                let size = match (planned.class.size, &table) {
                    (Some(size), _) => FlowSize::Fixed(size),
                    (None, Some(table)) => FlowSize::Sampled(Arc::clone(table)),
                    (None, None) => return Err(CoordinatorError::MissingSize(planned.class.priority)),
                };

                let interval = match &table {
                    Some(table) => {
                        FlowInterval::Poisson(FlowSampler::new(Arc::clone(table), self.load_mbps)?)
                    }
                    None => FlowInterval::Fixed(self.flow_interval),
                };

                let mut options = WorkerOptions::new(planned.peer)
                    .priority(planned.class.priority)
                    .size(size)
                    .interval(interval)
                    .tokens(self.tokens.clone());

                if let Some(dir) = &self.telemetry_dir {
                    options = options.telemetry_path(telemetry_path(dir, index));
                }
                if let Some(max_flows) = self.max_flows_per_worker {
                    options = options.max_flows(max_flows);
                }

                Ok(options)
            })
            .collect()
    }
}

/// A running node: workers, reporting loop and traffic adapter.
#[derive(Debug)]
pub struct Coordinator {
    control_addr: SocketAddr,
    /// The address this node advertises to the Control Server.
    node: SocketAddr,
    control: Arc<Mutex<ControlClient>>,
    registry: Arc<FlowRegistry>,
    completions: Arc<CompletionChannel>,
    workers: JoinSet<Result<(), TransportError>>,
    reporter: Option<JoinHandle<()>>,
    adapter: TrafficAdapter,
    terminated: Arc<AtomicBool>,
    span: tracing::Span,
}

impl Coordinator {
    /// Starts the traffic adapter, probes the Control Server, then spawns the workers
    /// and the reporting loop.
    ///
    /// Configuration is validated before anything is started. If the Control Server
    /// can't be reached, the adapter is stopped again and the error returned.
    pub async fn start<B: QdiscBackend>(
        options: CoordinatorOptions,
        backend: B,
    ) -> Result<Self, CoordinatorError> {
        let span =
            tracing::info_span!(parent: None, "coordinator", control_addr = %options.control_addr);

        let worker_options = options.worker_options()?;

        let mut adapter = TrafficAdapter::start(options.adapter.clone(), backend).await?;
        let node = adapter.advertised_addr();

        let mut control = ControlClient::new(options.control_addr, options.rpc.clone());
        if let Err(e) = control.probe().instrument(span.clone()).await {
            span.in_scope(|| tracing::error!(?e, "control server unreachable"));
            adapter.stop().await;
            return Err(e.into());
        }
        let control = Arc::new(Mutex::new(control));

        let registry = FlowRegistry::new(worker_options.len());
        let completions = Arc::new(CompletionChannel::new(options.completion_capacity));
        let terminated = Arc::new(AtomicBool::new(false));

        let mut workers = JoinSet::new();
        for (index, worker_options) in worker_options.into_iter().enumerate() {
            let Some(slot) = registry.slot(index) else {
                break;
            };

            let worker = FlowWorker::new(slot, Arc::clone(&completions), worker_options);
            workers.spawn(worker.run());
        }

        let reporter = Reporter {
            node,
            control: Arc::clone(&control),
            registry: Arc::clone(&registry),
            completions: Arc::clone(&completions),
            terminated: Arc::clone(&terminated),
            interval: options.report_interval,
        };
        let reporter = tokio::spawn(reporter.run().instrument(span.clone()));

        span.in_scope(|| {
            tracing::info!(%node, workers = workers.len(), "coordinator started");
        });

        Ok(Self {
            control_addr: options.control_addr,
            node,
            control,
            registry,
            completions,
            workers,
            reporter: Some(reporter),
            adapter,
            terminated,
            span,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// The address reported to the Control Server.
    pub fn node_addr(&self) -> SocketAddr {
        self.node
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    pub fn completions(&self) -> &Arc<CompletionChannel> {
        &self.completions
    }

    pub fn adapter(&self) -> &TrafficAdapter {
        &self.adapter
    }

    /// Number of workers that haven't been joined yet.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Waits for the next worker to exit and returns its result. `None` once every
    /// worker has been joined.
    pub async fn join_worker(&mut self) -> Option<Result<(), TransportError>> {
        loop {
            match self.workers.join_next().await? {
                Ok(result) => return Some(result),
                Err(e) => {
                    self.span.in_scope(|| tracing::warn!(?e, "worker task failed"));
                }
            }
        }
    }

    /// Stops the workers and the reporting loop, stops the adapter, then tells the
    /// Control Server this node is gone. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let span = self.span.clone();
        async {
            self.workers.shutdown().await;

            if let Some(reporter) = self.reporter.take() {
                reporter.abort();
                let _ = reporter.await;
            }

            self.adapter.stop().await;

            let request = ControlRequest::UnregisterServer(self.node);
            match self.control.lock().await.request(request).await.map(Reply::decode) {
                Ok(Ok(Reply::Ack)) => tracing::debug!("unregistered from control server"),
                Ok(reply) => tracing::warn!(?reply, "control server refused unregistration"),
                Err(e) => tracing::warn!(?e, "failed to unregister from control server"),
            }

            tracing::info!("coordinator shut down");
        }
        .instrument(span)
        .await
    }
}

/// Connection to the Control Server. Opened on first use and opened again on the next
/// request after the connection failed.
#[derive(Debug)]
struct ControlClient {
    addr: SocketAddr,
    options: ReqOptions,
    socket: Option<ReqSocket>,
}

impl ControlClient {
    fn new(addr: SocketAddr, options: ReqOptions) -> Self {
        Self { addr, options, socket: None }
    }

    /// Connects and checks that the Control Server answers.
    async fn probe(&mut self) -> Result<(), ReqError> {
        self.request(ControlRequest::TestConnection).await?;
        tracing::debug!("control server reachable");

        Ok(())
    }

    async fn request(&mut self, request: ControlRequest) -> Result<Bytes, ReqError> {
        let socket = match &self.socket {
            Some(socket) => socket.clone(),
            None => {
                let socket = ReqSocket::connect_with(self.addr, self.options.clone()).await?;
                tracing::debug!(addr = %self.addr, "connected to control server");
                self.socket = Some(socket.clone());
                socket
            }
        };

        let result = socket.request(request.encode()).await;

        // A timed out request leaves the connection usable, anything else doesn't.
        if let Err(e) = &result {
            if !matches!(e, ReqError::Timeout) {
                self.socket = None;
            }
        }

        result
    }
}

/// The periodic reporting loop.
struct Reporter {
    node: SocketAddr,
    control: Arc<Mutex<ControlClient>>,
    registry: Arc<FlowRegistry>,
    completions: Arc<CompletionChannel>,
    terminated: Arc<AtomicBool>,
    interval: Duration,
}

impl Reporter {
    async fn run(self) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);

        loop {
            interval.tick().await;
            if self.terminated.load(Ordering::SeqCst) {
                break;
            }

            self.report().await;
        }
    }

    /// Sends one report. Failures are logged and the report discarded. A lost connection
    /// is opened again on the next report.
    async fn report(&self) {
        let report = FlowReport {
            node: self.node,
            waiting: self.registry.snapshot(),
            completed: self.completions.drain(),
        };

        if report.is_empty() {
            return;
        }

        let (waiting, completed) = (report.waiting.len(), report.completed.len());
        let request = ControlRequest::PassFlowInfo(report);

        match self.control.lock().await.request(request).await.map(Reply::decode) {
            Ok(Ok(Reply::Ack)) => tracing::debug!(waiting, completed, "reported flows"),
            Ok(reply) => tracing::warn!(?reply, "control server did not accept report"),
            Err(e) => tracing::warn!(?e, waiting, completed, "failed to report flows"),
        }
    }
}
