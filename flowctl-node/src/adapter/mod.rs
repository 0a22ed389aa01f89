//! The Traffic Adapter: a node-local RPC endpoint that turns the Control Server's actions
//! into kernel queueing configuration.
//!
//! Incoming actions go through two throttles before they reach the kernel. The listener
//! forwards only every K-th request it receives, and it forwards into a single-slot
//! mailbox that drops the action if the consumer hasn't picked up the previous one yet.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use flowctl_common::{
    constants::{DEFAULT_ADAPTER_PORT, MBIT},
    mailbox::{mailbox, MailboxSender},
};
use flowctl_rpc::{RepError, RepSocket};
use flowctl_tc::{handle::BAND_COUNT, requests::BucketConfig, KernelError};
use flowctl_wire::rpc::{Action, AdapterRequest, Reply};
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::Instrument;

mod consumer;
mod dryrun;
mod netlink;

use consumer::Consumer;
pub use dryrun::{DryRunBackend, DryRunLog, Reconfiguration};
pub use netlink::NetlinkBackend;

/// Default number of received actions per kernel reconfiguration.
pub const DEFAULT_THROTTLE: usize = 10;
/// Default number of consecutive transient kernel errors tolerated.
pub const DEFAULT_MAX_TRANSIENT_ERRORS: usize = 3;
/// Default baseline rate of every band, in bits per second.
pub const DEFAULT_BAND_RATE: u64 = 1_000 * MBIT;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("No local interface carries any of {0:?}")]
    NoMatchingInterface(Vec<IpAddr>),
    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("RPC error: {0}")]
    Rpc(#[from] RepError),
}

/// The kernel side of the adapter.
#[async_trait]
pub trait QdiscBackend: Send + 'static {
    /// Returns the indexes of the local interfaces carrying any of `addresses`.
    async fn matching_interfaces(&mut self, addresses: &[IpAddr]) -> Result<Vec<u32>, KernelError>;

    /// Replaces the interface's root qdisc with the baseline band hierarchy.
    async fn install_baseline(
        &mut self,
        if_index: u32,
        band_rates: &[u64; BAND_COUNT as usize],
        bucket: BucketConfig,
    ) -> Result<(), KernelError>;

    /// Changes the rate limit of one band.
    async fn set_band_rate(
        &mut self,
        if_index: u32,
        band: u8,
        rate_bps: u64,
        bucket: BucketConfig,
    ) -> Result<(), KernelError>;

    /// Releases any kernel-control handles.
    async fn close(&mut self) {}
}

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Address the RPC listener binds to.
    pub listen: SocketAddr,
    /// Address reported to the Control Server. Defaults to the bound address.
    pub advertised: Option<SocketAddr>,
    /// Local addresses whose interfaces get configured.
    pub addresses: Vec<IpAddr>,
    /// Baseline rate of every band, in bits per second.
    pub band_rates: [u64; BAND_COUNT as usize],
    /// Apply only every K-th received action.
    pub throttle: usize,
    pub bucket: BucketConfig,
    /// Consecutive transient kernel errors after which the adapter gives up.
    pub max_transient_errors: usize,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_ADAPTER_PORT),
            advertised: None,
            addresses: Vec::new(),
            band_rates: [DEFAULT_BAND_RATE; BAND_COUNT as usize],
            throttle: DEFAULT_THROTTLE,
            bucket: BucketConfig::default(),
            max_transient_errors: DEFAULT_MAX_TRANSIENT_ERRORS,
        }
    }
}

impl AdapterOptions {
    pub fn listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn advertised(mut self, advertised: SocketAddr) -> Self {
        self.advertised = Some(advertised);
        self
    }

    pub fn addresses(mut self, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        self.addresses = addresses.into_iter().collect();
        self
    }

    pub fn band_rates(mut self, band_rates: [u64; BAND_COUNT as usize]) -> Self {
        self.band_rates = band_rates;
        self
    }

    /// Sets the throttle window. Values below 1 are treated as 1.
    pub fn throttle(mut self, throttle: usize) -> Self {
        self.throttle = throttle.max(1);
        self
    }

    pub fn bucket(mut self, bucket: BucketConfig) -> Self {
        self.bucket = bucket;
        self
    }

    pub fn max_transient_errors(mut self, max: usize) -> Self {
        self.max_transient_errors = max;
        self
    }
}

/// Statistics for a traffic adapter, shared with its tasks.
#[derive(Debug, Default)]
pub struct AdapterStats {
    /// Total actions received over RPC
    received: AtomicUsize,
    /// Actions placed in the mailbox
    forwarded: AtomicUsize,
    /// Actions dropped because the mailbox was occupied
    dropped: AtomicUsize,
    /// Requests that failed to decode
    rejected: AtomicUsize,
    /// Actions applied to the kernel
    applied: AtomicUsize,
}

impl AdapterStats {
    #[inline]
    pub(crate) fn increment_received(&self) -> usize {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub(crate) fn increment_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::Relaxed)
    }
}

/// A running traffic adapter.
#[derive(Debug)]
pub struct TrafficAdapter {
    local_addr: SocketAddr,
    advertised: SocketAddr,
    stats: Arc<AdapterStats>,
    to_consumer: MailboxSender<Action>,
    consumer: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

impl TrafficAdapter {
    /// Installs the baseline policy on every interface carrying one of the configured
    /// addresses, then starts the RPC listener and the mailbox consumer.
    ///
    /// Fails with [`AdapterError::NoMatchingInterface`] if no interface matches.
    pub async fn start<B: QdiscBackend>(
        options: AdapterOptions,
        mut backend: B,
    ) -> Result<Self, AdapterError> {
        let span = tracing::info_span!(parent: None, "traffic_adapter", listen = %options.listen);

        let interfaces =
            backend.matching_interfaces(&options.addresses).instrument(span.clone()).await?;
        if interfaces.is_empty() {
            backend.close().await;
            return Err(AdapterError::NoMatchingInterface(options.addresses));
        }

        for if_index in interfaces.iter().copied() {
            let installed = backend
                .install_baseline(if_index, &options.band_rates, options.bucket)
                .instrument(span.clone())
                .await;

            if let Err(e) = installed {
                span.in_scope(|| tracing::error!(?e, if_index, "failed to install baseline"));
                backend.close().await;
                return Err(e.into());
            }
        }

        let mut socket = RepSocket::new();
        if let Err(e) = socket.bind(options.listen).await {
            backend.close().await;
            return Err(e.into());
        }

        let local_addr = socket.local_addr().ok_or(RepError::SocketClosed)?;
        let advertised = options.advertised.unwrap_or(local_addr);
        span.in_scope(|| tracing::info!(%local_addr, ?interfaces, "traffic adapter started"));

        let stats = Arc::new(AdapterStats::default());
        let (to_consumer, from_listener) = mailbox();

        let listener = tokio::spawn(
            listen(socket, to_consumer.clone(), options.throttle, Arc::clone(&stats))
                .instrument(span.clone()),
        );

        let consumer = Consumer {
            backend,
            interfaces,
            bucket: options.bucket,
            max_transient_errors: options.max_transient_errors,
            transient_errors: 0,
            from_listener,
            listener: listener.abort_handle(),
            stats: Arc::clone(&stats),
        };
        let consumer = tokio::spawn(consumer.run().instrument(span));

        Ok(Self {
            local_addr,
            advertised,
            stats,
            to_consumer,
            consumer: Some(consumer),
            listener: Some(listener),
        })
    }

    /// The address the RPC listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The address the Control Server should push actions to.
    pub fn advertised_addr(&self) -> SocketAddr {
        self.advertised
    }

    pub fn stats(&self) -> &AdapterStats {
        &self.stats
    }

    /// Returns `true` while the consumer is still applying actions.
    pub fn is_running(&self) -> bool {
        self.consumer.as_ref().is_some_and(|c| !c.is_finished())
    }

    /// Stops the consumer, closes the listener and releases the kernel handles.
    /// Idempotent.
    pub async fn stop(&mut self) {
        let Some(consumer) = self.consumer.take() else {
            return;
        };

        self.to_consumer.stop().await;
        if let Err(e) = consumer.await {
            tracing::warn!(?e, "adapter consumer panicked");
        }

        if let Some(listener) = self.listener.take() {
            listener.abort();
            let _ = listener.await;
        }

        tracing::debug!(local_addr = %self.local_addr, "traffic adapter stopped");
    }
}

impl Drop for TrafficAdapter {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let Some(consumer) = self.consumer.take() {
            consumer.abort();
        }
    }
}

/// Answers every request with a fixed acknowledgement, forwarding every `throttle`-th
/// action to the consumer.
async fn listen(
    mut socket: RepSocket,
    to_consumer: MailboxSender<Action>,
    throttle: usize,
    stats: Arc<AdapterStats>,
) {
    while let Some(mut request) = socket.next().await {
        let reply = match AdapterRequest::decode(request.take_msg()) {
            Ok(AdapterRequest::UpdateFlowParameters(action)) => {
                let received = stats.increment_received();
                tracing::debug!(?action, received, "received action");

                if received % throttle == 0 {
                    if to_consumer.offer(action) {
                        stats.increment_forwarded();
                    } else {
                        stats.increment_dropped();
                        tracing::debug!(?action, "consumer busy, dropping action");
                    }
                }

                Reply::Ack
            }
            Err(e) => {
                stats.increment_rejected();
                tracing::warn!(?e, source = %request.source(), "malformed adapter request");
                Reply::Rejected
            }
        };

        if let Err(e) = request.respond(reply.encode()) {
            tracing::debug!(?e, "failed to respond");
        }
    }
}
