//! The flow worker: a persistent connection to one peer that carries one synthetic flow
//! after another.

use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use flowctl_common::constants::KiB;
use flowctl_wire::{
    flow::{FlowTokens, TailMatcher, FILLER_BYTE},
    rpc::{CompletedFlow, FlowAttributes, PROTOCOL_TCP},
};
use nix::sys::socket::{setsockopt, sockopt};
use rand::{rngs::SmallRng, SeedableRng};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
    time::Instant,
};
use tracing::Instrument;

use crate::{
    completion::CompletionChannel,
    registry::FlowSlot,
    sampler::{CdfTable, FlowSampler},
    telemetry::FlowTelemetry,
};

/// Size of the filler chunks written per send call.
const DEFAULT_WRITE_CHUNK: usize = 64 * KiB as usize;

/// Size of the buffer the acknowledgement is read into.
const ACK_READ_SIZE: usize = KiB as usize;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect: {0:?}")]
    Connect(io::Error),
    #[error("Failed to set socket option: {0}")]
    SocketOption(#[from] nix::Error),
    #[error("Send call wrote zero bytes")]
    ZeroLengthWrite,
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
}

/// How big each flow is.
#[derive(Debug, Clone)]
pub enum FlowSize {
    /// Every flow carries the same number of bytes.
    Fixed(u64),
    /// Sizes are drawn from an empirical distribution.
    Sampled(Arc<CdfTable>),
}

/// How long a worker idles between two flows.
#[derive(Debug, Clone)]
pub enum FlowInterval {
    Fixed(Duration),
    /// Exponentially distributed intervals, so flows arrive as a Poisson process.
    Poisson(FlowSampler),
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// The responder this worker sends flows to.
    pub peer: SocketAddr,
    /// `SO_PRIORITY` of the connection.
    pub priority: u32,
    /// `IP_TOS` (or IPv6 traffic class) of the connection.
    pub tos: Option<u8>,
    pub size: FlowSize,
    pub interval: FlowInterval,
    pub tokens: FlowTokens,
    /// Where to log completed flows, if anywhere.
    pub telemetry_path: Option<PathBuf>,
    /// Stop after this many flows. Runs until stopped if `None`.
    pub max_flows: Option<u64>,
    pub write_chunk: usize,
}

impl WorkerOptions {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            priority: 0,
            tos: None,
            size: FlowSize::Fixed(1_500),
            interval: FlowInterval::Fixed(Duration::ZERO),
            tokens: FlowTokens::default(),
            telemetry_path: None,
            max_flows: None,
            write_chunk: DEFAULT_WRITE_CHUNK,
        }
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = Some(tos);
        self
    }

    pub fn size(mut self, size: FlowSize) -> Self {
        self.size = size;
        self
    }

    pub fn interval(mut self, interval: FlowInterval) -> Self {
        self.interval = interval;
        self
    }

    pub fn tokens(mut self, tokens: FlowTokens) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn telemetry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.telemetry_path = Some(path.into());
        self
    }

    pub fn max_flows(mut self, max_flows: u64) -> Self {
        self.max_flows = Some(max_flows);
        self
    }
}

/// A worker's connection. Closing it is idempotent.
#[derive(Debug)]
pub struct FlowConnection {
    stream: Option<TcpStream>,
    /// The connection's 5-tuple and priority.
    attributes: FlowAttributes,
}

impl FlowConnection {
    /// Opens a connection to `options.peer`, tagging the socket with the configured
    /// priority and TOS before connecting.
    pub async fn open(options: &WorkerOptions) -> Result<Self, TransportError> {
        let socket =
            if options.peer.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };

        setsockopt(&socket, sockopt::Priority, &(options.priority as i32))?;
        if let Some(tos) = options.tos {
            if options.peer.is_ipv4() {
                setsockopt(&socket, sockopt::IpTos, &(tos as i32))?;
            } else {
                setsockopt(&socket, sockopt::Ipv6TClass, &(tos as i32))?;
            }
        }

        let stream = socket.connect(options.peer).await.map_err(TransportError::Connect)?;
        stream.set_nodelay(true)?;

        let attributes = FlowAttributes {
            src: stream.local_addr()?,
            dst: stream.peer_addr()?,
            protocol: PROTOCOL_TCP,
            priority: options.priority,
        };

        Ok(Self { stream: Some(stream), attributes })
    }

    pub fn attributes(&self) -> FlowAttributes {
        self.attributes
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::ConnectionClosed)
    }

    /// Writes all of `buf`, failing on a send call that makes no progress.
    async fn send(&mut self, mut buf: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream()?;

        while !buf.is_empty() {
            match stream.write(buf).await? {
                0 => return Err(TransportError::ZeroLengthWrite),
                n => buf = &buf[n..],
            }
        }

        Ok(())
    }

    /// Streams `size` filler bytes, then the terminator.
    async fn send_flow(
        &mut self,
        filler: &Bytes,
        size: u64,
        terminator: &[u8],
    ) -> Result<(), TransportError> {
        let mut remaining = size;

        while remaining > 0 {
            let n = remaining.min(filler.len() as u64) as usize;
            self.send(&filler[..n]).await?;
            remaining -= n as u64;
        }

        self.send(terminator).await
    }

    /// Reads until the inbound stream ends with the acknowledgement.
    async fn await_ack(&mut self, matcher: &mut TailMatcher) -> Result<(), TransportError> {
        let stream = self.stream()?;
        let mut buf = [0u8; ACK_READ_SIZE];

        matcher.reset();
        loop {
            match stream.read(&mut buf).await? {
                0 => return Err(TransportError::ConnectionClosed),
                n if matcher.feed(&buf[..n]) => return Ok(()),
                _ => {}
            }
        }
    }

    /// Shuts down and drops the connection. Errors are ignored, so closing an already
    /// broken or closed connection is harmless.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

/// Generates flows toward one peer over one persistent connection.
#[derive(Debug)]
pub struct FlowWorker {
    slot: FlowSlot,
    completions: Arc<CompletionChannel>,
    options: WorkerOptions,
    telemetry: Option<FlowTelemetry>,
    rng: SmallRng,
    filler: Bytes,
}

impl FlowWorker {
    pub fn new(slot: FlowSlot, completions: Arc<CompletionChannel>, options: WorkerOptions) -> Self {
        let telemetry = options.telemetry_path.clone().map(FlowTelemetry::new);
        let filler = Bytes::from(vec![FILLER_BYTE; options.write_chunk.max(1)]);

        Self { slot, completions, options, telemetry, rng: SmallRng::from_entropy(), filler }
    }

    /// Connects and generates flows until `max_flows` is reached or the connection fails.
    ///
    /// A transport failure is never retried: the connection is closed and the error
    /// returned. The registry slot is left invalid either way.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let span = tracing::info_span!(
            "flow_worker",
            index = self.slot.index(),
            peer = %self.options.peer,
            priority = self.options.priority
        );

        async move {
            let mut conn = FlowConnection::open(&self.options).await.inspect_err(|e| {
                tracing::warn!(?e, "failed to open flow connection");
            })?;
            tracing::debug!(src = %conn.attributes().src, "connected");

            let result = self.flow_loop(&mut conn).await;

            self.slot.set_valid(false);
            conn.close().await;

            match &result {
                Ok(()) => tracing::debug!("worker finished"),
                Err(e) => tracing::warn!(?e, "worker terminated"),
            }

            result
        }
        .instrument(span)
        .await
    }

    async fn flow_loop(&mut self, conn: &mut FlowConnection) -> Result<(), TransportError> {
        let attributes = conn.attributes();
        let tokens = self.options.tokens.clone();
        let mut ack_matcher = tokens.ack_matcher();
        let mut flows = 0u64;

        while self.options.max_flows.map_or(true, |max| flows < max) {
            let size = self.next_size();

            self.slot.begin(attributes);
            let start = Instant::now();

            conn.send_flow(&self.filler, size, tokens.terminator()).await?;
            conn.await_ack(&mut ack_matcher).await?;

            // Rounded up, so a completed flow never reports zero.
            let fct_us = start.elapsed().as_nanos().div_ceil(1_000) as u64;

            self.slot.set_valid(false);
            self.completions.push(CompletedFlow {
                attributes,
                completion_time_us: fct_us,
                size_bytes: size,
            });
            tracing::trace!(size, fct_us, "flow completed");

            if let Some(telemetry) = self.telemetry.as_mut() {
                telemetry.record(size, fct_us).await;
            }

            flows += 1;

            let interval = self.next_interval();
            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }

        Ok(())
    }

    fn next_size(&mut self) -> u64 {
        match &self.options.size {
            FlowSize::Fixed(size) => *size,
            FlowSize::Sampled(table) => table.sample_size(&mut self.rng),
        }
    }

    fn next_interval(&mut self) -> Duration {
        match &mut self.options.interval {
            FlowInterval::Fixed(interval) => *interval,
            FlowInterval::Poisson(sampler) => sampler.sample_interval(&mut self.rng),
        }
    }
}
