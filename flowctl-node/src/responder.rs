//! The passive side of the flow protocol: accepts flows from peers and acknowledges each
//! one on the connection it arrived on.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use flowctl_wire::flow::FlowTokens;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::{JoinHandle, JoinSet},
};
use tracing::Instrument;

const DEFAULT_READ_CHUNK: usize = 2048;

#[derive(Debug, Clone)]
pub struct ResponderOptions {
    pub tokens: FlowTokens,
    /// How many bytes a handler reads at a time.
    pub read_chunk: usize,
}

impl Default for ResponderOptions {
    fn default() -> Self {
        Self { tokens: FlowTokens::default(), read_chunk: DEFAULT_READ_CHUNK }
    }
}

impl ResponderOptions {
    pub fn tokens(mut self, tokens: FlowTokens) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn read_chunk(mut self, read_chunk: usize) -> Self {
        self.read_chunk = read_chunk.max(1);
        self
    }
}

/// Statistics for a responder, shared with its tasks.
#[derive(Debug, Default)]
pub struct ResponderStats {
    /// Total connections accepted
    connections: AtomicUsize,
    /// Currently open connections
    active: AtomicUsize,
    /// Total flows acknowledged
    flows_acked: AtomicUsize,
    /// Total bytes received
    bytes_rx: AtomicUsize,
}

impl ResponderStats {
    #[inline]
    fn increment_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn decrement_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_flows_acked(&self) {
        self.flows_acked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn increment_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn flows_acked(&self) -> usize {
        self.flows_acked.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_rx(&self) -> usize {
        self.bytes_rx.load(Ordering::Relaxed)
    }
}

/// Decrements the active connection count when a handler ends, however it ends.
struct ActiveGuard(Arc<ResponderStats>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.decrement_active();
    }
}

/// A running responder. Dropping it shuts it down.
#[derive(Debug)]
pub struct Responder {
    local_addr: SocketAddr,
    stats: Arc<ResponderStats>,
    task: Option<JoinHandle<()>>,
}

impl Responder {
    /// Binds a listener and starts accepting flows.
    pub async fn bind(addr: impl ToSocketAddrs, options: ResponderOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let stats = Arc::new(ResponderStats::default());

        let span = tracing::info_span!(parent: None, "responder", %local_addr);
        span.in_scope(|| tracing::debug!("listening"));

        let task = tokio::spawn(
            accept_loop(listener, Arc::new(options), Arc::clone(&stats)).instrument(span),
        );

        Ok(Self { local_addr, stats, task: Some(task) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ResponderStats {
        &self.stats
    }

    /// Stops accepting and terminates every connection handler. Idempotent.
    pub async fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            // Dropping the accept loop drops its handler set, which aborts the handlers.
            let _ = task.await;
            tracing::debug!(local_addr = %self.local_addr, "responder shut down");
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Wait between retries of a failing `accept`, so persistent errors such as `EMFILE`
/// don't spin the loop. Doubles on every failure, up to a second.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    const INITIAL: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    fn new() -> Self {
        Self { next: Self::INITIAL }
    }

    /// Returns the wait for this failure.
    fn failed(&mut self) -> Duration {
        let wait = self.next;
        self.next = (self.next * 2).min(Self::MAX);
        wait
    }

    fn reset(&mut self) {
        self.next = Self::INITIAL;
    }
}

async fn accept_loop(
    listener: TcpListener,
    options: Arc<ResponderOptions>,
    stats: Arc<ResponderStats>,
) {
    let mut handlers = JoinSet::new();
    let mut backoff = AcceptBackoff::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    backoff.reset();
                    tracing::debug!(%peer, "accepted flow connection");
                    stats.increment_connections();

                    let guard = ActiveGuard(Arc::clone(&stats));
                    let options = Arc::clone(&options);
                    let stats = Arc::clone(&stats);
                    handlers.spawn(
                        async move {
                            let _guard = guard;
                            if let Err(e) = handle_connection(stream, &options, &stats).await {
                                tracing::debug!(?e, "flow connection failed");
                            }
                        }
                        .instrument(tracing::debug_span!("flow_handler", %peer)),
                    );
                }
                Err(e) => {
                    let wait = backoff.failed();
                    tracing::warn!(?e, ?wait, "failed to accept connection");
                    tokio::time::sleep(wait).await;
                }
            },
            // Reap finished handlers so the set doesn't grow unbounded.
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }
}

/// Acknowledges every flow arriving on `stream` until the peer closes it.
async fn handle_connection(
    mut stream: TcpStream,
    options: &ResponderOptions,
    stats: &ResponderStats,
) -> io::Result<()> {
    let mut matcher = options.tokens.terminator_matcher();
    let mut buf = vec![0u8; options.read_chunk];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            tracing::debug!("peer closed the connection");
            return Ok(());
        }

        stats.increment_rx(n);

        if matcher.feed(&buf[..n]) {
            stats.increment_flows_acked();
            matcher.reset();
            stream.write_all(options.tokens.ack()).await?;
        }
    }
}
