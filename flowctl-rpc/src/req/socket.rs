use bytes::Bytes;
use flowctl_wire::reqrep;
use rustc_hash::FxHashMap;
use std::{collections::VecDeque, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpStream, ToSocketAddrs},
    sync::{mpsc, oneshot},
    time::MissedTickBehavior,
};
use tokio_util::codec::Framed;

use super::{Command, ReqDriver, ReqError, ReqOptions, SocketState};
use crate::{ReqStats, DEFAULT_QUEUE_SIZE};

/// Lower bound on how often the driver checks for expired requests.
const MIN_TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// A request socket. Sends requests over a single connection and matches the replies
/// back to their callers. Clones share the connection.
#[derive(Debug, Clone)]
pub struct ReqSocket {
    /// Command channel to the backend task.
    to_driver: Option<mpsc::Sender<Command>>,
    /// Options for the socket. These are shared with the backend task.
    options: Arc<ReqOptions>,
    /// Socket state. This is shared with the backend task.
    state: Arc<SocketState>,
    /// The address of the connected peer.
    peer_addr: Option<SocketAddr>,
}

impl Default for ReqSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqSocket {
    pub fn new() -> Self {
        Self::with_options(ReqOptions::default())
    }

    pub fn with_options(options: ReqOptions) -> Self {
        Self {
            to_driver: None,
            options: Arc::new(options),
            state: Arc::new(SocketState::default()),
            peer_addr: None,
        }
    }

    pub fn stats(&self) -> &ReqStats {
        &self.state.stats
    }

    /// Returns the address of the connected peer. `None` if the socket is not connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Sends a request and waits for its reply.
    ///
    /// Fails with [`ReqError::Timeout`] if no reply arrives within the configured timeout,
    /// and with [`ReqError::SocketClosed`] if the socket is not connected or the connection
    /// went away.
    pub async fn request(&self, message: Bytes) -> Result<Bytes, ReqError> {
        let (response_tx, response_rx) = oneshot::channel();

        self.to_driver
            .as_ref()
            .ok_or(ReqError::SocketClosed)?
            .send(Command::Send { message, response: response_tx })
            .await
            .map_err(|_| ReqError::SocketClosed)?;

        response_rx.await.map_err(|_| ReqError::SocketClosed)?
    }

    /// Connects to the given endpoint and spawns the socket driver.
    pub async fn connect(&mut self, endpoint: impl ToSocketAddrs) -> Result<(), ReqError> {
        let stream = tokio::time::timeout(self.options.connect_timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| ReqError::ConnectTimeout)??;

        if self.options.set_nodelay {
            stream.set_nodelay(true)?;
        }

        let peer_addr = stream.peer_addr()?;
        tracing::debug!(%peer_addr, "connected");

        let (to_driver, from_socket) = mpsc::channel(DEFAULT_QUEUE_SIZE);

        let mut timeout_check_interval = tokio::time::interval(
            (self.options.timeout / 10).max(MIN_TIMEOUT_CHECK_INTERVAL),
        );
        timeout_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let driver = ReqDriver {
            options: Arc::clone(&self.options),
            socket_state: Arc::clone(&self.state),
            id_counter: 0,
            from_socket,
            conn: Framed::new(stream, reqrep::Codec::new()),
            egress_queue: VecDeque::with_capacity(16),
            pending_requests: FxHashMap::default(),
            timeout_check_interval,
            span: tracing::info_span!(parent: None, "req_driver", %peer_addr),
        };

        tokio::spawn(driver);

        self.to_driver = Some(to_driver);
        self.peer_addr = Some(peer_addr);

        Ok(())
    }

    /// Connects to the given endpoint with the given options. Shorthand for
    /// [`ReqSocket::with_options`] followed by [`ReqSocket::connect`].
    pub async fn connect_with(
        endpoint: impl ToSocketAddrs,
        options: ReqOptions,
    ) -> Result<Self, ReqError> {
        let mut socket = Self::with_options(options);
        socket.connect(endpoint).await?;

        Ok(socket)
    }
}
