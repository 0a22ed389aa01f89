use std::{
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::Stream;
use tokio::{
    net::{lookup_host, TcpListener, ToSocketAddrs},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_stream::StreamMap;
use tracing::{debug, warn};

use crate::{
    rep::{driver::RepDriver, RepError, SocketState},
    RepOptions, RepStats, Request, DEFAULT_QUEUE_SIZE,
};

/// A reply socket. This socket implements [`Stream`] and yields incoming [`Request`]s.
#[derive(Debug)]
pub struct RepSocket {
    /// The reply socket options, shared with the driver.
    options: Arc<RepOptions>,
    /// The reply socket state, shared with the driver.
    state: Arc<SocketState>,
    /// Receiver from the socket driver.
    from_driver: Option<mpsc::Receiver<Request>>,
    /// The local address this socket is bound to.
    local_addr: Option<SocketAddr>,
    /// Internal task representing a running [`RepDriver`].
    driver_task: Option<JoinHandle<Result<(), RepError>>>,
}

impl Default for RepSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl RepSocket {
    /// Creates a new reply socket with the default [`RepOptions`].
    pub fn new() -> Self {
        Self::with_options(RepOptions::default())
    }

    /// Creates a new reply socket with the given options.
    pub fn with_options(options: RepOptions) -> Self {
        Self {
            options: Arc::new(options),
            state: Arc::new(SocketState::default()),
            from_driver: None,
            local_addr: None,
            driver_task: None,
        }
    }

    /// Binds the socket to the first of the given addresses that accepts the bind. This
    /// spawns the socket driver task.
    pub async fn bind(&mut self, addr: impl ToSocketAddrs) -> Result<(), RepError> {
        let mut listener = None;

        for addr in lookup_host(addr).await? {
            match TcpListener::bind(addr).await {
                Ok(l) => {
                    listener = Some(l);
                    break;
                }
                Err(e) => {
                    warn!(?e, %addr, "failed to bind");
                }
            }
        }

        let listener = listener.ok_or(RepError::NoValidEndpoints)?;
        let local_addr = listener.local_addr()?;

        let (to_socket, from_driver) = mpsc::channel(DEFAULT_QUEUE_SIZE);

        let span = tracing::info_span!(parent: None, "rep_driver", ?local_addr);
        span.in_scope(|| debug!("listening"));

        let driver = RepDriver {
            listener,
            state: Arc::clone(&self.state),
            options: Arc::clone(&self.options),
            peer_states: StreamMap::with_capacity(self.options.max_clients.unwrap_or(64)),
            to_socket,
            span,
        };

        self.driver_task = Some(tokio::spawn(driver));
        self.local_addr = Some(local_addr);
        self.from_driver = Some(from_driver);

        Ok(())
    }

    /// Returns the statistics for this socket.
    pub fn stats(&self) -> &RepStats {
        &self.state.stats
    }

    /// Returns the local address this socket is bound to. `None` if the socket is not bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the next request from the socket using an unpinned interface.
    pub fn poll_next_unpin(&mut self, cx: &mut Context<'_>) -> Poll<Option<Request>> {
        Pin::new(self).poll_next(cx)
    }

    /// Stops accepting connections and closes every connection the socket holds.
    /// Requests that were already yielded can still be responded to, but the response
    /// will never reach the peer.
    pub fn close(&mut self) {
        if let Some(task) = self.driver_task.take() {
            task.abort();
        }

        if let Some(rx) = self.from_driver.as_mut() {
            rx.close();
        }
    }
}

impl Drop for RepSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl Stream for RepSocket {
    type Item = Request;

    /// Yields the next request. Ends once the socket is closed, or immediately if it was
    /// never bound.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().from_driver.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}
