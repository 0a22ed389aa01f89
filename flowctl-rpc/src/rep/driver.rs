use bytes::Bytes;
use futures::{stream::FuturesUnordered, Future, FutureExt, SinkExt, Stream, StreamExt};
use std::{
    collections::VecDeque,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tokio_stream::{StreamMap, StreamNotifyClose};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::{rep::SocketState, RepError, RepOptions, Request};
use flowctl_wire::reqrep;

/// The per-connection state of a reply socket. Yields the requests read from the
/// connection and writes back the responses in whatever order they complete.
pub(crate) struct PeerState {
    pending_requests: FuturesUnordered<PendingRequest>,
    conn: Framed<TcpStream, reqrep::Codec>,
    addr: SocketAddr,
    egress_queue: VecDeque<reqrep::Message>,
    state: Arc<SocketState>,
    should_flush: bool,
}

/// The reply socket driver. Accepts connections and multiplexes their requests onto
/// the socket front-end.
pub(crate) struct RepDriver {
    /// The listener used to accept incoming connections.
    pub(crate) listener: TcpListener,
    /// The reply socket state, shared with the socket front-end.
    pub(crate) state: Arc<SocketState>,
    /// Options shared with socket.
    pub(crate) options: Arc<RepOptions>,
    /// [`StreamMap`] of connected peers. The key is the peer's address.
    pub(crate) peer_states: StreamMap<SocketAddr, StreamNotifyClose<PeerState>>,
    /// Sender to the socket front-end. Used to notify the socket of incoming requests.
    pub(crate) to_socket: mpsc::Sender<Request>,
    /// The span of the driver, entered on every poll.
    pub(crate) span: tracing::Span,
}

impl Future for RepDriver {
    type Output = Result<(), RepError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _enter = this.span.clone().entered();

        loop {
            if let Poll::Ready(Some((peer, msg))) = this.peer_states.poll_next_unpin(cx) {
                match msg {
                    Some(Ok(request)) => {
                        debug!(%peer, "received request");
                        this.state.stats.increment_rx(request.msg().len());

                        if let Err(e) = this.to_socket.try_send(request) {
                            // Dropping the request drops its response channel, which the
                            // peer observes as a request that is never answered.
                            warn!(%peer, "socket queue full or closed, dropping request: {e}");
                            this.state.stats.increment_failed_requests();
                        }
                    }
                    Some(Err(e)) => {
                        error!(%peer, ?e, "error receiving message");
                    }
                    None => {
                        debug!(%peer, "peer disconnected");
                        this.state.stats.decrement_active_clients();
                    }
                }

                continue;
            }

            if this.to_socket.is_closed() {
                debug!("socket dropped, shutting down driver");
                return Poll::Ready(Ok(()));
            }

            // Finally, poll the listener for new incoming connections.
            if let Poll::Ready(accept) = this.listener.poll_accept(cx) {
                match accept {
                    Ok((stream, addr)) => this.on_incoming(stream, addr),
                    Err(e) => {
                        error!(?e, "error accepting incoming connection");
                    }
                }

                continue;
            }

            return Poll::Pending;
        }
    }
}

impl RepDriver {
    fn on_incoming(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Some(max) = self.options.max_clients {
            if self.state.stats.active_clients() >= max {
                warn!(%addr, max, "max connections reached, rejecting new incoming connection");
                self.state.stats.increment_rejected_clients();
                return;
            }
        }

        if let Err(e) = stream.set_nodelay(true) {
            warn!(%addr, ?e, "failed to set TCP_NODELAY");
        }

        info!(%addr, "new connection");
        self.state.stats.increment_active_clients();

        self.peer_states.insert(
            addr,
            StreamNotifyClose::new(PeerState {
                pending_requests: FuturesUnordered::new(),
                conn: Framed::new(stream, reqrep::Codec::new()),
                addr,
                egress_queue: VecDeque::with_capacity(16),
                state: Arc::clone(&self.state),
                should_flush: false,
            }),
        );
    }
}

impl Stream for PeerState {
    type Item = Result<Request, RepError>;

    /// Advances the state of the peer.
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            // Flush any messages on the outgoing buffer
            if this.should_flush {
                if let Poll::Ready(Ok(_)) = this.conn.poll_flush_unpin(cx) {
                    this.should_flush = false;
                }
            }

            // Then, try to drain the egress queue.
            if this.conn.poll_ready_unpin(cx).is_ready() {
                if let Some(msg) = this.egress_queue.pop_front() {
                    let msg_len = msg.size();
                    match this.conn.start_send_unpin(msg) {
                        Ok(_) => {
                            this.state.stats.increment_tx(msg_len);
                            this.should_flush = true;

                            continue;
                        }
                        Err(e) => {
                            this.state.stats.increment_failed_requests();
                            error!(peer = %this.addr, ?e, "failed to send response");
                            // End this stream as we can't send any more messages
                            return Poll::Ready(None);
                        }
                    }
                }
            }

            // Then we check for completed requests, and push them onto the egress queue.
            if let Poll::Ready(Some(completed)) = this.pending_requests.poll_next_unpin(cx) {
                match completed {
                    Some((id, payload)) => {
                        this.egress_queue.push_back(reqrep::Message::new(id, payload));
                    }
                    None => this.state.stats.increment_failed_requests(),
                }

                continue;
            }

            // Finally we accept incoming requests from the peer.
            match this.conn.poll_next_unpin(cx) {
                Poll::Ready(Some(result)) => {
                    let msg = result?;
                    let msg_id = msg.id();

                    let (tx, rx) = oneshot::channel();

                    this.pending_requests.push(PendingRequest { msg_id, response: rx });

                    let request =
                        Request { source: this.addr, response: tx, msg: msg.into_payload() };

                    return Poll::Ready(Some(Ok(request)));
                }
                Poll::Ready(None) => {
                    debug!(peer = %this.addr, "connection closed");
                    return Poll::Ready(None);
                }
                Poll::Pending => {}
            }

            return Poll::Pending;
        }
    }
}

struct PendingRequest {
    msg_id: u32,
    response: oneshot::Receiver<Bytes>,
}

impl Future for PendingRequest {
    type Output = Option<(u32, Bytes)>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.response.poll_unpin(cx) {
            Poll::Ready(Ok(response)) => Poll::Ready(Some((self.msg_id, response))),
            Poll::Ready(Err(_)) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
