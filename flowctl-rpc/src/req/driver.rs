use bytes::Bytes;
use futures::{Future, SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Instant,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::Interval,
};
use tokio_util::codec::Framed;

use super::{Command, ReqError, ReqOptions, SocketState};
use flowctl_wire::reqrep;

/// The request socket driver. Endless future that drives the socket forward, until
/// either the connection or the socket goes away.
pub(crate) struct ReqDriver {
    /// Options shared with the socket.
    pub(crate) options: Arc<ReqOptions>,
    /// State shared with the socket.
    pub(crate) socket_state: Arc<SocketState>,
    /// ID counter for outgoing requests.
    pub(crate) id_counter: u32,
    /// Commands from the socket.
    pub(crate) from_socket: mpsc::Receiver<Command>,
    /// The actual [`Framed`] connection with the request/reply codec.
    pub(crate) conn: Framed<TcpStream, reqrep::Codec>,
    /// The outgoing message queue.
    pub(crate) egress_queue: VecDeque<reqrep::Message>,
    /// The currently pending requests, if any. Uses [`FxHashMap`] for performance.
    pub(crate) pending_requests: FxHashMap<u32, PendingRequest>,
    /// Interval at which pending requests are checked against the timeout.
    pub(crate) timeout_check_interval: Interval,
    /// The span of the driver, entered on every poll.
    pub(crate) span: tracing::Span,
}

pub(crate) struct PendingRequest {
    start: Instant,
    sender: oneshot::Sender<Result<Bytes, ReqError>>,
}

impl ReqDriver {
    fn new_message(&mut self, payload: Bytes) -> reqrep::Message {
        let id = self.id_counter;
        self.id_counter = id.wrapping_add(1);

        reqrep::Message::new(id, payload)
    }

    fn on_message(&mut self, msg: reqrep::Message) {
        match self.pending_requests.remove(&msg.id()) {
            Some(pending) => {
                let rtt = pending.start.elapsed().as_micros() as usize;
                let size = msg.size();
                let _ = pending.sender.send(Ok(msg.into_payload()));

                self.socket_state.stats.update_rtt(rtt);
                self.socket_state.stats.increment_rx(size);
            }
            None => tracing::debug!(id = msg.id(), "response for unknown or expired request"),
        }
    }

    fn check_timeouts(&mut self) {
        let now = Instant::now();
        let timeout = self.options.timeout;

        let expired: Vec<u32> = self
            .pending_requests
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.start) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending_requests.remove(&id) {
                self.socket_state.stats.increment_timed_out();
                let _ = pending.sender.send(Err(ReqError::Timeout));
            }
        }
    }
}

impl Future for ReqDriver {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _enter = this.span.clone().entered();

        loop {
            let _ = this.conn.poll_flush_unpin(cx);

            match this.conn.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(msg))) => {
                    this.on_message(msg);

                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    tracing::error!(?e, "connection failed, shutting down driver");
                    return Poll::Ready(());
                }
                Poll::Ready(None) => {
                    tracing::debug!("connection closed by peer, shutting down driver");
                    return Poll::Ready(());
                }
                Poll::Pending => {}
            }

            // Poll until pending so the next tick wakes the driver.
            while this.timeout_check_interval.poll_tick(cx).is_ready() {
                this.check_timeouts();
            }

            if this.conn.poll_ready_unpin(cx).is_ready() {
                if let Some(msg) = this.egress_queue.pop_front() {
                    let size = msg.size();
                    tracing::trace!(id = msg.id(), "sending request");
                    match this.conn.start_send_unpin(msg) {
                        Ok(_) => {
                            this.socket_state.stats.increment_tx(size);

                            continue;
                        }
                        Err(e) => {
                            tracing::error!(?e, "failed to send request");
                            return Poll::Ready(());
                        }
                    }
                }
            }

            // Check for outgoing messages from the socket handle
            match this.from_socket.poll_recv(cx) {
                Poll::Ready(Some(Command::Send { message, response })) => {
                    let start = Instant::now();
                    let msg = this.new_message(message);
                    let id = msg.id();
                    this.egress_queue.push_back(msg);
                    this.pending_requests.insert(id, PendingRequest { start, sender: response });

                    continue;
                }
                Poll::Ready(None) => {
                    tracing::debug!("socket dropped, shutting down driver and closing connection");
                    let _ = ready!(this.conn.poll_close_unpin(cx));
                    return Poll::Ready(());
                }
                Poll::Pending => {}
            }

            return Poll::Pending;
        }
    }
}
