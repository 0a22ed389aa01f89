use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use flowctl_wire::reqrep;

mod driver;
mod socket;
mod stats;
use driver::*;
pub use socket::*;
pub use stats::ReqStats;

#[derive(Debug, Error)]
pub enum ReqError {
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
    #[error("Wire protocol error: {0:?}")]
    Wire(#[from] reqrep::Error),
    #[error("Socket closed")]
    SocketClosed,
    #[error("Request timed out")]
    Timeout,
    #[error("Connection attempt timed out")]
    ConnectTimeout,
}

#[derive(Debug)]
pub(crate) enum Command {
    Send { message: Bytes, response: oneshot::Sender<Result<Bytes, ReqError>> },
}

#[derive(Debug, Clone)]
pub struct ReqOptions {
    /// How long a request may stay unanswered before it fails with [`ReqError::Timeout`].
    pub timeout: Duration,
    /// How long establishing the connection may take.
    pub connect_timeout: Duration,
    /// Whether to set `TCP_NODELAY` on the connection.
    pub set_nodelay: bool,
}

impl Default for ReqOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            set_nodelay: true,
        }
    }
}

impl ReqOptions {
    /// Sets the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

/// The request socket state, shared between the backend task and the socket.
#[derive(Debug, Default)]
pub(crate) struct SocketState {
    pub(crate) stats: ReqStats,
}
