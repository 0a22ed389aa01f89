//! The completion channel: finished flows on their way to the reporting loop.

use flowctl_common::BoundedQueue;
use flowctl_wire::rpc::CompletedFlow;

/// Default number of completed flows buffered between two reports.
pub const DEFAULT_COMPLETION_CAPACITY: usize = 20;

/// Bounded, drop-oldest queue of completed flows. Workers never block on it.
#[derive(Debug)]
pub struct CompletionChannel {
    queue: BoundedQueue<CompletedFlow>,
}

impl Default for CompletionChannel {
    fn default() -> Self {
        Self::new(DEFAULT_COMPLETION_CAPACITY)
    }
}

impl CompletionChannel {
    pub fn new(capacity: usize) -> Self {
        Self { queue: BoundedQueue::new(capacity) }
    }

    /// Hands off a completed flow, evicting the oldest buffered one if full.
    pub fn push(&self, flow: CompletedFlow) {
        if let Some(evicted) = self.queue.push(flow) {
            tracing::debug!(
                attributes = ?evicted.attributes,
                "completion channel full, dropped oldest flow"
            );
        }
    }

    /// Takes every buffered flow, oldest first.
    pub fn drain(&self) -> Vec<CompletedFlow> {
        self.queue.drain()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
