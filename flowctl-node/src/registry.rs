//! The live-flow registry: one slot per worker, shared by every worker and the
//! coordinator's reporting loop.

use std::sync::Arc;

use flowctl_wire::rpc::FlowAttributes;
use parking_lot::Mutex;

/// A registry slot: the attributes of the worker's current flow, and whether a flow is
/// in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveFlowRecord {
    pub attributes: FlowAttributes,
    /// `true` while a send/ack cycle is in progress.
    pub valid: bool,
}

/// A fixed-size table of [`LiveFlowRecord`]s behind a single lock.
#[derive(Debug)]
pub struct FlowRegistry {
    slots: Mutex<Vec<LiveFlowRecord>>,
}

impl FlowRegistry {
    /// Creates a registry with `size` invalid slots.
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self { slots: Mutex::new(vec![LiveFlowRecord::default(); size]) })
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a handle to the slot at `index`, or `None` if out of range.
    pub fn slot(self: &Arc<Self>, index: usize) -> Option<FlowSlot> {
        (index < self.len()).then(|| FlowSlot { registry: Arc::clone(self), index })
    }

    /// Returns the attributes of every flow currently in progress.
    pub fn snapshot(&self) -> Vec<FlowAttributes> {
        self.slots.lock().iter().filter(|r| r.valid).map(|r| r.attributes).collect()
    }

    fn with_slot<T>(&self, index: usize, f: impl FnOnce(&mut LiveFlowRecord) -> T) -> T {
        f(&mut self.slots.lock()[index])
    }
}

/// A worker's handle to its own registry slot. The index is fixed for the lifetime of
/// the handle.
#[derive(Debug, Clone)]
pub struct FlowSlot {
    registry: Arc<FlowRegistry>,
    index: usize,
}

impl FlowSlot {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_attributes(&self, attributes: FlowAttributes) {
        self.registry.with_slot(self.index, |r| r.attributes = attributes);
    }

    pub fn attributes(&self) -> FlowAttributes {
        self.registry.with_slot(self.index, |r| r.attributes)
    }

    pub fn set_valid(&self, valid: bool) {
        self.registry.with_slot(self.index, |r| r.valid = valid);
    }

    pub fn is_valid(&self) -> bool {
        self.registry.with_slot(self.index, |r| r.valid)
    }

    /// Marks a flow with the given attributes as started, in a single critical section.
    pub fn begin(&self, attributes: FlowAttributes) {
        self.registry.with_slot(self.index, |r| {
            r.attributes = attributes;
            r.valid = true;
        });
    }

    /// Returns a copy of the slot.
    pub fn get(&self) -> LiveFlowRecord {
        self.registry.with_slot(self.index, |r| *r)
    }
}
