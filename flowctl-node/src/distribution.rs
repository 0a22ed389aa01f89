//! Splits a node's flows across peers and flow classes.

use std::net::SocketAddr;

use thiserror::Error;

/// Priorities of the default flow classes.
pub const DEFAULT_PRIORITIES: [u32; 4] = [0, 2, 4, 6];
/// Weights of the default flow classes.
pub const DEFAULT_WEIGHTS: [f64; 4] = [0.65, 0.10, 0.20, 0.05];

/// Slack allowed on the weight total, for weights that don't add up exactly in binary.
const WEIGHT_EPSILON: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum DistributionError {
    #[error("No peers configured")]
    NoPeers,
    #[error("No flow classes configured")]
    NoClasses,
    #[error("Invalid class weight {0}")]
    InvalidWeight(f64),
    #[error("Class weights sum to {0}, more than 1")]
    WeightsExceedOne(f64),
}

/// A class of flows sharing one socket priority.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowClass {
    pub priority: u32,
    /// Fraction of a peer's flows that belong to this class.
    pub weight: f64,
    /// Fixed flow size for the class. Sampled from the CDF table if `None`.
    pub size: Option<u64>,
}

impl FlowClass {
    pub fn new(priority: u32, weight: f64) -> Self {
        Self { priority, weight, size: None }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

/// The default four classes.
pub fn default_classes() -> Vec<FlowClass> {
    DEFAULT_PRIORITIES
        .iter()
        .zip(DEFAULT_WEIGHTS)
        .map(|(priority, weight)| FlowClass::new(*priority, weight))
        .collect()
}

/// Splits `total` into one count per weight. Every count is the floored share and the
/// remainder goes to the first bucket, so the counts always sum to `total`. Shares past
/// `total` are cut off in bucket order.
pub fn bucket_counts(weights: &[f64], total: usize) -> Vec<usize> {
    let mut remaining = total;
    let mut counts: Vec<usize> = weights
        .iter()
        .map(|w| {
            let count = ((total as f64 * w).floor().max(0.0) as usize).min(remaining);
            remaining -= count;
            count
        })
        .collect();

    if let Some(first) = counts.first_mut() {
        *first += remaining;
    }

    counts
}

/// Splits `total` evenly across `peers`, with the last peer taking the remainder.
pub fn peer_counts(peers: usize, total: usize) -> Vec<usize> {
    if peers == 0 {
        return Vec::new();
    }

    let share = total / peers;
    let mut counts = vec![share; peers];
    if let Some(last) = counts.last_mut() {
        *last += total % peers;
    }

    counts
}

/// One worker to spawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedFlow {
    pub peer: SocketAddr,
    pub class: FlowClass,
}

/// Plans one worker per flow, grouped by peer and then by class.
pub fn plan(
    peers: &[SocketAddr],
    classes: &[FlowClass],
    total: usize,
) -> Result<Vec<PlannedFlow>, DistributionError> {
    if peers.is_empty() {
        return Err(DistributionError::NoPeers);
    }
    if classes.is_empty() {
        return Err(DistributionError::NoClasses);
    }
    if let Some(class) = classes.iter().find(|c| !c.weight.is_finite() || c.weight < 0.0) {
        return Err(DistributionError::InvalidWeight(class.weight));
    }

    let weights: Vec<f64> = classes.iter().map(|c| c.weight).collect();
    let sum: f64 = weights.iter().sum();
    if sum > 1.0 + WEIGHT_EPSILON {
        return Err(DistributionError::WeightsExceedOne(sum));
    }

    let mut planned = Vec::with_capacity(total);

    for (peer, per_peer) in peers.iter().zip(peer_counts(peers.len(), total)) {
        for (class, count) in classes.iter().zip(bucket_counts(&weights, per_peer)) {
            planned.extend(std::iter::repeat(PlannedFlow { peer: *peer, class: *class }).take(count));
        }
    }

    Ok(planned)
}
