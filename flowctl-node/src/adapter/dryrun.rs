use std::{collections::VecDeque, net::IpAddr, sync::Arc};

use async_trait::async_trait;
use flowctl_tc::{handle::BAND_COUNT, link::InterfaceAddress, requests::BucketConfig, KernelError};
use parking_lot::Mutex;

use super::QdiscBackend;

/// One recorded band reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconfiguration {
    pub if_index: u32,
    pub band: u8,
    pub rate_bps: u64,
}

#[derive(Debug, Default)]
struct LogInner {
    baselines: Vec<u32>,
    reconfigurations: Vec<Reconfiguration>,
    /// Errors handed out to the next `set_band_rate` calls, in order.
    failures: VecDeque<KernelError>,
    closed: bool,
}

/// What a [`DryRunBackend`] was asked to do. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct DryRunLog {
    inner: Arc<Mutex<LogInner>>,
}

impl DryRunLog {
    /// Interfaces that got the baseline installed.
    pub fn baselines(&self) -> Vec<u32> {
        self.inner.lock().baselines.clone()
    }

    pub fn reconfigurations(&self) -> Vec<Reconfiguration> {
        self.inner.lock().reconfigurations.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Makes the next `set_band_rate` call fail with `error`.
    pub fn fail_next(&self, error: KernelError) {
        self.inner.lock().failures.push_back(error);
    }
}

/// A backend that records what it would do instead of touching the kernel.
#[derive(Debug, Clone)]
pub struct DryRunBackend {
    interfaces: Vec<InterfaceAddress>,
    log: DryRunLog,
}

impl DryRunBackend {
    /// Creates a backend pretending the host has the given interface addresses.
    pub fn new(interfaces: impl IntoIterator<Item = InterfaceAddress>) -> Self {
        Self { interfaces: interfaces.into_iter().collect(), log: DryRunLog::default() }
    }

    /// Creates a backend with a single interface, index 1, carrying `address`.
    pub fn single(address: IpAddr) -> Self {
        Self::new([InterfaceAddress { index: 1, address }])
    }

    pub fn log(&self) -> DryRunLog {
        self.log.clone()
    }
}

#[async_trait]
impl QdiscBackend for DryRunBackend {
    async fn matching_interfaces(&mut self, addresses: &[IpAddr]) -> Result<Vec<u32>, KernelError> {
        Ok(flowctl_tc::link::matching_interfaces(&self.interfaces, addresses))
    }

    async fn install_baseline(
        &mut self,
        if_index: u32,
        band_rates: &[u64; BAND_COUNT as usize],
        _bucket: BucketConfig,
    ) -> Result<(), KernelError> {
        tracing::debug!(if_index, ?band_rates, "dry run: install baseline");
        self.log.inner.lock().baselines.push(if_index);
        Ok(())
    }

    async fn set_band_rate(
        &mut self,
        if_index: u32,
        band: u8,
        rate_bps: u64,
        _bucket: BucketConfig,
    ) -> Result<(), KernelError> {
        let mut inner = self.log.inner.lock();
        if let Some(error) = inner.failures.pop_front() {
            return Err(error);
        }

        tracing::debug!(if_index, band, rate_bps, "dry run: set band rate");
        inner.reconfigurations.push(Reconfiguration { if_index, band, rate_bps });
        Ok(())
    }

    async fn close(&mut self) {
        self.log.inner.lock().closed = true;
    }
}
