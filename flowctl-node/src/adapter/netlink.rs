use std::net::IpAddr;

use async_trait::async_trait;
use flowctl_tc::{
    handle::BAND_COUNT,
    link,
    requests::{self, BucketConfig},
    ErrorClass, KernelError,
};
use tokio::task::JoinHandle;

use super::QdiscBackend;

/// Configures the kernel over an rtnetlink connection.
#[derive(Debug)]
pub struct NetlinkBackend {
    handle: rtnetlink::Handle,
    connection: Option<JoinHandle<()>>,
}

impl NetlinkBackend {
    /// Opens an rtnetlink connection on the current runtime.
    pub fn connect() -> Result<Self, KernelError> {
        let (handle, connection) = flowctl_tc::connect()?;
        Ok(Self { handle, connection: Some(connection) })
    }
}

#[async_trait]
impl QdiscBackend for NetlinkBackend {
    async fn matching_interfaces(&mut self, addresses: &[IpAddr]) -> Result<Vec<u32>, KernelError> {
        let local = link::interface_addresses(&self.handle).await?;
        Ok(link::matching_interfaces(&local, addresses))
    }

    async fn install_baseline(
        &mut self,
        if_index: u32,
        band_rates: &[u64; BAND_COUNT as usize],
        bucket: BucketConfig,
    ) -> Result<(), KernelError> {
        let if_index = if_index as i32;

        // Replaces whatever root the interface has. A missing one is fine.
        if let Err(e) = requests::delete_root_qdisc(&mut self.handle, if_index).await {
            if e.class() != ErrorClass::Absent {
                return Err(e);
            }
        }

        requests::install_priority_root(&mut self.handle, if_index, band_rates, bucket).await
    }

    async fn set_band_rate(
        &mut self,
        if_index: u32,
        band: u8,
        rate_bps: u64,
        bucket: BucketConfig,
    ) -> Result<(), KernelError> {
        requests::configure_band_rate(&mut self.handle, if_index as i32, band, rate_bps, bucket)
            .await
    }

    async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }
}

impl Drop for NetlinkBackend {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.abort();
        }
    }
}
