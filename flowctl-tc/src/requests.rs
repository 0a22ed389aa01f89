//! Helpers to make traffic control requests, given a [`rtnetlink::Handle`].

use futures::StreamExt as _;
use rtnetlink::packet_core::{NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::{tc::TcHandle, RouteNetlinkMessage};

use crate::{
    handle::{display_handle, prio_class_handle, tbf_handle, QdiscRequestInner, BAND_COUNT},
    prio::{QdiscDeleteRootRequest, QdiscPrioRequest},
    tbf::{QdiscTbfRequest, TbfQopt},
    KernelError,
};

/// Shape of the per-band token buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    /// Bucket size in bytes.
    pub burst_bytes: u32,
    /// Maximum bytes queued behind the bucket.
    pub limit_bytes: u32,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self { burst_bytes: 32 * 1024, limit_bytes: 256 * 1024 }
    }
}

/// Sends a request and waits for the kernel's acknowledgement.
async fn execute(
    handle: &mut rtnetlink::Handle,
    request: NetlinkMessage<RouteNetlinkMessage>,
) -> Result<(), KernelError> {
    let mut res = handle.request(request)?;
    while let Some(res) = res.next().await {
        if let NetlinkPayload::Error(e) = res.payload {
            return Err(rtnetlink::Error::NetlinkError(e).into());
        }
    }

    Ok(())
}

/// Removes the root qdisc of an interface, falling back to the kernel default.
pub async fn delete_root_qdisc(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
) -> Result<(), KernelError> {
    tracing::debug!(if_index, "deleting root qdisc");

    let request = QdiscDeleteRootRequest::new(QdiscRequestInner::new(if_index)).build();
    execute(handle, request).await.inspect_err(|e| {
        tracing::debug!(?e, "failed to delete root qdisc");
    })
}

/// Installs the baseline hierarchy: a prio root qdisc with a TBF under every band,
/// each limited to the corresponding entry of `band_rates` (bits per second).
pub async fn install_priority_root(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    band_rates: &[u64; BAND_COUNT as usize],
    bucket: BucketConfig,
) -> Result<(), KernelError> {
    tracing::debug!(if_index, ?band_rates, "installing prio root qdisc");

    let request = QdiscPrioRequest::new(QdiscRequestInner::new(if_index)).build();
    execute(handle, request).await.inspect_err(|e| {
        tracing::debug!(?e, "failed to create prio root qdisc");
    })?;

    for (band, rate_bps) in band_rates.iter().enumerate() {
        configure_band_rate(handle, if_index, band as u8, *rate_bps, bucket).await?;
    }

    Ok(())
}

/// Creates or replaces the TBF under a prio band, limiting it to `rate_bps` bits per
/// second.
pub async fn configure_band_rate(
    handle: &mut rtnetlink::Handle,
    if_index: i32,
    band: u8,
    rate_bps: u64,
    bucket: BucketConfig,
) -> Result<(), KernelError> {
    let class_handle = prio_class_handle(band);
    let tbf_h = tbf_handle(band);

    tracing::debug!(
        if_index,
        band,
        rate_bps,
        parent = display_handle(class_handle),
        tbf_handle = display_handle(tbf_h),
        "configuring band rate"
    );

    let request = QdiscTbfRequest::new(
        QdiscRequestInner::new(if_index)
            .with_parent(TcHandle::from(class_handle))
            .with_handle(TcHandle::from(tbf_h)),
        TbfQopt::from_rate(rate_bps / 8, bucket.burst_bytes, bucket.limit_bytes),
    )
    .with_replace(true)
    .build();

    execute(handle, request).await.inspect_err(|e| {
        tracing::debug!(?e, "failed to configure tbf qdisc");
    })
}
