//! Interface and address enumeration.

use std::net::IpAddr;

use futures::TryStreamExt as _;
use rtnetlink::packet_route::address::AddressAttribute;

use crate::KernelError;

/// An address assigned to a local interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// The interface index.
    pub index: u32,
    pub address: IpAddr,
}

/// Lists every address assigned to a local interface.
pub async fn interface_addresses(
    handle: &rtnetlink::Handle,
) -> Result<Vec<InterfaceAddress>, KernelError> {
    let mut messages = handle.address().get().execute();
    let mut addresses = Vec::new();

    while let Some(msg) = messages.try_next().await? {
        let index = msg.header.index;

        for attribute in msg.attributes {
            if let AddressAttribute::Address(address) | AddressAttribute::Local(address) =
                attribute
            {
                let entry = InterfaceAddress { index, address };
                if !addresses.contains(&entry) {
                    addresses.push(entry);
                }
            }
        }
    }

    tracing::debug!(count = addresses.len(), "enumerated interface addresses");

    Ok(addresses)
}

/// Returns the indexes of the interfaces carrying any of the `wanted` addresses, sorted
/// and without duplicates.
pub fn matching_interfaces(addresses: &[InterfaceAddress], wanted: &[IpAddr]) -> Vec<u32> {
    let mut indexes: Vec<u32> = addresses
        .iter()
        .filter(|a| wanted.contains(&a.address))
        .map(|a| a.index)
        .collect();

    indexes.sort_unstable();
    indexes.dedup();
    indexes
}
