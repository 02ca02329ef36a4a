//! Container network endpoints.

use std::net::Ipv4Addr;

use crate::portmap::PortMapping;

/// Number of endpoint id characters used for the host-side device name.
const DEVICE_PREFIX_LEN: usize = 5;

/// Prefix of the container-side device name.
const PEER_PREFIX: &str = "cif-";

/// One container's attachment to a network.
///
/// Endpoints are never persisted; they are rebuilt from the container
/// record and the network whenever they are needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// `<container-id>-<network-name>`.
    pub id: String,
    /// Name of the owning network.
    pub network: String,
    /// Host-side veth device, attached to the bridge.
    pub host_device: String,
    /// Container-side veth device.
    pub peer_device: String,
    /// Address allocated from the network's subnet.
    pub ip: Ipv4Addr,
    /// Hardware address of the container-side device, once known.
    pub mac: Option<String>,
    /// Published ports.
    pub port_mappings: Vec<PortMapping>,
}

impl Endpoint {
    /// Build the endpoint of `container_id` on `network`.
    #[must_use]
    pub fn new(
        container_id: &str,
        network: &str,
        ip: Ipv4Addr,
        port_mappings: Vec<PortMapping>,
    ) -> Self {
        let id = format!("{container_id}-{network}");
        let host_device: String = id.chars().take(DEVICE_PREFIX_LEN).collect();
        let peer_device = format!("{PEER_PREFIX}{host_device}");

        Self {
            id,
            network: network.to_string(),
            host_device,
            peer_device,
            ip,
            mac: None,
            port_mappings,
        }
    }
}
