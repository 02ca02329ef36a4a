//! Linux bridge driver.
//!
//! A bridge network is one bridge device carrying the gateway address plus
//! a masquerade rule. Each endpoint is a veth pair whose host end is a
//! bridge port and whose peer end lives in the container namespace.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use keel_common::{KeelError, KeelResult};

use crate::driver::NetworkDriver;
use crate::endpoint::Endpoint;
use crate::netlink::{Netlink, mac_address};
use crate::netns;
use crate::network::Network;
use crate::portmap;

/// Name of the bridge driver.
pub const BRIDGE_DRIVER: &str = "bridge";

/// Driver backed by a Linux bridge.
#[derive(Debug, Default, Clone, Copy)]
pub struct BridgeDriver;

impl BridgeDriver {
    /// Create a new bridge driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkDriver for BridgeDriver {
    fn name(&self) -> &str {
        BRIDGE_DRIVER
    }

    async fn create(&self, name: &str, ip_range: Ipv4Network) -> KeelResult<Network> {
        tracing::debug!(name, %ip_range, "Creating bridge");
        let netlink = Netlink::connect()?;

        let index = if let Some(index) = netlink.link_index(name).await? {
            tracing::info!(name, "Bridge already exists, reusing it");
            index
        } else {
            let index = netlink.add_bridge(name).await?;
            netlink
                .add_address(index, ip_range.ip(), ip_range.prefix())
                .await?;
            index
        };
        netlink.set_up(index).await?;

        if let Err(e) = portmap::enable_ip_forwarding() {
            tracing::warn!(error = %e, "Containers may not reach other networks");
        }
        portmap::ensure_masquerade(&ip_range, name)?;

        tracing::info!(name, gateway = %ip_range, "Bridge network ready");
        Ok(Network::new(name, ip_range, BRIDGE_DRIVER))
    }

    async fn delete(&self, network: &Network) -> KeelResult<()> {
        tracing::debug!(name = %network.name, "Deleting bridge");
        let netlink = Netlink::connect()?;

        match netlink.link_index(&network.name).await? {
            Some(index) => netlink.delete_link(index).await?,
            None => tracing::warn!(name = %network.name, "Bridge does not exist"),
        }

        if let Err(e) = portmap::remove_masquerade(&network.ip_range, &network.name) {
            tracing::warn!(name = %network.name, error = %e, "Failed to remove masquerade rule");
        }
        Ok(())
    }

    async fn connect(
        &self,
        network: &Network,
        endpoint: &mut Endpoint,
        pid: u32,
    ) -> KeelResult<()> {
        tracing::debug!(
            endpoint = %endpoint.id,
            host = %endpoint.host_device,
            peer = %endpoint.peer_device,
            pid,
            "Connecting endpoint"
        );
        let netlink = Netlink::connect()?;

        let bridge = netlink.require_index(&network.name).await?;
        netlink
            .add_veth(&endpoint.host_device, &endpoint.peer_device)
            .await?;
        let host = netlink.require_index(&endpoint.host_device).await?;
        netlink.set_controller(host, bridge).await?;
        netlink.set_up(host).await?;

        let peer = netlink
            .link(&endpoint.peer_device)
            .await?
            .ok_or_else(|| KeelError::NetworkFailure {
                message: format!("Veth peer {} vanished", endpoint.peer_device),
            })?;
        endpoint.mac = mac_address(&peer);

        let container_ns = netns::open_netns(pid)?;
        netlink.set_netns(peer.header.index, &container_ns).await?;

        let peer_config = PeerConfig {
            device: endpoint.peer_device.clone(),
            ip: endpoint.ip,
            prefix: network.ip_range.prefix(),
            gateway: network.gateway(),
        };
        tokio::task::spawn_blocking(move || netns::run_in_netns(pid, || peer_config.apply()))
            .await
            .map_err(|e| KeelError::NetworkFailure {
                message: format!("Namespace configuration task failed: {e}"),
            })??;

        portmap::add_port_mappings(&endpoint.port_mappings, endpoint.ip);

        tracing::info!(
            endpoint = %endpoint.id,
            ip = %endpoint.ip,
            mac = ?endpoint.mac,
            "Endpoint connected"
        );
        Ok(())
    }

    async fn disconnect(&self, _network: &Network, endpoint: &Endpoint) -> KeelResult<()> {
        tracing::debug!(endpoint = %endpoint.id, "Disconnecting endpoint");
        portmap::remove_port_mappings(&endpoint.port_mappings, endpoint.ip);

        let netlink = Netlink::connect()?;
        match netlink.link_index(&endpoint.host_device).await? {
            Some(index) => netlink.delete_link(index).await?,
            None => tracing::debug!(device = %endpoint.host_device, "Host device already gone"),
        }
        Ok(())
    }
}

/// Configuration applied to the container-side device from inside the
/// container network namespace.
#[derive(Debug, Clone)]
struct PeerConfig {
    device: String,
    ip: Ipv4Addr,
    prefix: u8,
    gateway: Ipv4Addr,
}

impl PeerConfig {
    /// Must run on a thread that has already entered the target namespace.
    fn apply(&self) -> KeelResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(async {
            let netlink = Netlink::connect()?;

            let index = netlink.require_index(&self.device).await?;
            netlink.add_address(index, self.ip, self.prefix).await?;
            netlink.set_up(index).await?;

            let lo = netlink.require_index("lo").await?;
            netlink.set_up(lo).await?;

            netlink.add_default_route(self.gateway, index).await?;
            tracing::debug!(device = %self.device, ip = %self.ip, "Configured container interface");
            Ok(())
        })
    }
}
