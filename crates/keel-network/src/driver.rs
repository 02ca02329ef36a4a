//! Network driver abstraction.

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use keel_common::KeelResult;

use crate::endpoint::Endpoint;
use crate::network::Network;

/// A backend that realizes networks and endpoints on the host.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Driver name as used on the command line.
    fn name(&self) -> &str;

    /// Create the host side of a network whose gateway is `ip_range.ip()`.
    async fn create(&self, name: &str, ip_range: Ipv4Network) -> KeelResult<Network>;

    /// Remove the host side of a network.
    async fn delete(&self, network: &Network) -> KeelResult<()>;

    /// Wire `endpoint` into the network namespace of `pid`.
    async fn connect(&self, network: &Network, endpoint: &mut Endpoint, pid: u32)
    -> KeelResult<()>;

    /// Undo [`NetworkDriver::connect`]. Missing devices are not an error.
    async fn disconnect(&self, network: &Network, endpoint: &Endpoint) -> KeelResult<()>;
}
