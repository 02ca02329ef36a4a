//! # keel-network
//!
//! Container networking for Keel: bitmap IP allocation, persisted bridge
//! networks, veth endpoints wired into container namespaces, and iptables
//! NAT rules.

#![warn(missing_docs)]

pub mod bridge;
pub mod driver;
pub mod endpoint;
pub mod ipam;
pub mod netlink;
pub mod netns;
pub mod network;
pub mod portmap;

pub use bridge::{BRIDGE_DRIVER, BridgeDriver};
pub use driver::NetworkDriver;
pub use endpoint::Endpoint;
pub use ipam::Ipam;
pub use netns::{NetnsGuard, run_in_netns};
pub use network::{Network, NetworkManager};
pub use portmap::{PortMapping, parse_port_mappings};
