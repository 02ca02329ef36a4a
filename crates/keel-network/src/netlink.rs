//! Thin wrapper over an rtnetlink connection.
//!
//! A [`Netlink`] talks to the network namespace of the thread that created
//! it, so a connection opened inside a container namespace keeps operating
//! there.

use std::fs::File;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::AsRawFd;

use futures::TryStreamExt;
use keel_common::{KeelError, KeelResult};
use netlink_packet_route::link::{LinkAttribute, LinkMessage};
use rtnetlink::{Handle, LinkBridge, LinkUnspec, LinkVeth, RouteMessageBuilder};

fn failure(context: impl std::fmt::Display) -> impl FnOnce(rtnetlink::Error) -> KeelError {
    move |e| KeelError::NetworkFailure {
        message: format!("{context}: {e}"),
    }
}

/// The kernel answers a lookup of an unknown link name with `ENODEV`.
fn is_missing_link(errno: Option<i32>) -> bool {
    errno == Some(libc::ENODEV)
}

/// Handle to an rtnetlink socket.
#[derive(Clone)]
pub struct Netlink {
    handle: Handle,
}

impl Netlink {
    /// Open a connection and spawn its driver on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the socket cannot be opened.
    pub fn connect() -> KeelResult<Self> {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| KeelError::NetworkFailure {
                message: format!("Failed to open netlink socket: {e}"),
            })?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Look up a link by name.
    ///
    /// # Errors
    ///
    /// Returns an error for failures other than the link being absent.
    pub async fn link(&self, name: &str) -> KeelResult<Option<LinkMessage>> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        match links.try_next().await {
            Ok(link) => Ok(link),
            Err(rtnetlink::Error::NetlinkError(msg))
                if is_missing_link(msg.to_io().raw_os_error()) =>
            {
                Ok(None)
            }
            Err(e) => Err(failure(format!("Failed to look up link {name}"))(e)),
        }
    }

    /// Index of a link, if it exists.
    ///
    /// # Errors
    ///
    /// See [`Netlink::link`].
    pub async fn link_index(&self, name: &str) -> KeelResult<Option<u32>> {
        Ok(self.link(name).await?.map(|link| link.header.index))
    }

    /// Index of a link that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the link is absent.
    pub async fn require_index(&self, name: &str) -> KeelResult<u32> {
        self.link_index(name)
            .await?
            .ok_or_else(|| KeelError::NetworkFailure {
                message: format!("Link {name} does not exist"),
            })
    }

    /// Create a bridge device and return its index.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the kernel rejects the request.
    pub async fn add_bridge(&self, name: &str) -> KeelResult<u32> {
        self.handle
            .link()
            .add(LinkBridge::new(name).build())
            .execute()
            .await
            .map_err(failure(format!("Failed to create bridge {name}")))?;
        self.require_index(name).await
    }

    /// Create a veth pair.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the kernel rejects the request.
    pub async fn add_veth(&self, name: &str, peer: &str) -> KeelResult<()> {
        self.handle
            .link()
            .add(LinkVeth::new(name, peer).build())
            .execute()
            .await
            .map_err(failure(format!("Failed to create veth pair {name}/{peer}")))
    }

    /// Attach a link to a bridge.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the kernel rejects the request.
    pub async fn set_controller(&self, index: u32, controller: u32) -> KeelResult<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).controller(controller).build())
            .execute()
            .await
            .map_err(failure(format!("Failed to attach link {index} to {controller}")))
    }

    /// Bring a link up.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the kernel rejects the request.
    pub async fn set_up(&self, index: u32) -> KeelResult<()> {
        self.handle
            .link()
            .set(LinkUnspec::new_with_index(index).up().build())
            .execute()
            .await
            .map_err(failure(format!("Failed to bring up link {index}")))
    }

    /// Move a link into the network namespace referred to by `netns`.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the kernel rejects the request.
    pub async fn set_netns(&self, index: u32, netns: &File) -> KeelResult<()> {
        self.handle
            .link()
            .set(
                LinkUnspec::new_with_index(index)
                    .setns_by_fd(netns.as_raw_fd())
                    .build(),
            )
            .execute()
            .await
            .map_err(failure(format!("Failed to move link {index} to namespace")))
    }

    /// Assign an IPv4 address to a link.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the kernel rejects the request.
    pub async fn add_address(&self, index: u32, ip: Ipv4Addr, prefix: u8) -> KeelResult<()> {
        self.handle
            .address()
            .add(index, IpAddr::V4(ip), prefix)
            .execute()
            .await
            .map_err(failure(format!("Failed to assign {ip}/{prefix} to link {index}")))
    }

    /// Add a default route through `gateway` on link `index`.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the kernel rejects the request.
    pub async fn add_default_route(&self, gateway: Ipv4Addr, index: u32) -> KeelResult<()> {
        let route = RouteMessageBuilder::<Ipv4Addr>::new()
            .output_interface(index)
            .gateway(gateway)
            .build();
        self.handle
            .route()
            .add(route)
            .execute()
            .await
            .map_err(failure(format!("Failed to add default route via {gateway}")))
    }

    /// Delete a link.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the kernel rejects the request.
    pub async fn delete_link(&self, index: u32) -> KeelResult<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(failure(format!("Failed to delete link {index}")))
    }
}

/// Hardware address of a link, formatted as `aa:bb:cc:dd:ee:ff`.
#[must_use]
pub fn mac_address(link: &LinkMessage) -> Option<String> {
    link.attributes.iter().find_map(|attr| match attr {
        LinkAttribute::Address(bytes) if !bytes.is_empty() => Some(format_mac(bytes)),
        _ => None,
    })
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac(&[0x02, 0x42, 0xac, 0x11, 0x00, 0x02]),
            "02:42:ac:11:00:02"
        );
    }

    #[test]
    fn mac_from_link_attributes() {
        let mut link = LinkMessage::default();
        assert_eq!(mac_address(&link), None);
        link.attributes
            .push(LinkAttribute::Address(vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]));
        assert_eq!(mac_address(&link).as_deref(), Some("de:ad:be:ef:00:01"));
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN"]
    async fn loopback_is_visible() {
        let netlink = Netlink::connect().unwrap();
        assert!(netlink.link_index("lo").await.unwrap().is_some());
    }

    #[test]
    fn only_enodev_means_absent() {
        assert!(is_missing_link(Some(libc::ENODEV)));
        assert!(!is_missing_link(Some(libc::EPERM)));
        assert!(!is_missing_link(Some(libc::EBUSY)));
        assert!(!is_missing_link(None));
    }
}
