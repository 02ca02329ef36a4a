//! Port mapping and NAT rules for containers.
//!
//! Rules are managed through the `iptables` binary. Argument lists are
//! built by pure functions so the exact rules can be checked without
//! touching the host firewall.

use std::fmt;
use std::net::Ipv4Addr;
use std::process::Command;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use keel_common::{KeelError, KeelResult};

/// A published `hostPort:containerPort` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// Port on the host.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Create a new mapping.
    #[must_use]
    pub const fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.container_port)
    }
}

impl FromStr for PortMapping {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| KeelError::MalformedInput {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split(':').collect();
        let [host, container] = parts.as_slice() else {
            return Err(malformed("expected hostPort:containerPort"));
        };

        let host_port = host
            .trim()
            .parse()
            .map_err(|_| malformed("host port is not a valid port number"))?;
        let container_port = container
            .trim()
            .parse()
            .map_err(|_| malformed("container port is not a valid port number"))?;

        Ok(Self::new(host_port, container_port))
    }
}

/// Parse port mappings, skipping malformed entries with a warning.
pub fn parse_port_mappings<S: AsRef<str>>(raw: &[S]) -> Vec<PortMapping> {
    raw.iter()
        .filter_map(|value| match value.as_ref().parse() {
            Ok(mapping) => Some(mapping),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping port mapping");
                None
            }
        })
        .collect()
}

/// What to do with a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Append the rule (`-A`).
    Append,
    /// Delete the rule (`-D`).
    Delete,
    /// Check whether the rule exists (`-C`).
    Check,
}

impl RuleAction {
    const fn flag(self) -> &'static str {
        match self {
            Self::Append => "-A",
            Self::Delete => "-D",
            Self::Check => "-C",
        }
    }
}

/// Arguments for the masquerade rule of a bridge network.
///
/// Traffic from `subnet` leaving through any interface other than the
/// bridge gets the host's source address.
#[must_use]
pub fn masquerade_args(action: RuleAction, subnet: &Ipv4Network, bridge: &str) -> Vec<String> {
    let subnet = Ipv4Network::new(subnet.network(), subnet.prefix())
        .unwrap_or(*subnet)
        .to_string();
    [
        "-t",
        "nat",
        action.flag(),
        "POSTROUTING",
        "-s",
        subnet.as_str(),
        "!",
        "-o",
        bridge,
        "-j",
        "MASQUERADE",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

/// Arguments for the DNAT rule of one port mapping.
#[must_use]
pub fn dnat_args(action: RuleAction, mapping: &PortMapping, container_ip: Ipv4Addr) -> Vec<String> {
    let host_port = mapping.host_port.to_string();
    let destination = format!("{container_ip}:{}", mapping.container_port);
    [
        "-t",
        "nat",
        action.flag(),
        "PREROUTING",
        "-p",
        "tcp",
        "-m",
        "tcp",
        "--dport",
        host_port.as_str(),
        "-j",
        "DNAT",
        "--to-destination",
        destination.as_str(),
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

/// Install the masquerade rule for a bridge unless it is already present.
///
/// # Errors
///
/// Returns [`KeelError::NetworkFailure`] if iptables fails.
pub fn ensure_masquerade(subnet: &Ipv4Network, bridge: &str) -> KeelResult<()> {
    if rule_exists(&masquerade_args(RuleAction::Check, subnet, bridge)) {
        tracing::debug!(bridge, %subnet, "Masquerade rule already present");
        return Ok(());
    }
    run_iptables(&masquerade_args(RuleAction::Append, subnet, bridge))?;
    tracing::info!(bridge, %subnet, "Masquerade rule installed");
    Ok(())
}

/// Remove the masquerade rule of a bridge.
///
/// # Errors
///
/// Returns [`KeelError::NetworkFailure`] if iptables fails.
pub fn remove_masquerade(subnet: &Ipv4Network, bridge: &str) -> KeelResult<()> {
    run_iptables(&masquerade_args(RuleAction::Delete, subnet, bridge))
}

/// Install DNAT rules for every mapping.
///
/// A mapping whose rule cannot be installed is logged and skipped; the
/// rest are still attempted. Returns how many rules were installed.
pub fn add_port_mappings(mappings: &[PortMapping], container_ip: Ipv4Addr) -> usize {
    install_each(mappings, container_ip, run_iptables)
}

fn install_each(
    mappings: &[PortMapping],
    container_ip: Ipv4Addr,
    mut run: impl FnMut(&[String]) -> KeelResult<()>,
) -> usize {
    let mut installed = 0;
    for mapping in mappings {
        tracing::debug!(%mapping, %container_ip, "Adding port mapping");
        match run(&dnat_args(RuleAction::Append, mapping, container_ip)) {
            Ok(()) => installed += 1,
            Err(e) => tracing::warn!(%mapping, error = %e, "Skipping port mapping"),
        }
    }
    installed
}

/// Remove DNAT rules for every mapping, logging failures.
pub fn remove_port_mappings(mappings: &[PortMapping], container_ip: Ipv4Addr) {
    for mapping in mappings {
        tracing::debug!(%mapping, %container_ip, "Removing port mapping");
        if let Err(e) = run_iptables(&dnat_args(RuleAction::Delete, mapping, container_ip)) {
            tracing::warn!(%mapping, error = %e, "Failed to remove port mapping");
        }
    }
}

/// Enable IP forwarding on the system.
///
/// # Errors
///
/// Returns an error if the sysctl cannot be written.
pub fn enable_ip_forwarding() -> KeelResult<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1").map_err(|e| {
        KeelError::NetworkFailure {
            message: format!("Failed to enable IP forwarding: {e}"),
        }
    })?;

    tracing::debug!("IP forwarding enabled");
    Ok(())
}

fn rule_exists(args: &[String]) -> bool {
    Command::new("iptables")
        .args(args)
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Run an iptables command.
fn run_iptables(args: &[String]) -> KeelResult<()> {
    let output = Command::new("iptables")
        .args(args)
        .output()
        .map_err(|e| KeelError::NetworkFailure {
            message: format!("Failed to execute iptables: {e}"),
        })?;

    if !output.status.success() {
        return Err(KeelError::NetworkFailure {
            message: format!(
                "iptables {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_mapping() {
        let mapping: PortMapping = "8080:80".parse().unwrap();
        assert_eq!(mapping, PortMapping::new(8080, 80));
        assert_eq!(mapping.to_string(), "8080:80");
    }

    #[test]
    fn parse_rejects_wrong_token_count() {
        assert!(matches!(
            "8080".parse::<PortMapping>(),
            Err(KeelError::MalformedInput { .. })
        ));
        assert!("1:2:3".parse::<PortMapping>().is_err());
        assert!("http:80".parse::<PortMapping>().is_err());
        assert!("70000:80".parse::<PortMapping>().is_err());
    }

    #[test]
    fn malformed_entries_do_not_abort_the_rest() {
        let mappings = parse_port_mappings(&["8080", "8081:81", "bad:port", "9090:90"]);
        assert_eq!(
            mappings,
            vec![PortMapping::new(8081, 81), PortMapping::new(9090, 90)]
        );
    }

    #[test]
    fn masquerade_rule_uses_network_address() {
        let subnet: Ipv4Network = "192.168.10.1/24".parse().unwrap();
        let args = masquerade_args(RuleAction::Append, &subnet, "br0");
        assert_eq!(
            args.join(" "),
            "-t nat -A POSTROUTING -s 192.168.10.0/24 ! -o br0 -j MASQUERADE"
        );
    }

    #[test]
    fn dnat_rule_targets_container() {
        let args = dnat_args(
            RuleAction::Delete,
            &PortMapping::new(8080, 80),
            Ipv4Addr::new(192, 168, 10, 2),
        );
        assert_eq!(
            args.join(" "),
            "-t nat -D PREROUTING -p tcp -m tcp --dport 8080 -j DNAT --to-destination 192.168.10.2:80"
        );
    }

    #[test]
    fn failed_mapping_does_not_stop_the_rest() {
        let mappings = [PortMapping::new(8080, 80), PortMapping::new(9090, 90)];
        let mut attempted = Vec::new();

        let installed = install_each(&mappings, Ipv4Addr::new(10, 0, 0, 2), |args| {
            attempted.push(args.join(" "));
            if args.iter().any(|a| a == "8080") {
                Err(KeelError::NetworkFailure {
                    message: "port busy".to_string(),
                })
            } else {
                Ok(())
            }
        });

        assert_eq!(installed, 1);
        assert_eq!(attempted.len(), 2);
        assert!(attempted[1].contains("10.0.0.2:90"));
    }
}
