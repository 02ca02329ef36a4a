//! Network records and the network registry.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ipnetwork::Ipv4Network;
use keel_common::{KeelError, KeelPaths, KeelResult};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeDriver;
use crate::driver::NetworkDriver;
use crate::endpoint::Endpoint;
use crate::ipam::Ipam;
use crate::portmap::PortMapping;

/// Longest interface name the kernel accepts.
const MAX_DEVICE_NAME: usize = 15;

/// A persisted network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Network name, also the bridge device name.
    pub name: String,
    /// Gateway address with the subnet prefix, e.g. `192.168.10.1/24`.
    #[serde(rename = "ipRange")]
    pub ip_range: Ipv4Network,
    /// Driver that owns the network.
    pub driver: String,
}

impl Network {
    /// Create a network record.
    #[must_use]
    pub fn new(name: impl Into<String>, ip_range: Ipv4Network, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip_range,
            driver: driver.into(),
        }
    }

    /// Gateway address of the network.
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        self.ip_range.ip()
    }

    /// The subnet in canonical form, e.g. `192.168.10.0/24`.
    #[must_use]
    pub fn subnet(&self) -> Ipv4Network {
        Ipv4Network::new(self.ip_range.network(), self.ip_range.prefix()).unwrap_or(self.ip_range)
    }
}

/// Registry of networks, loaded from disk and saved on every change.
pub struct NetworkManager {
    dir: PathBuf,
    ipam: Ipam,
    drivers: HashMap<String, Arc<dyn NetworkDriver>>,
    networks: BTreeMap<String, Network>,
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("dir", &self.dir)
            .field("ipam", &self.ipam)
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("networks", &self.networks)
            .finish()
    }
}

impl NetworkManager {
    /// Load the registry from the standard locations with the bridge driver.
    ///
    /// # Errors
    ///
    /// Returns an error if the network directory cannot be read.
    pub fn load(paths: &KeelPaths) -> KeelResult<Self> {
        let mut manager = Self::open(paths.networks(), Ipam::new(paths.ipam()))?;
        manager.register_driver(Arc::new(BridgeDriver::new()));
        Ok(manager)
    }

    /// Load the registry from `dir` with no drivers registered.
    ///
    /// Unreadable records are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if `dir` cannot be created or listed.
    pub fn open(dir: impl Into<PathBuf>, ipam: Ipam) -> KeelResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut networks = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            match load_network(&path) {
                Ok(network) => {
                    networks.insert(network.name.clone(), network);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping network record");
                }
            }
        }

        tracing::debug!(dir = %dir.display(), count = networks.len(), "Loaded networks");
        Ok(Self {
            dir,
            ipam,
            drivers: HashMap::new(),
            networks,
        })
    }

    /// Register a driver under its own name.
    pub fn register_driver(&mut self, driver: Arc<dyn NetworkDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    /// The address allocator.
    #[must_use]
    pub const fn ipam(&self) -> &Ipam {
        &self.ipam
    }

    /// All known networks, ordered by name.
    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    /// Look up a network by name.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkNotFound`] if no such network exists.
    pub fn get(&self, name: &str) -> KeelResult<&Network> {
        self.networks
            .get(name)
            .ok_or_else(|| KeelError::NetworkNotFound {
                name: name.to_string(),
            })
    }

    /// Create and persist a network.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate name, an unknown driver, a malformed subnet, or
    /// any driver failure.
    pub async fn create_network(
        &mut self,
        driver: &str,
        subnet: &str,
        name: &str,
    ) -> KeelResult<Network> {
        validate_name(name)?;
        if self.networks.contains_key(name) {
            return Err(KeelError::NetworkExists {
                name: name.to_string(),
            });
        }
        let driver = self.driver(driver)?;

        let subnet: Ipv4Network = subnet.parse().map_err(|e| KeelError::MalformedInput {
            input: subnet.to_string(),
            reason: format!("not an IPv4 CIDR: {e}"),
        })?;
        let pooled = self.ipam.bitmap(&subnet)?.is_some();
        let gateway = self.ipam.reserve_gateway(&subnet)?;
        let ip_range = Ipv4Network::new(gateway, subnet.prefix()).map_err(|e| {
            KeelError::Internal {
                message: format!("Invalid gateway range: {e}"),
            }
        })?;

        let network = match driver.create(name, ip_range).await {
            Ok(network) => network,
            Err(e) => {
                if !pooled {
                    if let Err(cleanup) = self.ipam.release_subnet(&subnet) {
                        tracing::warn!(%subnet, error = %cleanup, "Failed to drop unused pool");
                    }
                }
                return Err(e);
            }
        };
        self.dump(&network)?;
        self.networks.insert(network.name.clone(), network.clone());

        tracing::info!(name, subnet = %network.subnet(), driver = %network.driver, "Network created");
        Ok(network)
    }

    /// Delete a network: release its pool, remove the device, drop the record.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkNotFound`] or any driver failure.
    pub async fn delete_network(&mut self, name: &str) -> KeelResult<()> {
        let network = self.get(name)?.clone();
        let driver = self.driver(&network.driver)?;

        self.ipam.release_subnet(&network.subnet())?;
        driver.delete(&network).await?;

        let path = self.dir.join(&network.name);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.networks.remove(name);

        tracing::info!(name, "Network removed");
        Ok(())
    }

    /// Allocate an address and connect a container to a network.
    ///
    /// On failure the endpoint is disconnected and its address released
    /// before the error is returned. The container itself is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkNotFound`], [`KeelError::SubnetExhausted`]
    /// or the driver's failure.
    pub async fn connect(
        &self,
        network: &str,
        container_id: &str,
        pid: u32,
        port_mappings: Vec<PortMapping>,
    ) -> KeelResult<Endpoint> {
        let network = self.get(network)?;
        let driver = self.driver(&network.driver)?;
        let subnet = network.subnet();

        let ip = self.ipam.allocate(&subnet)?;
        let mut endpoint = Endpoint::new(container_id, &network.name, ip, port_mappings);

        if let Err(e) = driver.connect(network, &mut endpoint, pid).await {
            tracing::error!(endpoint = %endpoint.id, error = %e, "Connect failed, rolling back");
            if let Err(cleanup) = driver.disconnect(network, &endpoint).await {
                tracing::warn!(endpoint = %endpoint.id, error = %cleanup, "Rollback disconnect failed");
            }
            if let Err(cleanup) = self.ipam.release(&subnet, ip) {
                tracing::warn!(%ip, error = %cleanup, "Rollback release failed");
            }
            return Err(e);
        }

        Ok(endpoint)
    }

    /// Tear down an endpoint's devices and port mappings.
    ///
    /// The endpoint's address stays allocated.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkNotFound`] or the driver's failure.
    pub async fn disconnect(&self, endpoint: &Endpoint) -> KeelResult<()> {
        let network = self.get(&endpoint.network)?;
        let driver = self.driver(&network.driver)?;
        driver.disconnect(network, endpoint).await
    }

    fn driver(&self, name: &str) -> KeelResult<Arc<dyn NetworkDriver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| KeelError::UnknownDriver {
                driver: name.to_string(),
            })
    }

    fn dump(&self, network: &Network) -> KeelResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(&network.name);
        std::fs::write(&path, serde_json::to_string_pretty(network)?)?;
        tracing::debug!(path = %path.display(), "Saved network record");
        Ok(())
    }
}

fn load_network(path: &Path) -> KeelResult<Network> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

fn validate_name(name: &str) -> KeelResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_DEVICE_NAME
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(KeelError::InvalidArgument {
            message: format!(
                "network name '{name}' must be 1-{MAX_DEVICE_NAME} characters of [A-Za-z0-9_-]"
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct RecordingDriver {
        calls: Mutex<Vec<String>>,
        fail_connect: bool,
        fail_create: bool,
    }

    impl RecordingDriver {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NetworkDriver for RecordingDriver {
        fn name(&self) -> &str {
            "fake"
        }

        async fn create(&self, name: &str, ip_range: Ipv4Network) -> KeelResult<Network> {
            self.calls.lock().unwrap().push(format!("create {name} {ip_range}"));
            if self.fail_create {
                return Err(KeelError::NetworkFailure {
                    message: "bridge busy".to_string(),
                });
            }
            Ok(Network::new(name, ip_range, "fake"))
        }

        async fn delete(&self, network: &Network) -> KeelResult<()> {
            self.calls.lock().unwrap().push(format!("delete {}", network.name));
            Ok(())
        }

        async fn connect(
            &self,
            _network: &Network,
            endpoint: &mut Endpoint,
            pid: u32,
        ) -> KeelResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("connect {} {pid}", endpoint.ip));
            if self.fail_connect {
                return Err(KeelError::NetworkFailure {
                    message: "setns refused".to_string(),
                });
            }
            Ok(())
        }

        async fn disconnect(&self, _network: &Network, endpoint: &Endpoint) -> KeelResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("disconnect {}", endpoint.host_device));
            Ok(())
        }
    }

    fn manager(dir: &TempDir, driver: Arc<RecordingDriver>) -> NetworkManager {
        let paths = KeelPaths::with_root(dir.path());
        let mut manager = NetworkManager::open(paths.networks(), Ipam::new(paths.ipam())).unwrap();
        manager.register_driver(driver);
        manager
    }

    #[tokio::test]
    async fn create_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let mut networks = manager(&dir, driver.clone());

        let network = networks
            .create_network("fake", "192.168.10.0/24", "br0")
            .await
            .unwrap();
        assert_eq!(network.gateway(), Ipv4Addr::new(192, 168, 10, 1));
        assert_eq!(network.subnet().to_string(), "192.168.10.0/24");
        assert_eq!(driver.calls(), vec!["create br0 192.168.10.1/24"]);

        let reloaded = manager(&dir, driver);
        assert_eq!(reloaded.get("br0").unwrap(), &network);
        assert_eq!(reloaded.networks().count(), 1);
    }

    #[tokio::test]
    async fn network_record_format() {
        let dir = tempdir().unwrap();
        let mut networks = manager(&dir, Arc::new(RecordingDriver::default()));
        networks
            .create_network("fake", "10.10.0.0/16", "net1")
            .await
            .unwrap();

        let path = KeelPaths::with_root(dir.path()).networks().join("net1");
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["name"], "net1");
        assert_eq!(json["ipRange"], "10.10.0.1/16");
        assert_eq!(json["driver"], "fake");
    }

    #[tokio::test]
    async fn connect_assigns_sequential_addresses() {
        let dir = tempdir().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let mut networks = manager(&dir, driver.clone());
        networks
            .create_network("fake", "192.168.10.0/24", "br0")
            .await
            .unwrap();

        let first = networks
            .connect("br0", "1111111111", 100, Vec::new())
            .await
            .unwrap();
        let second = networks
            .connect("br0", "2222222222", 200, vec![PortMapping::new(8080, 80)])
            .await
            .unwrap();

        assert_eq!(first.ip, Ipv4Addr::new(192, 168, 10, 2));
        assert_eq!(second.ip, Ipv4Addr::new(192, 168, 10, 3));
        assert_eq!(second.id, "2222222222-br0");
        assert_eq!(second.port_mappings, vec![PortMapping::new(8080, 80)]);
    }

    #[tokio::test]
    async fn failed_connect_rolls_back() {
        let dir = tempdir().unwrap();
        let driver = Arc::new(RecordingDriver {
            fail_connect: true,
            ..RecordingDriver::default()
        });
        let mut networks = manager(&dir, driver.clone());
        let network = networks
            .create_network("fake", "192.168.10.0/24", "br0")
            .await
            .unwrap();

        let err = networks
            .connect("br0", "1111111111", 100, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::NetworkFailure { .. }));
        assert!(driver.calls().contains(&"disconnect 11111".to_string()));

        let bitmap = networks.ipam().bitmap(&network.subnet()).unwrap().unwrap();
        assert!(bitmap.starts_with("10"));
    }

    #[tokio::test]
    async fn failed_create_drops_new_pool() {
        let dir = tempdir().unwrap();
        let driver = Arc::new(RecordingDriver {
            fail_create: true,
            ..RecordingDriver::default()
        });
        let mut networks = manager(&dir, driver);
        let subnet: Ipv4Network = "192.168.20.0/24".parse().unwrap();

        let err = networks
            .create_network("fake", "192.168.20.0/24", "br1")
            .await
            .unwrap_err();
        assert!(matches!(err, KeelError::NetworkFailure { .. }));
        assert!(networks.ipam().bitmap(&subnet).unwrap().is_none());
        assert_eq!(networks.networks().count(), 0);
    }

    #[tokio::test]
    async fn failed_create_keeps_shared_pool() {
        let dir = tempdir().unwrap();
        let mut networks = manager(&dir, Arc::new(RecordingDriver::default()));
        let network = networks
            .create_network("fake", "192.168.20.0/24", "br1")
            .await
            .unwrap();
        networks.connect("br1", "1111111111", 100, Vec::new()).await.unwrap();

        networks.register_driver(Arc::new(RecordingDriver {
            fail_create: true,
            ..RecordingDriver::default()
        }));
        assert!(networks
            .create_network("fake", "192.168.20.0/24", "br2")
            .await
            .is_err());

        let bitmap = networks.ipam().bitmap(&network.subnet()).unwrap().unwrap();
        assert!(bitmap.starts_with("11"));
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let dir = tempdir().unwrap();
        let mut networks = manager(&dir, Arc::new(RecordingDriver::default()));

        assert!(matches!(
            networks.create_network("vxlan", "10.0.0.0/24", "n1").await,
            Err(KeelError::UnknownDriver { .. })
        ));
        assert!(matches!(
            networks.create_network("fake", "10.0.0.0/33", "n1").await,
            Err(KeelError::MalformedInput { .. })
        ));
        assert!(matches!(
            networks.create_network("fake", "10.0.0.0/24", "a-name-way-too-long").await,
            Err(KeelError::InvalidArgument { .. })
        ));

        networks.create_network("fake", "10.0.0.0/24", "n1").await.unwrap();
        assert!(matches!(
            networks.create_network("fake", "10.0.1.0/24", "n1").await,
            Err(KeelError::NetworkExists { .. })
        ));
    }

    #[tokio::test]
    async fn delete_releases_pool_and_record() {
        let dir = tempdir().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let mut networks = manager(&dir, driver.clone());
        let network = networks
            .create_network("fake", "192.168.10.0/24", "br0")
            .await
            .unwrap();

        networks.delete_network("br0").await.unwrap();

        assert!(networks.ipam().bitmap(&network.subnet()).unwrap().is_none());
        assert!(driver.calls().contains(&"delete br0".to_string()));
        assert!(manager(&dir, driver).get("br0").unwrap_err().is_not_found());
        assert!(matches!(
            networks.delete_network("br0").await,
            Err(KeelError::NetworkNotFound { .. })
        ));
    }

    #[test]
    fn unreadable_records_are_skipped() {
        let dir = tempdir().unwrap();
        let paths = KeelPaths::with_root(dir.path());
        std::fs::create_dir_all(paths.networks()).unwrap();
        std::fs::write(paths.networks().join("junk"), "not json").unwrap();

        let networks = NetworkManager::open(paths.networks(), Ipam::new(paths.ipam())).unwrap();
        assert_eq!(networks.networks().count(), 0);
    }
}
