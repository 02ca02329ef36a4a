//! Container lifecycle orchestration.
//!
//! `run` sequences the pieces strictly: prepare the root, spawn the init
//! process, record it, constrain it, wire its network, then release it by
//! handing over the command. Failures before the process exists abort the
//! run; failures after are logged and the container keeps running.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use keel_common::{ContainerId, KeelError, KeelResult};
use keel_network::{Endpoint, NetworkManager, parse_port_mappings};

use super::config::RuntimeConfig;
use super::record::{ContainerRecord, ContainerStatus};
use super::state::StateManager;
use crate::cgroup::{CgroupManager, ResourceLimits};
use crate::exec::{self, SpawnOptions};
use crate::filesystem::{OverlayRootfs, RootfsProvider, VolumeSpec};
use crate::namespace::NamespaceConfig;

/// Everything `keel run` can ask for.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Command and arguments.
    pub command: Vec<String>,
    /// Attach the caller's terminal.
    pub interactive: bool,
    /// Return as soon as the container is started.
    pub detach: bool,
    /// Resource limits.
    pub limits: ResourceLimits,
    /// `hostPath:containerPath`.
    pub volume: Option<String>,
    /// Container name; defaults to the generated id.
    pub name: Option<String>,
    /// Image; defaults to [`RuntimeConfig::default_image`].
    pub image: Option<String>,
    /// Network to attach to.
    pub network: Option<String>,
    /// Published ports, `hostPort:containerPort`.
    pub publish: Vec<String>,
}

impl RunOptions {
    /// Reject option combinations that can never run.
    pub fn validate(&self) -> KeelResult<()> {
        if self.command.iter().all(|arg| arg.trim().is_empty()) {
            return Err(KeelError::InvalidArgument {
                message: "missing container command".to_string(),
            });
        }
        if self.interactive && self.detach {
            return Err(KeelError::InvalidArgument {
                message: "interactive and detach cannot both be set".to_string(),
            });
        }
        Ok(())
    }
}

/// Result of a successful `run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launched {
    /// Generated id.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Host PID of the container.
    pub pid: u32,
    /// Exit code, when the run waited for the container.
    pub exit_code: Option<i32>,
}

/// Runs and manages containers under one state root.
pub struct ContainerManager {
    config: RuntimeConfig,
    state: StateManager,
    rootfs: Arc<dyn RootfsProvider>,
}

impl std::fmt::Debug for ContainerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerManager")
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ContainerManager {
    /// Create a manager using overlay root filesystems.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let rootfs = Arc::new(OverlayRootfs::new(config.paths.clone()));
        Self::with_rootfs(config, rootfs)
    }

    /// Create a manager with a custom rootfs provider.
    #[must_use]
    pub fn with_rootfs(config: RuntimeConfig, rootfs: Arc<dyn RootfsProvider>) -> Self {
        let state = StateManager::new(config.paths.containers());
        Self {
            config,
            state,
            rootfs,
        }
    }

    /// Runtime configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Record storage.
    #[must_use]
    pub const fn state(&self) -> &StateManager {
        &self.state
    }

    fn cgroup(&self, name: &str) -> CgroupManager {
        CgroupManager::with_hierarchy(name, self.config.hierarchy())
    }

    /// Start a container.
    ///
    /// Unless detached, waits for it to exit and then removes every trace
    /// of it.
    pub async fn run(&self, options: RunOptions) -> KeelResult<Launched> {
        options.validate()?;

        let id = ContainerId::generate();
        let name = match &options.name {
            Some(name) => ContainerId::new(name.clone())?.to_string(),
            None => id.to_string(),
        };
        if self.state.exists(&name) {
            return Err(KeelError::InvalidArgument {
                message: format!("container name {name} is already in use"),
            });
        }

        let image = options
            .image
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone());
        let volume = options.volume.as_deref().and_then(VolumeSpec::parse_optional);

        tracing::info!(container = %name, id = %id, image = %image, "Creating container");

        let container_dir = self.state.container_dir(&name);
        std::fs::create_dir_all(&container_dir)?;

        let spawned = match self.start_process(&name, &image, volume.as_ref(), &options) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.discard(&name, volume.as_ref());
                return Err(e);
            }
        };
        let pid = spawned.pid;

        let mut record = ContainerRecord::running(id.as_str(), &name, pid, &options.command);
        record.volume = options.volume.clone().unwrap_or_default();
        record.port_mapping.clone_from(&options.publish);
        self.save_logged(&record);

        let cgroup = self.cgroup(&name);
        if let Err(e) = cgroup.set(&options.limits) {
            tracing::error!(container = %name, error = %e, "Failed to set resource limits");
        }
        if let Err(e) = cgroup.apply(pid) {
            tracing::error!(container = %name, error = %e, "Failed to apply resource limits");
        }

        let endpoint = match &options.network {
            Some(network) => self.connect(&mut record, network, pid).await,
            None => None,
        };

        if let Err(e) = spawned.channel.send(&options.command) {
            tracing::error!(container = %name, error = %e, "Failed to hand command to container");
        }

        let exit_code = if options.detach {
            tracing::info!(container = %name, pid, "Container started");
            None
        } else {
            let waited = exec::wait(pid).await;
            let code = self
                .finish(waited, &record, &cgroup, endpoint.as_ref(), volume.as_ref())
                .await?;
            Some(code)
        };

        Ok(Launched {
            id: record.id,
            name,
            pid,
            exit_code,
        })
    }

    fn start_process(
        &self,
        name: &str,
        image: &str,
        volume: Option<&VolumeSpec>,
        options: &RunOptions,
    ) -> KeelResult<exec::Spawned> {
        let rootfs = self.rootfs.prepare(name, image, volume)?;
        let log = self.config.paths.container_log(name);

        exec::spawn(&SpawnOptions {
            rootfs: &rootfs,
            interactive: options.interactive,
            log: Some(&log),
            namespaces: NamespaceConfig::container(),
        })
    }

    async fn connect(
        &self,
        record: &mut ContainerRecord,
        network: &str,
        pid: u32,
    ) -> Option<Endpoint> {
        let result = async {
            let networks = NetworkManager::load(&self.config.paths)?;
            let mappings = parse_port_mappings(&record.port_mapping);
            networks.connect(network, &record.id, pid, mappings).await
        }
        .await;

        match result {
            Ok(endpoint) => {
                tracing::info!(
                    container = %record.name,
                    network,
                    ip = %endpoint.ip,
                    "Container connected"
                );
                record.network = Some(network.to_string());
                record.ip = Some(endpoint.ip.to_string());
                self.save_logged(record);
                Some(endpoint)
            }
            Err(e) => {
                tracing::error!(container = %record.name, network, error = %e, "Failed to connect container");
                None
            }
        }
    }

    /// Clean up after an attached container, whether or not waiting worked.
    async fn finish(
        &self,
        waited: KeelResult<i32>,
        record: &ContainerRecord,
        cgroup: &CgroupManager,
        endpoint: Option<&Endpoint>,
        volume: Option<&VolumeSpec>,
    ) -> KeelResult<i32> {
        match &waited {
            Ok(code) => tracing::info!(
                container = %record.name,
                pid = %record.pid,
                exit_code = code,
                "Container exited"
            ),
            Err(e) => tracing::error!(
                container = %record.name,
                pid = %record.pid,
                error = %e,
                "Failed to wait for container"
            ),
        }
        self.cleanup(record, cgroup, endpoint, volume).await;
        waited
    }

    /// Best-effort removal of everything a container owns.
    async fn cleanup(
        &self,
        record: &ContainerRecord,
        cgroup: &CgroupManager,
        endpoint: Option<&Endpoint>,
        volume: Option<&VolumeSpec>,
    ) {
        if let Err(e) = cgroup.destroy() {
            tracing::warn!(container = %record.name, error = %e, "Failed to remove cgroups");
        }

        if let Some(endpoint) = endpoint {
            let result = match NetworkManager::load(&self.config.paths) {
                Ok(networks) => networks.disconnect(endpoint).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!(container = %record.name, error = %e, "Failed to disconnect container");
            }
        }

        self.discard(&record.name, volume);
    }

    /// Tear down the rootfs and delete the record directory.
    fn discard(&self, name: &str, volume: Option<&VolumeSpec>) {
        if let Err(e) = self.rootfs.teardown(name, volume) {
            tracing::warn!(container = %name, error = %e, "Failed to remove rootfs");
        }
        if let Err(e) = self.state.delete(name) {
            tracing::warn!(container = %name, error = %e, "Failed to delete container record");
        }
    }

    fn save_logged(&self, record: &ContainerRecord) {
        if let Err(e) = self.state.save(record) {
            tracing::error!(container = %record.name, error = %e, "Failed to save container record");
        }
    }

    /// Send SIGTERM and mark the container stopped.
    pub fn stop(&self, name: &str) -> KeelResult<ContainerRecord> {
        let mut record = self.state.load(name)?;

        match record.pid() {
            Some(pid) => {
                if let Err(e) = exec::signal(pid, libc::SIGTERM) {
                    tracing::warn!(container = %name, pid, error = %e, "Failed to signal container");
                }
            }
            None => tracing::warn!(container = %name, "Container has no pid"),
        }

        record.mark_stopped();
        self.state.save(&record)?;

        tracing::info!(container = %name, "Container stopped");
        Ok(record)
    }

    /// Remove a stopped container and everything it owns.
    ///
    /// The container's address stays allocated in its network.
    pub async fn remove(&self, name: &str) -> KeelResult<()> {
        let record = self.state.load(name)?;
        if record.status != ContainerStatus::Stopped {
            return Err(KeelError::ContainerNotStopped {
                name: name.to_string(),
                status: record.status.to_string(),
            });
        }

        let endpoint = match (&record.network, &record.ip) {
            (Some(network), Some(ip)) => match ip.parse::<Ipv4Addr>() {
                Ok(ip) => Some(Endpoint::new(
                    &record.id,
                    network,
                    ip,
                    parse_port_mappings(&record.port_mapping),
                )),
                Err(e) => {
                    tracing::warn!(container = %name, ip = %ip, error = %e, "Ignoring bad address");
                    None
                }
            },
            _ => None,
        };
        let volume = VolumeSpec::parse_optional(&record.volume);

        self.cleanup(&record, &self.cgroup(name), endpoint.as_ref(), volume.as_ref())
            .await;

        tracing::info!(container = %name, "Container removed");
        Ok(())
    }

    /// All containers, with dead `running` ones refreshed to `exited`.
    pub fn list(&self) -> KeelResult<Vec<ContainerRecord>> {
        let mut records = self.state.list()?;

        for record in &mut records {
            if record.is_running() && !record.pid().is_some_and(exec::is_alive) {
                tracing::debug!(container = %record.name, "Container process is gone");
                record.mark_exited();
                self.save_logged(record);
            }
        }

        Ok(records)
    }

    /// Contents of a container's log.
    pub fn logs(&self, name: &str) -> KeelResult<String> {
        if !self.state.exists(name) {
            return Err(KeelError::ContainerNotFound {
                name: name.to_string(),
            });
        }

        match std::fs::read_to_string(self.config.paths.container_log(name)) {
            Ok(log) => Ok(log),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `command` inside a running container.
    pub async fn exec(&self, name: &str, command: &[String]) -> KeelResult<i32> {
        if command.iter().all(|arg| arg.trim().is_empty()) {
            return Err(KeelError::EmptyCommand);
        }

        let record = self.state.load(name)?;
        let pid = match record.pid() {
            Some(pid) if record.is_running() => pid,
            _ => {
                return Err(KeelError::InvalidArgument {
                    message: format!("container {name} is {}, not running", record.status),
                });
            }
        };

        exec::exec_in(pid, command).await
    }

    /// Archive a container's root as an image.
    pub fn commit(&self, name: &str, image: Option<&str>) -> KeelResult<PathBuf> {
        self.state.load(name)?;
        self.rootfs.commit(name, image.unwrap_or(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, ContainerManager) {
        let dir = tempfile::tempdir().unwrap();
        let mountinfo = dir.path().join("mountinfo");
        std::fs::write(&mountinfo, "").unwrap();
        let config = RuntimeConfig::default()
            .with_root(dir.path().join("root"))
            .with_mountinfo(mountinfo);
        (dir, ContainerManager::new(config))
    }

    fn save(manager: &ContainerManager, name: &str, status: ContainerStatus) -> ContainerRecord {
        let mut record = ContainerRecord::running("1234567890", name, 999_999_999, &["top".to_string()]);
        record.status = status;
        manager.state().save(&record).unwrap();
        record
    }

    #[test]
    fn validate_rejects_missing_command() {
        let options = RunOptions::default();
        assert!(matches!(
            options.validate(),
            Err(KeelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn validate_rejects_interactive_detach() {
        let options = RunOptions {
            command: vec!["sh".to_string()],
            interactive: true,
            detach: true,
            ..RunOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[tokio::test]
    async fn run_rejects_bad_name_before_spawning() {
        let (_dir, manager) = manager();
        let options = RunOptions {
            command: vec!["sh".to_string()],
            name: Some("bad name!".to_string()),
            ..RunOptions::default()
        };
        let err = manager.run(options).await.unwrap_err();
        assert!(matches!(err, KeelError::InvalidContainerId { .. }));
    }

    #[tokio::test]
    async fn run_without_image_leaves_nothing_behind() {
        let (_dir, manager) = manager();
        let options = RunOptions {
            command: vec!["sh".to_string()],
            name: Some("web".to_string()),
            detach: true,
            ..RunOptions::default()
        };
        let err = manager.run(options).await.unwrap_err();
        assert!(matches!(err, KeelError::SetupFailure { .. }));
        assert!(!manager.state().exists("web"));
        assert!(!manager.state().container_dir("web").exists());
    }

    #[test]
    fn stop_rewrites_record() {
        let (_dir, manager) = manager();
        let before = save(&manager, "web", ContainerStatus::Running);

        let after = manager.stop("web").unwrap();
        assert_eq!(after.status, ContainerStatus::Stopped);
        assert_eq!(after.pid, "");

        let stored = manager.state().load("web").unwrap();
        assert_eq!(stored, after);
        assert_eq!(stored.id, before.id);
        assert_eq!(stored.command, before.command);
        assert_eq!(stored.created_time, before.created_time);
    }

    #[test]
    fn stop_unknown_container() {
        let (_dir, manager) = manager();
        assert!(manager.stop("ghost").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn remove_refuses_running_container() {
        let (_dir, manager) = manager();
        let record = save(&manager, "web", ContainerStatus::Running);
        std::fs::write(manager.config().paths.container_log("web"), "log").unwrap();

        let err = manager.remove("web").await.unwrap_err();
        assert!(matches!(err, KeelError::ContainerNotStopped { .. }));
        assert_eq!(manager.state().load("web").unwrap(), record);
        assert!(manager.config().paths.container_log("web").exists());
    }

    #[tokio::test]
    async fn remove_deletes_stopped_container() {
        let (_dir, manager) = manager();
        save(&manager, "web", ContainerStatus::Stopped);

        manager.remove("web").await.unwrap();
        assert!(!manager.state().container_dir("web").exists());
    }

    #[test]
    fn list_marks_dead_containers_exited() {
        let (_dir, manager) = manager();
        save(&manager, "dead", ContainerStatus::Running);
        save(&manager, "halted", ContainerStatus::Stopped);

        let alive = ContainerRecord::running("1", "alive", std::process::id(), &["sh".to_string()]);
        manager.state().save(&alive).unwrap();

        let records = manager.list().unwrap();
        let status = |name: &str| records.iter().find(|r| r.name == name).unwrap().status;
        assert_eq!(status("dead"), ContainerStatus::Exited);
        assert_eq!(status("halted"), ContainerStatus::Stopped);
        assert_eq!(status("alive"), ContainerStatus::Running);

        assert_eq!(
            manager.state().load("dead").unwrap().status,
            ContainerStatus::Exited
        );
    }

    #[test]
    fn logs_reads_log_file() {
        let (_dir, manager) = manager();
        save(&manager, "web", ContainerStatus::Running);
        assert_eq!(manager.logs("web").unwrap(), "");

        std::fs::write(manager.config().paths.container_log("web"), "hello\n").unwrap();
        assert_eq!(manager.logs("web").unwrap(), "hello\n");
        assert!(manager.logs("ghost").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn exec_refuses_stopped_container() {
        let (_dir, manager) = manager();
        save(&manager, "web", ContainerStatus::Stopped);

        let err = manager.exec("web", &["ls".to_string()]).await.unwrap_err();
        assert!(matches!(err, KeelError::InvalidArgument { .. }));

        let err = manager.exec("web", &[]).await.unwrap_err();
        assert!(matches!(err, KeelError::EmptyCommand));
    }

    #[test]
    fn commit_requires_known_container() {
        let (_dir, manager) = manager();
        assert!(manager.commit("ghost", None).unwrap_err().is_not_found());

        save(&manager, "web", ContainerStatus::Running);
        let merged = manager.config().paths.overlay("web").join("merged");
        std::fs::create_dir_all(&merged).unwrap();
        std::fs::write(merged.join("file"), "x").unwrap();

        let archive = manager.commit("web", None).unwrap();
        assert_eq!(archive, manager.config().paths.image_archive("web"));
        assert!(archive.exists());
    }

    #[tokio::test]
    async fn failed_wait_still_cleans_up() {
        let (_dir, manager) = manager();
        let record = save(&manager, "web", ContainerStatus::Running);
        std::fs::write(manager.config().paths.container_log("web"), "out").unwrap();

        let waited = Err(KeelError::Internal {
            message: "wait interrupted".to_string(),
        });
        let result = manager
            .finish(waited, &record, &manager.cgroup("web"), None, None)
            .await;

        assert!(matches!(result, Err(KeelError::Internal { .. })));
        assert!(!manager.state().exists("web"));
        assert!(!manager.state().container_dir("web").exists());
    }
}
