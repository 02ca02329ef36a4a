//! Cgroup hierarchy discovery through the mount table.

use std::path::{Path, PathBuf};

use keel_common::{KeelError, KeelResult};

/// Default mount table of the calling process.
pub const DEFAULT_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Find where the v1 hierarchy carrying `subsystem` is mounted.
///
/// A mountinfo line looks like
/// `34 25 0:29 / /sys/fs/cgroup/memory rw,relatime shared:15 - cgroup cgroup rw,memory`;
/// the mount point is the fifth field and the controllers are listed in
/// the super options after the `-` separator.
#[must_use]
pub fn find_mountpoint(mountinfo: &str, subsystem: &str) -> Option<PathBuf> {
    mountinfo.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let separator = fields.iter().position(|f| *f == "-")?;
        let fstype = fields.get(separator + 1)?;
        let super_options = fields.get(separator + 3)?;

        if *fstype != "cgroup" || !super_options.split(',').any(|opt| opt == subsystem) {
            return None;
        }
        fields.get(4).map(PathBuf::from)
    })
}

/// Resolves logical group names to directories of each subsystem hierarchy.
#[derive(Debug, Clone)]
pub struct CgroupHierarchy {
    mountinfo: PathBuf,
}

impl Default for CgroupHierarchy {
    fn default() -> Self {
        Self::new(DEFAULT_MOUNTINFO)
    }
}

impl CgroupHierarchy {
    /// Use the mount table at `mountinfo`.
    pub fn new(mountinfo: impl Into<PathBuf>) -> Self {
        Self {
            mountinfo: mountinfo.into(),
        }
    }

    /// Mount point of the hierarchy for `subsystem`.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::ResourceFailure`] if the mount table cannot be
    /// read or the subsystem is not mounted.
    pub fn mountpoint(&self, subsystem: &str) -> KeelResult<PathBuf> {
        let table = std::fs::read_to_string(&self.mountinfo).map_err(|e| {
            KeelError::ResourceFailure {
                subsystem: subsystem.to_string(),
                message: format!("Failed to read {}: {e}", self.mountinfo.display()),
            }
        })?;

        find_mountpoint(&table, subsystem).ok_or_else(|| KeelError::ResourceFailure {
            subsystem: subsystem.to_string(),
            message: "cgroup hierarchy is not mounted".to_string(),
        })
    }

    /// Directory of `group` under the `subsystem` hierarchy, created on demand.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::ResourceFailure`] if the hierarchy is missing or
    /// the directory cannot be created.
    pub fn group_path(&self, subsystem: &str, group: &str, create: bool) -> KeelResult<PathBuf> {
        let path = self.mountpoint(subsystem)?.join(group);
        if create {
            ensure_dir(&path).map_err(|e| KeelError::ResourceFailure {
                subsystem: subsystem.to_string(),
                message: format!("Failed to create {}: {e}", path.display()),
            })?;
        }
        Ok(path)
    }
}

fn ensure_dir(path: &Path) -> std::io::Result<()> {
    match std::fs::create_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::AlreadyExists => Err(e),
        _ => Ok(()),
    }
}
