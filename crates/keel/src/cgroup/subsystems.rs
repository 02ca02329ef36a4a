//! The cgroup v1 subsystems a container can be limited by.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use keel_common::{KeelError, KeelResult};

use super::ResourceLimits;

/// Task list control file, present in every v1 hierarchy.
const TASKS: &str = "tasks";

/// One v1 controller.
///
/// `group` is always the container's directory inside this subsystem's
/// hierarchy, already resolved by the caller.
pub trait Subsystem: Send + Sync {
    /// Controller name as it appears in the mount table.
    fn name(&self) -> &'static str;

    /// Write this subsystem's share of `limits`. Unset fields write nothing.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::ResourceFailure`] if a control file write fails.
    fn set(&self, group: &Path, limits: &ResourceLimits) -> KeelResult<()>;

    /// Whether `limits` has anything for this subsystem to write.
    fn wants(&self, limits: &ResourceLimits) -> bool;

    /// Move `pid` into the group.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::ResourceFailure`] if the task list write fails.
    fn apply(&self, group: &Path, pid: u32) -> KeelResult<()> {
        write_control(self.name(), group, TASKS, &pid.to_string())
    }

    /// Remove the group directory. A missing directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::ResourceFailure`] if the directory exists but
    /// cannot be removed.
    fn remove(&self, group: &Path) -> KeelResult<()> {
        let result = match fs::remove_dir(group) {
            Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty => fs::remove_dir_all(group),
            other => other,
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeelError::ResourceFailure {
                subsystem: self.name().to_string(),
                message: format!("Failed to remove {}: {e}", group.display()),
            }),
        }
    }
}

fn write_control(subsystem: &str, group: &Path, file: &str, value: &str) -> KeelResult<()> {
    let path = group.join(file);
    fs::write(&path, value).map_err(|e| KeelError::ResourceFailure {
        subsystem: subsystem.to_string(),
        message: format!("Failed to write {value} to {}: {e}", path.display()),
    })?;
    tracing::debug!(subsystem, path = %path.display(), value, "Wrote cgroup control file");
    Ok(())
}

fn read_control(group: &Path, file: &str) -> Option<String> {
    fs::read_to_string(group.join(file))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Hard memory limit.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemorySubsystem;

impl Subsystem for MemorySubsystem {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn wants(&self, limits: &ResourceLimits) -> bool {
        limits.memory_limit.is_some()
    }

    fn set(&self, group: &Path, limits: &ResourceLimits) -> KeelResult<()> {
        if let Some(limit) = &limits.memory_limit {
            write_control(self.name(), group, "memory.limit_in_bytes", limit)?;
        }
        Ok(())
    }
}

/// Relative CPU weight.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuSubsystem;

impl Subsystem for CpuSubsystem {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn wants(&self, limits: &ResourceLimits) -> bool {
        limits.cpu_share.is_some()
    }

    fn set(&self, group: &Path, limits: &ResourceLimits) -> KeelResult<()> {
        if let Some(shares) = &limits.cpu_share {
            write_control(self.name(), group, "cpu.shares", shares)?;
        }
        Ok(())
    }
}

/// CPU pinning.
///
/// A cpuset group accepts no tasks until both `cpuset.cpus` and
/// `cpuset.mems` are populated, so `set` inherits the memory nodes of the
/// parent group and `apply` is skipped for groups without a CPU list.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpusetSubsystem;

impl Subsystem for CpusetSubsystem {
    fn name(&self) -> &'static str {
        "cpuset"
    }

    fn wants(&self, limits: &ResourceLimits) -> bool {
        limits.cpu_set.is_some()
    }

    fn set(&self, group: &Path, limits: &ResourceLimits) -> KeelResult<()> {
        let Some(cpus) = &limits.cpu_set else {
            return Ok(());
        };
        write_control(self.name(), group, "cpuset.cpus", cpus)?;

        if read_control(group, "cpuset.mems").is_none() {
            match group.parent().and_then(|p| read_control(p, "cpuset.mems")) {
                Some(mems) => write_control(self.name(), group, "cpuset.mems", &mems)?,
                None => tracing::debug!(group = %group.display(), "Parent has no cpuset.mems"),
            }
        }
        Ok(())
    }

    fn apply(&self, group: &Path, pid: u32) -> KeelResult<()> {
        if read_control(group, "cpuset.cpus").is_none() {
            tracing::debug!(group = %group.display(), "No CPU list configured, skipping cpuset");
            return Ok(());
        }
        write_control(self.name(), group, TASKS, &pid.to_string())
    }
}
