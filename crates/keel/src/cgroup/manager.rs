//! Cgroup manager implementation.

use std::path::PathBuf;

use keel_common::{KeelError, KeelResult};

use super::mountinfo::CgroupHierarchy;
use super::subsystems::{CpuSubsystem, CpusetSubsystem, MemorySubsystem, Subsystem};
use super::ResourceLimits;

/// Manages one container's group across the cpuset, memory and cpu
/// hierarchies.
///
/// Failures in one subsystem never stop the others; they are logged and
/// reported together as a single [`KeelError::ResourceFailure`].
pub struct CgroupManager {
    /// Logical group name, shared by every subsystem.
    group: String,
    hierarchy: CgroupHierarchy,
    subsystems: Vec<Box<dyn Subsystem>>,
}

impl std::fmt::Debug for CgroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgroupManager")
            .field("group", &self.group)
            .field("hierarchy", &self.hierarchy)
            .field(
                "subsystems",
                &self.subsystems.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CgroupManager {
    /// Create a manager for `group` using the host mount table.
    #[must_use]
    pub fn new(group: &str) -> Self {
        Self::with_hierarchy(group, CgroupHierarchy::default())
    }

    /// Create a manager for `group` resolving hierarchies through `hierarchy`.
    #[must_use]
    pub fn with_hierarchy(group: &str, hierarchy: CgroupHierarchy) -> Self {
        Self {
            group: group.to_string(),
            hierarchy,
            subsystems: vec![
                Box::new(CpusetSubsystem),
                Box::new(MemorySubsystem),
                Box::new(CpuSubsystem),
            ],
        }
    }

    /// The logical group name.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Directory of the group in `subsystem`'s hierarchy.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::ResourceFailure`] if the hierarchy is not mounted.
    pub fn path(&self, subsystem: &str) -> KeelResult<PathBuf> {
        self.hierarchy.group_path(subsystem, &self.group, false)
    }

    /// Write `limits` into every subsystem that has something to write.
    ///
    /// # Errors
    ///
    /// Returns a combined [`KeelError::ResourceFailure`] if any subsystem fails.
    pub fn set(&self, limits: &ResourceLimits) -> KeelResult<()> {
        self.for_each("set", |subsystem| {
            if !subsystem.wants(limits) {
                return Ok(());
            }
            let path = self.hierarchy.group_path(subsystem.name(), &self.group, true)?;
            subsystem.set(&path, limits)
        })
    }

    /// Move `pid` into the group of every subsystem.
    ///
    /// # Errors
    ///
    /// Returns a combined [`KeelError::ResourceFailure`] if any subsystem fails.
    pub fn apply(&self, pid: u32) -> KeelResult<()> {
        self.for_each("apply", |subsystem| {
            let path = self.hierarchy.group_path(subsystem.name(), &self.group, true)?;
            subsystem.apply(&path, pid)
        })
    }

    /// Remove the group from every hierarchy. Safe to call repeatedly.
    ///
    /// Unmounted hierarchies have nothing to remove and are skipped.
    ///
    /// # Errors
    ///
    /// Returns a combined [`KeelError::ResourceFailure`] if an existing group
    /// cannot be removed.
    pub fn destroy(&self) -> KeelResult<()> {
        self.for_each("destroy", |subsystem| {
            match self.hierarchy.group_path(subsystem.name(), &self.group, false) {
                Ok(path) => subsystem.remove(&path),
                Err(e) => {
                    tracing::debug!(subsystem = subsystem.name(), error = %e, "Nothing to remove");
                    Ok(())
                }
            }
        })
    }

    fn for_each(
        &self,
        operation: &str,
        mut f: impl FnMut(&dyn Subsystem) -> KeelResult<()>,
    ) -> KeelResult<()> {
        let mut failed = Vec::new();
        let mut messages = Vec::new();

        for subsystem in &self.subsystems {
            if let Err(e) = f(subsystem.as_ref()) {
                tracing::warn!(
                    group = %self.group,
                    subsystem = subsystem.name(),
                    operation,
                    error = %e,
                    "Cgroup operation failed"
                );
                failed.push(subsystem.name());
                messages.push(e.to_string());
            }
        }

        if failed.is_empty() {
            tracing::debug!(group = %self.group, operation, "Cgroup operation complete");
            Ok(())
        } else {
            Err(KeelError::ResourceFailure {
                subsystem: failed.join(","),
                message: messages.join("; "),
            })
        }
    }
}
