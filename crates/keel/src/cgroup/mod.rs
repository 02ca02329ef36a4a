//! Cgroup v1 resource control.
//!
//! A container owns one logical group, named after the container, under
//! the hierarchy of every subsystem it is limited by. Hierarchies are
//! found through the mount table, so no fixed `/sys/fs/cgroup` layout is
//! assumed.

mod manager;
mod mountinfo;
mod subsystems;

pub use manager::CgroupManager;
pub use mountinfo::{CgroupHierarchy, DEFAULT_MOUNTINFO, find_mountpoint};
pub use subsystems::{CpuSubsystem, CpusetSubsystem, MemorySubsystem, Subsystem};

/// Resource limits for one container.
///
/// `None` leaves the kernel default in place for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Memory limit, e.g. `100m`, written to `memory.limit_in_bytes`.
    pub memory_limit: Option<String>,
    /// Relative CPU weight written to `cpu.shares`.
    pub cpu_share: Option<String>,
    /// CPU list written to `cpuset.cpus`, e.g. `0-1`.
    pub cpu_set: Option<String>,
}

impl ResourceLimits {
    /// Build limits from optional user input, treating blank values as unset.
    #[must_use]
    pub fn new(
        memory_limit: Option<String>,
        cpu_share: Option<String>,
        cpu_set: Option<String>,
    ) -> Self {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Self {
            memory_limit: non_blank(memory_limit),
            cpu_share: non_blank(cpu_share),
            cpu_set: non_blank(cpu_set),
        }
    }

    /// Whether no dimension is constrained.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.memory_limit.is_none() && self.cpu_share.is_none() && self.cpu_set.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_are_unset() {
        let limits = ResourceLimits::new(Some("100m".into()), Some(String::new()), Some("  ".into()));
        assert_eq!(limits.memory_limit.as_deref(), Some("100m"));
        assert!(limits.cpu_share.is_none());
        assert!(limits.cpu_set.is_none());
        assert!(!limits.is_empty());
        assert!(ResourceLimits::default().is_empty());
    }
}
