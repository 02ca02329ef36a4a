//! Runtime configuration.

use std::path::PathBuf;

use keel_common::KeelPaths;

use crate::cgroup::CgroupHierarchy;

/// Image used when `run` is given none.
pub const DEFAULT_IMAGE: &str = "busybox";

/// Runtime configuration options.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Paths for runtime data.
    pub paths: KeelPaths,
    /// Mount table used to locate cgroup hierarchies.
    pub mountinfo: PathBuf,
    /// Image used when none is given.
    pub default_image: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            paths: KeelPaths::new(),
            mountinfo: PathBuf::from(crate::cgroup::DEFAULT_MOUNTINFO),
            default_image: DEFAULT_IMAGE.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Set the root directory.
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.paths = KeelPaths::with_root(root);
        self
    }

    /// Read cgroup mount points from another mount table.
    #[must_use]
    pub fn with_mountinfo(mut self, mountinfo: impl Into<PathBuf>) -> Self {
        self.mountinfo = mountinfo.into();
        self
    }

    /// Cgroup hierarchy lookup backed by [`RuntimeConfig::mountinfo`].
    #[must_use]
    pub fn hierarchy(&self) -> CgroupHierarchy {
        CgroupHierarchy::new(&self.mountinfo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.mountinfo, PathBuf::from("/proc/self/mountinfo"));
        assert_eq!(config.default_image, "busybox");
    }

    #[test]
    fn builder_pattern() {
        let config = RuntimeConfig::default()
            .with_root("/custom/root")
            .with_mountinfo("/tmp/mountinfo");

        assert_eq!(config.paths.root, PathBuf::from("/custom/root"));
        assert_eq!(config.mountinfo, PathBuf::from("/tmp/mountinfo"));
    }
}
