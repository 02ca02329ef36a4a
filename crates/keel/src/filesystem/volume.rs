//! Host directory volumes.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use keel_common::{KeelError, KeelResult};

use super::mounts::{bind_mount, unmount};

/// A `hostPath:containerPath` bind volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Directory on the host.
    pub host: PathBuf,
    /// Mount point inside the container root.
    pub container: PathBuf,
}

impl VolumeSpec {
    /// Parse an optional volume argument, logging and dropping a malformed one.
    pub fn parse_optional(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        match raw.parse() {
            Ok(volume) => Some(volume),
            Err(e) => {
                tracing::warn!(volume = %raw, error = %e, "Skipping malformed volume");
                None
            }
        }
    }

    /// Where the volume lands under `root`.
    #[must_use]
    pub fn target_in(&self, root: &Path) -> PathBuf {
        root.join(self.container.strip_prefix("/").unwrap_or(&self.container))
    }

    /// Create both directories and bind the host path into `root`.
    pub fn mount(&self, root: &Path) -> KeelResult<()> {
        if leaves_root(&self.container) {
            return Err(malformed(&self.to_string(), "container path must stay inside the root"));
        }
        let target = self.target_in(root);
        std::fs::create_dir_all(&self.host)?;
        std::fs::create_dir_all(&target)?;
        bind_mount(&self.host, &target)?;

        tracing::info!(
            host = %self.host.display(),
            target = %target.display(),
            "Volume mounted"
        );
        Ok(())
    }

    /// Detach the volume from `root`.
    pub fn unmount(&self, root: &Path) -> KeelResult<()> {
        unmount(&self.target_in(root))
    }
}

fn leaves_root(path: &Path) -> bool {
    path.components().any(|c| c == Component::ParentDir)
}

fn malformed(input: &str, reason: &str) -> KeelError {
    KeelError::MalformedInput {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

impl FromStr for VolumeSpec {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [host, container] if !host.is_empty() && !container.is_empty() => {
                let container = PathBuf::from(container);
                if leaves_root(&container) {
                    return Err(malformed(s, "container path must stay inside the root"));
                }
                Ok(Self {
                    host: PathBuf::from(host),
                    container,
                })
            }
            _ => Err(malformed(s, "expected hostPath:containerPath")),
        }
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.container.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_container() {
        let volume: VolumeSpec = "/data:/mnt/data".parse().unwrap();
        assert_eq!(volume.host, PathBuf::from("/data"));
        assert_eq!(volume.container, PathBuf::from("/mnt/data"));
        assert_eq!(volume.to_string(), "/data:/mnt/data");
    }

    #[test]
    fn rejects_wrong_token_count() {
        for bad in ["/data", "/a:/b:/c", ":/b", "/a:"] {
            let err = bad.parse::<VolumeSpec>().unwrap_err();
            assert!(matches!(err, KeelError::MalformedInput { .. }), "{bad}");
        }
    }

    #[test]
    fn optional_parse_skips_blank_and_malformed() {
        assert!(VolumeSpec::parse_optional("").is_none());
        assert!(VolumeSpec::parse_optional("nocolon").is_none());
        assert!(VolumeSpec::parse_optional("/a:/b").is_some());
    }

    #[test]
    fn target_is_relative_to_root() {
        let volume: VolumeSpec = "/data:/mnt/data".parse().unwrap();
        assert_eq!(
            volume.target_in(Path::new("/merged")),
            PathBuf::from("/merged/mnt/data")
        );
    }

    #[test]
    fn rejects_container_path_outside_root() {
        for bad in ["/tmp/x:/../../../etc", "/tmp/x:/mnt/../../etc", "/tmp/x:.."] {
            let err = bad.parse::<VolumeSpec>().unwrap_err();
            assert!(matches!(err, KeelError::MalformedInput { .. }), "{bad}");
            assert!(VolumeSpec::parse_optional(bad).is_none());
        }
    }

    #[test]
    fn mount_refuses_constructed_escape() {
        let root = tempfile::tempdir().unwrap();
        let volume = VolumeSpec {
            host: root.path().join("host"),
            container: PathBuf::from("/../outside"),
        };
        let err = volume.mount(&root.path().join("merged")).unwrap_err();
        assert!(matches!(err, KeelError::MalformedInput { .. }));
        assert!(!root.path().join("outside").exists());
    }
}
