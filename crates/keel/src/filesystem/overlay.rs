//! OverlayFS setup for container rootfs.

use std::path::{Path, PathBuf};

use keel_common::KeelResult;

use super::mounts;

/// OverlayFS configuration.
#[derive(Debug, Clone)]
pub struct OverlayFs {
    /// Read-only image layer.
    pub lower_dir: PathBuf,
    /// Upper directory (writable layer).
    pub upper_dir: PathBuf,
    /// Work directory (required by overlayfs).
    pub work_dir: PathBuf,
    /// Merged mount point.
    pub merged_dir: PathBuf,
}

impl OverlayFs {
    /// Lay out `upper`, `work` and `merged` under `container_dir`.
    pub fn for_container(container_dir: &Path, lower_dir: PathBuf) -> Self {
        Self {
            lower_dir,
            upper_dir: container_dir.join("upper"),
            work_dir: container_dir.join("work"),
            merged_dir: container_dir.join("merged"),
        }
    }

    /// Create necessary directories.
    pub fn create_dirs(&self) -> KeelResult<()> {
        std::fs::create_dir_all(&self.upper_dir)?;
        std::fs::create_dir_all(&self.work_dir)?;
        std::fs::create_dir_all(&self.merged_dir)?;
        Ok(())
    }

    /// Mount the overlay filesystem.
    pub fn mount(&self) -> KeelResult<()> {
        self.create_dirs()?;

        let options = self.mount_options();
        tracing::debug!(
            merged = %self.merged_dir.display(),
            options = %options,
            "Mounting overlayfs"
        );

        mounts::mount(
            Some("overlay"),
            &self.merged_dir,
            Some("overlay"),
            0,
            Some(&options),
        )?;

        tracing::info!(merged = %self.merged_dir.display(), "OverlayFS mounted");
        Ok(())
    }

    /// Unmount the overlay filesystem.
    pub fn unmount(&self) -> KeelResult<()> {
        tracing::debug!(merged = %self.merged_dir.display(), "Unmounting overlayfs");
        mounts::unmount(&self.merged_dir)
    }

    /// Get the mount options string.
    #[must_use]
    pub fn mount_options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower_dir.display(),
            self.upper_dir.display(),
            self.work_dir.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_mount_options() {
        let overlay = OverlayFs::for_container(
            Path::new("/keel/overlay/web"),
            PathBuf::from("/keel/layers/busybox"),
        );

        assert_eq!(
            overlay.mount_options(),
            "lowerdir=/keel/layers/busybox,upperdir=/keel/overlay/web/upper,workdir=/keel/overlay/web/work"
        );
        assert_eq!(overlay.merged_dir, PathBuf::from("/keel/overlay/web/merged"));
    }

    #[test]
    fn create_dirs_builds_layout() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = OverlayFs::for_container(dir.path(), dir.path().join("lower"));
        overlay.create_dirs().unwrap();

        assert!(dir.path().join("upper").is_dir());
        assert!(dir.path().join("work").is_dir());
        assert!(dir.path().join("merged").is_dir());
    }
}
