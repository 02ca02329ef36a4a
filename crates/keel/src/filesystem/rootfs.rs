//! Container root filesystems built from image archives.

use std::fs::{self, File};
use std::path::PathBuf;

use keel_common::{KeelError, KeelPaths, KeelResult};

use super::overlay::OverlayFs;
use super::volume::VolumeSpec;

/// Prepares and tears down the root filesystem of a named container.
pub trait RootfsProvider: Send + Sync {
    /// Build the root for `name` from `image` and return the path to pivot into.
    fn prepare(&self, name: &str, image: &str, volume: Option<&VolumeSpec>)
    -> KeelResult<PathBuf>;

    /// Undo [`RootfsProvider::prepare`]. Missing mounts are not an error.
    fn teardown(&self, name: &str, volume: Option<&VolumeSpec>) -> KeelResult<()>;

    /// Archive the current root of `name` as image `image`.
    fn commit(&self, name: &str, image: &str) -> KeelResult<PathBuf>;
}

/// Overlay-backed rootfs: a shared, extracted image layer under a
/// per-container writable layer.
#[derive(Debug, Clone)]
pub struct OverlayRootfs {
    paths: KeelPaths,
}

impl OverlayRootfs {
    /// Create a provider rooted at `paths`.
    #[must_use]
    pub fn new(paths: KeelPaths) -> Self {
        Self { paths }
    }

    fn overlay(&self, name: &str, image: &str) -> OverlayFs {
        OverlayFs::for_container(&self.paths.overlay(name), self.paths.layer(image))
    }

    /// Unpack `images/<image>.tar` into `layers/<image>` unless already done.
    pub fn extract_image(&self, image: &str) -> KeelResult<PathBuf> {
        let dest = self.paths.layer(image);
        if dest.exists() {
            return Ok(dest);
        }

        let archive_path = self.paths.image_archive(image);
        let file = File::open(&archive_path).map_err(|e| KeelError::SetupFailure {
            operation: "image extraction".to_string(),
            message: format!("{}: {e}", archive_path.display()),
        })?;

        tracing::debug!(image, archive = %archive_path.display(), "Extracting image");

        fs::create_dir_all(&dest)?;
        let mut archive = tar::Archive::new(file);
        archive.set_preserve_permissions(true);
        if let Err(e) = archive.unpack(&dest) {
            let _ = fs::remove_dir_all(&dest);
            return Err(KeelError::SetupFailure {
                operation: "image extraction".to_string(),
                message: e.to_string(),
            });
        }

        Ok(dest)
    }
}

impl RootfsProvider for OverlayRootfs {
    fn prepare(
        &self,
        name: &str,
        image: &str,
        volume: Option<&VolumeSpec>,
    ) -> KeelResult<PathBuf> {
        self.extract_image(image)?;

        let overlay = self.overlay(name, image);
        overlay.mount()?;

        if let Some(volume) = volume {
            volume.mount(&overlay.merged_dir)?;
        }

        Ok(overlay.merged_dir)
    }

    fn teardown(&self, name: &str, volume: Option<&VolumeSpec>) -> KeelResult<()> {
        let dir = self.paths.overlay(name);
        if !dir.exists() {
            return Ok(());
        }

        // The lower dir only matters when mounting.
        let overlay = OverlayFs::for_container(&dir, PathBuf::new());

        if let Some(volume) = volume {
            if let Err(e) = volume.unmount(&overlay.merged_dir) {
                tracing::warn!(container = %name, error = %e, "Failed to unmount volume");
            }
        }
        if let Err(e) = overlay.unmount() {
            tracing::warn!(container = %name, error = %e, "Failed to unmount overlay");
        }

        fs::remove_dir_all(&dir)?;
        tracing::debug!(container = %name, "Rootfs removed");
        Ok(())
    }

    fn commit(&self, name: &str, image: &str) -> KeelResult<PathBuf> {
        let merged = self.paths.overlay(name).join("merged");
        if !merged.is_dir() {
            return Err(KeelError::ContainerNotFound {
                name: name.to_string(),
            });
        }

        let images = self.paths.images();
        fs::create_dir_all(&images)?;

        let target = self.paths.image_archive(image);
        let tmp = tempfile::NamedTempFile::new_in(&images)?;
        {
            let mut builder = tar::Builder::new(tmp.as_file());
            builder.follow_symlinks(false);
            builder.append_dir_all(".", &merged)?;
            builder.finish()?;
        }
        tmp.persist(&target).map_err(|e| KeelError::Io(e.error))?;

        tracing::info!(container = %name, archive = %target.display(), "Container committed");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_image(paths: &KeelPaths, image: &str) {
        fs::create_dir_all(paths.images()).unwrap();
        let file = File::create(paths.image_archive(image)).unwrap();
        let mut builder = tar::Builder::new(file);
        let data = b"hello from busybox";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/motd", &data[..])
            .unwrap();
        builder.finish().unwrap();
    }

    #[test]
    fn extract_image_unpacks_once() {
        let dir = tempfile::tempdir().unwrap();
        let paths = KeelPaths::with_root(dir.path());
        write_image(&paths, "busybox");

        let rootfs = OverlayRootfs::new(paths.clone());
        let layer = rootfs.extract_image("busybox").unwrap();
        assert_eq!(
            fs::read_to_string(layer.join("etc/motd")).unwrap(),
            "hello from busybox"
        );

        // A second call must not touch the existing layer.
        fs::write(layer.join("marker"), "x").unwrap();
        rootfs.extract_image("busybox").unwrap();
        assert!(layer.join("marker").exists());
    }

    #[test]
    fn extract_missing_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = OverlayRootfs::new(KeelPaths::with_root(dir.path()));
        let err = rootfs.extract_image("nope").unwrap_err();
        assert!(matches!(err, KeelError::SetupFailure { .. }));
        assert!(!dir.path().join("layers/nope").exists());
    }

    #[test]
    fn teardown_without_overlay_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = OverlayRootfs::new(KeelPaths::with_root(dir.path()));
        rootfs.teardown("ghost", None).unwrap();
    }

    #[test]
    fn teardown_removes_overlay_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = KeelPaths::with_root(dir.path());
        fs::create_dir_all(paths.overlay("web").join("merged")).unwrap();

        OverlayRootfs::new(paths.clone())
            .teardown("web", None)
            .unwrap();
        assert!(!paths.overlay("web").exists());
    }

    #[test]
    fn commit_archives_merged_dir() {
        let dir = tempfile::tempdir().unwrap();
        let paths = KeelPaths::with_root(dir.path());
        let merged = paths.overlay("web").join("merged");
        fs::create_dir_all(merged.join("srv")).unwrap();
        fs::write(merged.join("srv/index.html"), "hi").unwrap();

        let archive = OverlayRootfs::new(paths.clone())
            .commit("web", "web-snapshot")
            .unwrap();
        assert_eq!(archive, paths.image_archive("web-snapshot"));

        let mut entries = tar::Archive::new(File::open(&archive).unwrap());
        let names: Vec<String> = entries
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("srv/index.html")));
    }

    #[test]
    fn commit_unknown_container_fails() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = OverlayRootfs::new(KeelPaths::with_root(dir.path()));
        let err = rootfs.commit("ghost", "img").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    #[ignore = "requires root and overlayfs"]
    fn prepare_mounts_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let paths = KeelPaths::with_root(dir.path());
        write_image(&paths, "busybox");

        let rootfs = OverlayRootfs::new(paths);
        let merged = rootfs.prepare("web", "busybox", None).unwrap();
        assert!(merged.join("etc/motd").exists());
        rootfs.teardown("web", None).unwrap();
    }
}
