//! Standard filesystem paths for Keel.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Keel runtime state.
pub static KEEL_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KEEL_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/run/keel"))
});

/// File name of a persisted container record, inside [`KeelPaths::container`].
pub const CONTAINER_CONFIG: &str = "config.json";

/// File name of a detached container's log.
pub const CONTAINER_LOG: &str = "container.log";

/// Standard paths used by the Keel runtime.
#[derive(Debug, Clone)]
pub struct KeelPaths {
    /// Root state directory (default: /var/run/keel).
    pub root: PathBuf,
}

impl KeelPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding one subdirectory per container.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, name: &str) -> PathBuf {
        self.containers().join(name)
    }

    /// Container stdout log (detached containers only).
    #[must_use]
    pub fn container_log(&self, name: &str) -> PathBuf {
        self.container(name).join(CONTAINER_LOG)
    }

    /// Directory of persisted network records.
    #[must_use]
    pub fn networks(&self) -> PathBuf {
        self.root.join("network").join("network")
    }

    /// IPAM bitmap file.
    #[must_use]
    pub fn ipam(&self) -> PathBuf {
        self.root.join("network").join("ipam").join("subnet.json")
    }

    /// Directory of image archives.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Archive for an image.
    #[must_use]
    pub fn image_archive(&self, image: &str) -> PathBuf {
        self.images().join(format!("{image}.tar"))
    }

    /// Extracted read-only layer for an image.
    #[must_use]
    pub fn layer(&self, image: &str) -> PathBuf {
        self.root.join("layers").join(image)
    }

    /// Per-container overlay directory.
    #[must_use]
    pub fn overlay(&self, name: &str) -> PathBuf {
        self.root.join("overlay").join(name)
    }
}

impl Default for KeelPaths {
    fn default() -> Self {
        Self {
            root: KEEL_ROOT.clone(),
        }
    }
}
