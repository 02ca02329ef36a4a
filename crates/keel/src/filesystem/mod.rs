//! Filesystem operations for containers.
//!
//! This module handles:
//! - Image extraction and the overlay rootfs of each container
//! - Host directory volumes
//! - Mount operations and pivot_root

mod mounts;
mod overlay;
mod pivot;
mod rootfs;
mod volume;

pub use mounts::{
    bind_mount, make_rprivate, mount_dev, mount_proc, recursive_bind_mount, unmount,
};
pub use overlay::OverlayFs;
pub use pivot::{enter_rootfs, pivot_root};
pub use rootfs::{OverlayRootfs, RootfsProvider};
pub use volume::VolumeSpec;
