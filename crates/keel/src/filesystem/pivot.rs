#![allow(unsafe_code)]
//! pivot_root implementation.

use std::path::Path;

use keel_common::{KeelError, KeelResult};

use super::mounts::{make_rprivate, recursive_bind_mount, unmount};

/// Directory (relative to the new root) that briefly holds the old root.
const PUT_OLD: &str = ".pivot_root";

/// Execute pivot_root to change the root filesystem.
///
/// This replaces the old root with the new root, placing the old root
/// at put_old (relative to new_root).
pub fn pivot_root(new_root: &Path, put_old: &Path) -> KeelResult<()> {
    tracing::debug!(
        new_root = %new_root.display(),
        put_old = %put_old.display(),
        "Executing pivot_root"
    );

    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;

        let new_root_c = CString::new(new_root.to_string_lossy().as_bytes()).map_err(|e| {
            KeelError::Internal {
                message: format!("Invalid path: {e}"),
            }
        })?;
        let put_old_c = CString::new(put_old.to_string_lossy().as_bytes()).map_err(|e| {
            KeelError::Internal {
                message: format!("Invalid path: {e}"),
            }
        })?;

        // Safety: both pointers come from CStrings that outlive the call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_pivot_root,
                new_root_c.as_ptr(),
                put_old_c.as_ptr(),
            )
        };

        if ret != 0 {
            return Err(KeelError::SetupFailure {
                operation: "pivot_root".to_string(),
                message: std::io::Error::last_os_error().to_string(),
            });
        }

        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(KeelError::Unsupported {
            feature: "pivot_root".to_string(),
        })
    }
}

/// Make `root` the process root and drop every trace of the old one.
///
/// Must run inside a fresh mount namespace. The root is recursively bind
/// mounted onto itself so it becomes a mount point that still carries any
/// volume mounted below it. Then it is pivoted, and the old root is
/// detached and its placeholder directory removed.
pub fn enter_rootfs(root: &Path) -> KeelResult<()> {
    tracing::debug!(root = %root.display(), "Entering container root");

    make_rprivate()?;
    recursive_bind_mount(root, root)?;

    let put_old = root.join(PUT_OLD);
    std::fs::create_dir_all(&put_old)?;

    pivot_root(root, &put_old)?;
    std::env::set_current_dir("/")?;

    let old_root = Path::new("/").join(PUT_OLD);
    unmount(&old_root)?;
    std::fs::remove_dir(&old_root)?;

    Ok(())
}
