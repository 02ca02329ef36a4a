#![allow(unsafe_code)]
//! Mount operations used while building a container root.

use std::ffi::CString;
use std::path::Path;

use keel_common::{KeelError, KeelResult};

/// Flags for the private `/proc` inside the container.
#[cfg(target_os = "linux")]
const PROC_FLAGS: libc::c_ulong = libc::MS_NOEXEC | libc::MS_NOSUID | libc::MS_NODEV;

/// Flags for the `tmpfs` mounted on `/dev`.
#[cfg(target_os = "linux")]
const DEV_FLAGS: libc::c_ulong = libc::MS_NOSUID | libc::MS_STRICTATIME;

fn c_string(value: &str) -> KeelResult<CString> {
    CString::new(value).map_err(|e| KeelError::Internal {
        message: format!("Invalid mount argument {value:?}: {e}"),
    })
}

fn c_path(path: &Path) -> KeelResult<CString> {
    c_string(&path.to_string_lossy())
}

fn setup_error(operation: &str, target: &Path, err: impl std::fmt::Display) -> KeelError {
    KeelError::SetupFailure {
        operation: operation.to_string(),
        message: format!("{}: {err}", target.display()),
    }
}

/// Mount a filesystem.
///
/// `source`, `fstype` and `data` may be omitted, in which case a null
/// pointer is handed to the kernel.
#[cfg(target_os = "linux")]
pub fn mount(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> KeelResult<()> {
    tracing::debug!(
        source = ?source,
        target = %target.display(),
        fstype = ?fstype,
        flags,
        "Mounting filesystem"
    );

    let source_c = source.map(c_string).transpose()?;
    let target_c = c_path(target)?;
    let fstype_c = fstype.map(c_string).transpose()?;
    let data_c = data.map(c_string).transpose()?;

    // Safety: every pointer is either null or a live NUL-terminated string.
    let ret = unsafe {
        libc::mount(
            source_c.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            target_c.as_ptr(),
            fstype_c.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
            flags,
            data_c
                .as_ref()
                .map_or(std::ptr::null(), |s| s.as_ptr().cast::<libc::c_void>()),
        )
    };

    if ret != 0 {
        return Err(setup_error(
            "mount",
            target,
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mount(
    _source: Option<&str>,
    _target: &Path,
    _fstype: Option<&str>,
    _flags: u64,
    _data: Option<&str>,
) -> KeelResult<()> {
    Err(KeelError::Unsupported {
        feature: "mount".to_string(),
    })
}

/// Make the whole mount tree private so nothing propagates back to the host.
#[cfg(target_os = "linux")]
pub fn make_rprivate() -> KeelResult<()> {
    mount(
        None,
        Path::new("/"),
        None,
        libc::MS_PRIVATE | libc::MS_REC,
        None,
    )
}

#[cfg(not(target_os = "linux"))]
pub fn make_rprivate() -> KeelResult<()> {
    Err(KeelError::Unsupported {
        feature: "mount propagation".to_string(),
    })
}

/// Bind mount `source` onto `target`.
#[cfg(target_os = "linux")]
pub fn bind_mount(source: &Path, target: &Path) -> KeelResult<()> {
    use rustix::mount::mount_bind;

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "Creating bind mount"
    );

    mount_bind(source, target).map_err(|e| setup_error("bind mount", target, e))
}

#[cfg(not(target_os = "linux"))]
pub fn bind_mount(_source: &Path, _target: &Path) -> KeelResult<()> {
    Err(KeelError::Unsupported {
        feature: "bind mounts".to_string(),
    })
}

/// Bind mount `source` onto `target` together with every mount below it.
#[cfg(target_os = "linux")]
pub fn recursive_bind_mount(source: &Path, target: &Path) -> KeelResult<()> {
    use rustix::mount::mount_bind_recursive;

    tracing::debug!(
        source = %source.display(),
        target = %target.display(),
        "Creating recursive bind mount"
    );

    mount_bind_recursive(source, target).map_err(|e| setup_error("rbind mount", target, e))
}

#[cfg(not(target_os = "linux"))]
pub fn recursive_bind_mount(_source: &Path, _target: &Path) -> KeelResult<()> {
    Err(KeelError::Unsupported {
        feature: "bind mounts".to_string(),
    })
}

/// Mount a fresh `proc` on `<root>/proc`.
#[cfg(target_os = "linux")]
pub fn mount_proc(root: &Path) -> KeelResult<()> {
    let target = root.join("proc");
    std::fs::create_dir_all(&target)?;
    mount(Some("proc"), &target, Some("proc"), PROC_FLAGS, None)
}

#[cfg(not(target_os = "linux"))]
pub fn mount_proc(_root: &Path) -> KeelResult<()> {
    Err(KeelError::Unsupported {
        feature: "proc mount".to_string(),
    })
}

/// Mount a `tmpfs` on `<root>/dev`.
#[cfg(target_os = "linux")]
pub fn mount_dev(root: &Path) -> KeelResult<()> {
    let target = root.join("dev");
    std::fs::create_dir_all(&target)?;
    mount(
        Some("tmpfs"),
        &target,
        Some("tmpfs"),
        DEV_FLAGS,
        Some("mode=755"),
    )
}

#[cfg(not(target_os = "linux"))]
pub fn mount_dev(_root: &Path) -> KeelResult<()> {
    Err(KeelError::Unsupported {
        feature: "tmpfs mount".to_string(),
    })
}

/// Lazily detach a mount. A path that is not mounted is not an error.
#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> KeelResult<()> {
    use rustix::mount::{UnmountFlags, unmount};

    tracing::debug!(target = %target.display(), "Unmounting filesystem");

    match unmount(target, UnmountFlags::DETACH) {
        Ok(()) | Err(rustix::io::Errno::INVAL | rustix::io::Errno::NOENT) => Ok(()),
        Err(e) => Err(KeelError::Io(e.into())),
    }
}

#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> KeelResult<()> {
    Err(KeelError::Unsupported {
        feature: "unmount".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_interior_nul() {
        let err = c_string("bad\0path").unwrap_err();
        assert!(matches!(err, KeelError::Internal { .. }));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn unmount_of_plain_directory_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        // EINVAL for "not a mount point"; EPERM without privileges.
        match unmount(dir.path()) {
            Ok(()) | Err(KeelError::Io(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    #[cfg(target_os = "linux")]
    #[ignore = "requires root"]
    fn recursive_bind_keeps_submounts() {
        let root = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        std::fs::write(host.path().join("file"), "data").unwrap();
        let data = root.path().join("data");
        std::fs::create_dir_all(&data).unwrap();

        // A private mount namespace for this thread only.
        assert_eq!(unsafe { libc::unshare(libc::CLONE_NEWNS) }, 0);
        make_rprivate().unwrap();

        bind_mount(host.path(), &data).unwrap();
        recursive_bind_mount(root.path(), root.path()).unwrap();
        assert!(data.join("file").exists());

        unmount(root.path()).unwrap();
        unmount(&data).unwrap();
    }
}
