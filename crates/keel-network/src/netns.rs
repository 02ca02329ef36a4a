#![allow(unsafe_code)]
//! Network namespace switching.
//!
//! Namespace membership belongs to an OS thread, so every switch happens
//! on a dedicated thread that does nothing but the requested work and is
//! always moved back to its original namespace before it exits.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use keel_common::{KeelError, KeelResult};

/// Path of a process's network namespace handle.
#[must_use]
pub fn netns_path(pid: u32) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}

/// Open the network namespace of `pid`.
///
/// # Errors
///
/// Returns [`KeelError::NetworkFailure`] if the handle cannot be opened.
pub fn open_netns(pid: u32) -> KeelResult<File> {
    let path = netns_path(pid);
    File::open(&path).map_err(|e| KeelError::NetworkFailure {
        message: format!("Failed to open {}: {e}", path.display()),
    })
}

/// Membership of the current thread in a foreign network namespace.
///
/// Dropping the guard moves the thread back into the namespace it was in
/// when the guard was created.
#[derive(Debug)]
pub struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    /// Move the current thread into `target`.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::NetworkFailure`] if the current namespace cannot
    /// be recorded or `setns` fails.
    pub fn enter(target: &File) -> KeelResult<Self> {
        let original = File::open("/proc/thread-self/ns/net").map_err(|e| {
            KeelError::NetworkFailure {
                message: format!("Failed to record current network namespace: {e}"),
            }
        })?;

        set_netns(target)?;
        tracing::debug!("Entered container network namespace");
        Ok(Self { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        match set_netns(&self.original) {
            Ok(()) => tracing::debug!("Restored original network namespace"),
            Err(e) => tracing::error!(error = %e, "Failed to restore network namespace"),
        }
    }
}

fn set_netns(ns: &File) -> KeelResult<()> {
    // SAFETY: the descriptor is owned by `ns` and valid for this call.
    let ret = unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNET) };
    if ret != 0 {
        return Err(KeelError::NetworkFailure {
            message: format!("setns failed: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(())
}

/// Run `f` on a dedicated thread inside the network namespace of `pid`.
///
/// The caller's thread never changes namespace. The worker thread enters
/// the namespace, runs `f`, and is restored before it is joined, on both
/// success and failure.
///
/// # Errors
///
/// Returns the error of `f`, or [`KeelError::NetworkFailure`] if the
/// namespace cannot be entered or the worker panics.
pub fn run_in_netns<F, T>(pid: u32, f: F) -> KeelResult<T>
where
    F: FnOnce() -> KeelResult<T> + Send,
    T: Send,
{
    let target = open_netns(pid)?;

    std::thread::scope(|scope| {
        scope
            .spawn(|| {
                let _guard = NetnsGuard::enter(&target)?;
                f()
            })
            .join()
            .map_err(|_| KeelError::NetworkFailure {
                message: format!("Network namespace worker for pid {pid} panicked"),
            })?
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netns_path_format() {
        assert_eq!(netns_path(42), PathBuf::from("/proc/42/ns/net"));
    }

    #[test]
    fn missing_process_is_network_failure() {
        let err = run_in_netns(u32::MAX, || Ok(())).unwrap_err();
        assert!(matches!(err, KeelError::NetworkFailure { .. }));
    }

    #[test]
    #[ignore = "requires CAP_SYS_ADMIN"]
    fn own_namespace_round_trip() {
        let pid = std::process::id();
        let value = run_in_netns(pid, || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }
}
