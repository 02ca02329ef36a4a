#![allow(unsafe_code)]
//! Spawning the isolated container process.
//!
//! The child is created with `clone(2)` directly in fresh namespaces and
//! re-executes this binary as `keel init`. It then blocks on
//! [`COMMAND_FD`] until the parent writes the command and closes the pipe,
//! which gives the caller a window to set up cgroups and networking for a
//! PID that is not yet running user code.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use keel_common::{KeelError, KeelResult};

use crate::namespace::NamespaceConfig;

/// Descriptor the command pipe is installed at in the child.
pub const COMMAND_FD: i32 = 3;

/// Hidden sub-command the child re-executes into.
pub const INIT_SUBCOMMAND: &str = "init";

const SELF_EXE: &str = "/proc/self/exe";

/// Exit code of a child that failed between `clone` and `execv`.
const CHILD_SETUP_FAILED: i32 = 126;

/// How to start the container process.
#[derive(Debug, Clone)]
pub struct SpawnOptions<'a> {
    /// Directory that becomes the container root.
    pub rootfs: &'a Path,
    /// Keep the caller's standard streams attached.
    pub interactive: bool,
    /// Log file receiving stdout when not interactive.
    pub log: Option<&'a Path>,
    /// Namespaces to create.
    pub namespaces: NamespaceConfig,
}

/// Write end of the command pipe.
#[derive(Debug)]
pub struct CommandChannel {
    writer: File,
}

impl CommandChannel {
    /// Send the space-joined command and close the pipe.
    pub fn send(mut self, command: &[String]) -> KeelResult<()> {
        let line = command.join(" ");
        tracing::debug!(command = %line, "Handing command to container init");

        self.writer
            .write_all(line.as_bytes())
            .map_err(|e| KeelError::SetupFailure {
                operation: "command handoff".to_string(),
                message: e.to_string(),
            })
    }
}

/// A freshly spawned container process waiting for its command.
#[derive(Debug)]
pub struct Spawned {
    /// Host PID of the container init.
    pub pid: u32,
    /// Channel the command must be written to.
    pub channel: CommandChannel,
}

fn setup_error(operation: &str, err: impl std::fmt::Display) -> KeelError {
    KeelError::SetupFailure {
        operation: operation.to_string(),
        message: err.to_string(),
    }
}

fn c_string(value: &str) -> KeelResult<CString> {
    CString::new(value).map_err(|e| KeelError::Internal {
        message: format!("Invalid argument {value:?}: {e}"),
    })
}

/// Clone a new process into fresh namespaces running `keel init`.
#[cfg(target_os = "linux")]
pub fn spawn(options: &SpawnOptions<'_>) -> KeelResult<Spawned> {
    use rustix::fd::AsRawFd;
    use rustix::pipe::{PipeFlags, pipe_with};

    tracing::debug!(
        rootfs = %options.rootfs.display(),
        interactive = options.interactive,
        "Spawning container process"
    );

    // Everything the child touches is allocated before clone.
    let exe = c_string(SELF_EXE)?;
    let arg0 = c_string(env!("CARGO_PKG_NAME"))?;
    let arg1 = c_string(INIT_SUBCOMMAND)?;
    let argv = [arg0.as_ptr(), arg1.as_ptr(), std::ptr::null()];
    let rootfs = c_string(&options.rootfs.to_string_lossy())?;

    let log = match options.log {
        Some(path) if !options.interactive => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| setup_error("open container log", e))?,
        ),
        _ => None,
    };
    let log_fd = log.as_ref().map(AsRawFd::as_raw_fd);

    let (reader, writer) =
        pipe_with(PipeFlags::CLOEXEC).map_err(|e| setup_error("command pipe", e))?;
    let reader_fd = reader.as_raw_fd();

    let flags = options.namespaces.to_clone_flags() | libc::SIGCHLD;

    // Safety: with no new stack the child is a copy-on-write duplicate, as
    // after fork. It only makes async-signal-safe calls before execv.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            flags as libc::c_ulong,
            0_usize,
            0_usize,
            0_usize,
            0_usize,
        )
    };

    if ret == 0 {
        // Safety: in the child; see above.
        unsafe { exec_init(reader_fd, log_fd, &rootfs, &exe, &argv) }
    }
    if ret < 0 {
        return Err(setup_error("clone", std::io::Error::last_os_error()));
    }

    drop(reader);
    let pid = u32::try_from(ret).map_err(|e| KeelError::Internal {
        message: format!("Invalid child pid {ret}: {e}"),
    })?;

    tracing::info!(pid, "Container process spawned");
    Ok(Spawned {
        pid,
        channel: CommandChannel {
            writer: File::from(writer),
        },
    })
}

#[cfg(not(target_os = "linux"))]
pub fn spawn(_options: &SpawnOptions<'_>) -> KeelResult<Spawned> {
    Err(KeelError::Unsupported {
        feature: "namespaces".to_string(),
    })
}

/// Child side of [`spawn`]: wire up descriptors and exec `keel init`.
#[cfg(target_os = "linux")]
unsafe fn exec_init(
    reader: i32,
    log: Option<i32>,
    rootfs: &CString,
    exe: &CString,
    argv: &[*const libc::c_char],
) -> ! {
    unsafe {
        if let Some(fd) = log {
            if libc::dup2(fd, libc::STDOUT_FILENO) < 0 {
                libc::_exit(CHILD_SETUP_FAILED);
            }
        }

        // dup2 clears FD_CLOEXEC on the copy; an fd already at the target
        // index keeps it and must be cleared by hand.
        let installed = if reader == COMMAND_FD {
            libc::fcntl(reader, libc::F_SETFD, 0)
        } else {
            libc::dup2(reader, COMMAND_FD)
        };
        if installed < 0 {
            libc::_exit(CHILD_SETUP_FAILED);
        }

        if libc::chdir(rootfs.as_ptr()) != 0 {
            libc::_exit(CHILD_SETUP_FAILED);
        }

        libc::execv(exe.as_ptr(), argv.as_ptr());
        libc::_exit(127)
    }
}

/// Block until `pid` exits and return its exit code.
///
/// Signals are reported as `128 + signo`. A child that was already reaped
/// reports `0`.
#[cfg(target_os = "linux")]
pub fn wait_blocking(pid: u32) -> KeelResult<i32> {
    let raw = libc::pid_t::try_from(pid).map_err(|e| KeelError::Internal {
        message: format!("Invalid pid {pid}: {e}"),
    })?;

    let mut status: libc::c_int = 0;
    loop {
        // Safety: status points to a live c_int.
        let result = unsafe { libc::waitpid(raw, &mut status, 0) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            if err.raw_os_error() == Some(libc::ECHILD) {
                return Ok(0);
            }
            return Err(KeelError::Internal {
                message: format!("waitpid failed: {err}"),
            });
        }
        break;
    }

    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        Ok(128 + libc::WTERMSIG(status))
    } else {
        Ok(1)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait_blocking(_pid: u32) -> KeelResult<i32> {
    Err(KeelError::Unsupported {
        feature: "waitpid".to_string(),
    })
}

/// Wait for `pid` on the blocking pool.
pub async fn wait(pid: u32) -> KeelResult<i32> {
    tokio::task::spawn_blocking(move || wait_blocking(pid))
        .await
        .map_err(|e| KeelError::Internal {
            message: format!("Task join error: {e}"),
        })?
}

/// Send `signal` to `pid`.
pub fn signal(pid: u32, signal: i32) -> std::io::Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    // Safety: kill has no memory-safety preconditions.
    if unsafe { libc::kill(raw, signal) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Whether a process with this PID currently exists.
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match signal(pid, 0) {
        Ok(()) => true,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}
