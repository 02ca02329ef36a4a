#![allow(unsafe_code)]
//! Joining a running container for `keel exec`.
//!
//! Entering a mount namespace is refused to multi-threaded processes, so
//! the CLI re-invokes itself with [`EXEC_PID_ENV`] and [`EXEC_CMD_ENV`] set
//! and `main` calls [`ExecRequest::from_env`] before any other thread is
//! started.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use keel_common::{KeelError, KeelResult};

use crate::namespace::Namespace;

/// PID of the container to join.
pub const EXEC_PID_ENV: &str = "KEEL_EXEC_PID";

/// Shell command to run once inside.
pub const EXEC_CMD_ENV: &str = "KEEL_EXEC_CMD";

/// A pending namespace entry read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Target container PID.
    pub pid: u32,
    /// Command passed to `sh -c`.
    pub command: String,
}

impl ExecRequest {
    /// Read the request, if this process was started for one.
    pub fn from_env() -> KeelResult<Option<Self>> {
        let Ok(pid) = std::env::var(EXEC_PID_ENV) else {
            return Ok(None);
        };
        let command = std::env::var(EXEC_CMD_ENV).unwrap_or_default();
        Self::parse(&pid, command).map(Some)
    }

    fn parse(pid: &str, command: String) -> KeelResult<Self> {
        let pid = pid
            .trim()
            .parse()
            .map_err(|_| KeelError::InvalidArgument {
                message: format!("{EXEC_PID_ENV} is not a pid: {pid:?}"),
            })?;
        if command.trim().is_empty() {
            return Err(KeelError::EmptyCommand);
        }
        Ok(Self { pid, command })
    }

    /// Join the container and run the command, returning its exit code.
    pub fn run(&self) -> KeelResult<i32> {
        join_namespaces(self.pid)?;

        tracing::debug!(pid = self.pid, command = %self.command, "Running command in container");
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .status()
            .map_err(|e| KeelError::Internal {
                message: format!("Failed to run sh: {e}"),
            })?;

        Ok(status.code().unwrap_or(1))
    }
}

/// Move the calling process into every namespace of `pid`.
///
/// All handles are opened up front, since joining the mount namespace
/// changes what `/proc` refers to.
#[cfg(target_os = "linux")]
pub fn join_namespaces(pid: u32) -> KeelResult<()> {
    let handles = Namespace::JOIN_ORDER
        .iter()
        .map(|ns| {
            let path = format!("/proc/{pid}/ns/{}", ns.proc_name());
            File::open(&path)
                .map(|file| (*ns, file))
                .map_err(|e| KeelError::SetupFailure {
                    operation: "open namespace".to_string(),
                    message: format!("{path}: {e}"),
                })
        })
        .collect::<KeelResult<Vec<_>>>()?;

    for (ns, file) in &handles {
        // Safety: the descriptor is owned by `file` and valid for the call.
        if unsafe { libc::setns(file.as_raw_fd(), ns.clone_flag()) } != 0 {
            return Err(KeelError::SetupFailure {
                operation: format!("setns {}", ns.proc_name()),
                message: std::io::Error::last_os_error().to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn join_namespaces(_pid: u32) -> KeelResult<()> {
    Err(KeelError::Unsupported {
        feature: "setns".to_string(),
    })
}

/// Re-invoke this binary to run `command` inside the container `pid`.
pub async fn exec_in(pid: u32, command: &[String]) -> KeelResult<i32> {
    let line = command.join(" ");
    tracing::info!(pid, command = %line, "Executing command in container");

    let status = tokio::process::Command::new("/proc/self/exe")
        .arg("exec")
        .env(EXEC_PID_ENV, pid.to_string())
        .env(EXEC_CMD_ENV, &line)
        .status()
        .await
        .map_err(|e| KeelError::Internal {
            message: format!("Failed to re-execute for exec: {e}"),
        })?;

    Ok(status.code().unwrap_or(1))
}
