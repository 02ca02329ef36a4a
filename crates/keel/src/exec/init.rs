//! Container init process.
//!
//! Runs as `keel init` inside the namespaces created by the supervisor. It
//! reads the user command from the inherited pipe, moves into the container
//! root and replaces itself with the command, so the user program keeps the
//! PID the supervisor already reported.

#![allow(unsafe_code)]

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use keel_common::{KeelError, KeelResult};

use super::supervisor::COMMAND_FD;
use crate::filesystem::{enter_rootfs, mount_dev, mount_proc};

/// Search path used when the environment carries none.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Split the raw command received from the supervisor.
pub fn parse_command(raw: &str) -> KeelResult<Vec<String>> {
    let command: Vec<String> = raw
        .split(' ')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect();

    if command.is_empty() {
        return Err(KeelError::EmptyCommand);
    }
    Ok(command)
}

/// Read the command pipe to EOF.
#[cfg(target_os = "linux")]
fn read_command() -> KeelResult<Vec<String>> {
    use std::os::unix::io::FromRawFd;

    // Safety: the supervisor installs the pipe at COMMAND_FD and nothing
    // else in this process owns it.
    let mut pipe = unsafe { std::fs::File::from_raw_fd(COMMAND_FD) };
    let mut raw = String::new();
    pipe.read_to_string(&mut raw)
        .map_err(|e| KeelError::SetupFailure {
            operation: "read command".to_string(),
            message: e.to_string(),
        })?;

    parse_command(&raw)
}

/// Resolve `program` against `PATH` inside the new root.
fn resolve(program: &str) -> KeelResult<PathBuf> {
    let path = std::env::var_os("PATH").unwrap_or_else(|| DEFAULT_PATH.into());
    which::which_in(program, Some(path), "/").map_err(|e| KeelError::SetupFailure {
        operation: "resolve command".to_string(),
        message: format!("{program}: {e}"),
    })
}

/// Run as container init.
///
/// Only returns on failure; on success the process image is replaced.
#[cfg(target_os = "linux")]
pub fn container_init() -> KeelResult<()> {
    let command = read_command()?;
    tracing::debug!(command = ?command, "Container init received command");

    let root = std::env::current_dir()?;
    enter_rootfs(&root)?;

    let new_root = Path::new("/");
    mount_proc(new_root)?;
    mount_dev(new_root)?;

    let program = resolve(&command[0])?;
    tracing::debug!(program = %program.display(), "Executing container command");

    let err = Command::new(&program).args(&command[1..]).exec();
    Err(KeelError::SetupFailure {
        operation: "exec".to_string(),
        message: format!("{}: {err}", program.display()),
    })
}

#[cfg(not(target_os = "linux"))]
pub fn container_init() -> KeelResult<()> {
    Err(KeelError::Unsupported {
        feature: "container init".to_string(),
    })
}
