//! Process execution.
//!
//! - [`supervisor`] clones the container process and hands it its command
//! - [`init`] runs inside the new namespaces and execs the command
//! - [`nsenter`] joins a running container for `keel exec`

pub mod init;
pub mod nsenter;
pub mod supervisor;

pub use init::{container_init, parse_command};
pub use nsenter::{EXEC_CMD_ENV, EXEC_PID_ENV, ExecRequest, exec_in};
pub use supervisor::{
    COMMAND_FD, CommandChannel, INIT_SUBCOMMAND, SpawnOptions, Spawned, is_alive, signal, spawn,
    wait,
};
