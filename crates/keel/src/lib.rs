//! # Keel Container Runtime
//!
//! Keel runs a command inside fresh Linux namespaces on top of an overlay
//! root filesystem, limits it with cgroup v1 controllers and optionally
//! wires it to a bridge network.
//!
//! ## Layout
//!
//! - [`exec`]: clone the container process, hand it its command, join it later
//! - [`filesystem`]: overlay rootfs, volumes, `pivot_root`, `/proc` and `/dev`
//! - [`cgroup`]: memory, cpu and cpuset limits
//! - [`runtime`]: container records and the lifecycle built on the above
//! - [`cli`]: the `keel` command line
//!
//! ## Usage
//!
//! ```no_run
//! use keel::runtime::{ContainerManager, RunOptions, RuntimeConfig};
//!
//! # async fn example() -> keel_common::KeelResult<()> {
//! let manager = ContainerManager::new(RuntimeConfig::default());
//!
//! let launched = manager
//!     .run(RunOptions {
//!         command: vec!["top".to_string()],
//!         detach: true,
//!         ..RunOptions::default()
//!     })
//!     .await?;
//!
//! manager.stop(&launched.name)?;
//! manager.remove(&launched.name).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cgroup;
pub mod cli;
pub mod exec;
pub mod filesystem;
pub mod namespace;
pub mod runtime;
