//! Container runtime core.
//!
//! Container records, their persistence, and the orchestrator that runs
//! and manages containers.

mod config;
mod container;
mod record;
mod state;

pub use config::{DEFAULT_IMAGE, RuntimeConfig};
pub use container::{ContainerManager, Launched, RunOptions};
pub use record::{CREATED_TIME_FORMAT, ContainerRecord, ContainerStatus};
pub use state::StateManager;
