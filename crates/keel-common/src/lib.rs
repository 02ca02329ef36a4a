//! # keel-common
//!
//! Shared utilities and types for the Keel container runtime.
//!
//! This crate provides common functionality used across all Keel crates:
//! - Container ID generation and name validation
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{KeelError, KeelResult};
pub use id::ContainerId;
pub use paths::KeelPaths;
