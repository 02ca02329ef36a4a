//! Common error types for the Keel runtime.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KeelError`].
pub type KeelResult<T> = Result<T, KeelError>;

/// Common errors across the Keel runtime.
#[derive(Error, Diagnostic, Debug)]
pub enum KeelError {
    /// Namespace, pipe, mount or pivot_root setup failed.
    #[error("Setup failed during {operation}: {message}")]
    #[diagnostic(code(keel::setup))]
    SetupFailure {
        /// The setup step that failed.
        operation: String,
        /// The error message.
        message: String,
    },

    /// A cgroup subsystem could not be resolved or written.
    #[error("Resource controller failure in {subsystem}: {message}")]
    #[diagnostic(
        code(keel::resource),
        help("Check that the cgroup v1 hierarchy for this controller is mounted")
    )]
    ResourceFailure {
        /// The subsystem that failed (e.g. "memory").
        subsystem: String,
        /// The error message.
        message: String,
    },

    /// Device, namespace or rule setup failed for a network operation.
    #[error("Network failure: {message}")]
    #[diagnostic(code(keel::network))]
    NetworkFailure {
        /// The error message.
        message: String,
    },

    /// No free address left in a subnet.
    #[error("Subnet {subnet} has no free addresses")]
    #[diagnostic(code(keel::ipam::exhausted))]
    SubnetExhausted {
        /// The exhausted subnet.
        subnet: String,
    },

    /// Container not found.
    #[error("Container not found: {name}")]
    #[diagnostic(code(keel::container::not_found))]
    ContainerNotFound {
        /// The container name that was not found.
        name: String,
    },

    /// Network not found.
    #[error("Network not found: {name}")]
    #[diagnostic(code(keel::network::not_found))]
    NetworkNotFound {
        /// The network name that was not found.
        name: String,
    },

    /// Network already exists.
    #[error("Network already exists: {name}")]
    #[diagnostic(code(keel::network::exists))]
    NetworkExists {
        /// The duplicate network name.
        name: String,
    },

    /// No driver registered under the given name.
    #[error("Unknown network driver: {driver}")]
    #[diagnostic(code(keel::network::driver), help("Supported drivers: bridge"))]
    UnknownDriver {
        /// The requested driver.
        driver: String,
    },

    /// Malformed user input such as a port mapping or volume.
    #[error("Malformed input '{input}': {reason}")]
    #[diagnostic(code(keel::input::malformed))]
    MalformedInput {
        /// The offending input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The init process received no command.
    #[error("No command received by container init")]
    #[diagnostic(code(keel::init::empty_command))]
    EmptyCommand,

    /// Invalid command-line argument combination.
    #[error("Invalid argument: {message}")]
    #[diagnostic(code(keel::argument))]
    InvalidArgument {
        /// The error message.
        message: String,
    },

    /// Invalid container ID or name format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(keel::container::invalid_id),
        help("Container names must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// Operation requires a stopped container.
    #[error("Container {name} is {status}, stop it first")]
    #[diagnostic(code(keel::container::not_stopped))]
    ContainerNotStopped {
        /// The container name.
        name: String,
        /// The current status.
        status: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(keel::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(keel::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(keel::unsupported), help("Keel requires Linux with cgroup v1"))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(keel::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl KeelError {
    /// Whether this error reports a missing container or network.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ContainerNotFound { .. } | Self::NetworkNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KeelError::ContainerNotFound {
            name: "abc123".to_string(),
        };
        assert_eq!(err.to_string(), "Container not found: abc123");
        assert!(err.is_not_found());
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KeelError = io_err.into();
        assert!(matches!(err, KeelError::Io(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn subnet_exhausted_message() {
        let err = KeelError::SubnetExhausted {
            subnet: "10.0.0.0/30".to_string(),
        };
        assert_eq!(err.to_string(), "Subnet 10.0.0.0/30 has no free addresses");
    }
}
