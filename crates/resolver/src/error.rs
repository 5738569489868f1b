//! Resolver error types.
//!
//! The error model mirrors the failure taxonomy of the pipeline:
//! - **Construction errors**: invalid target descriptors, surfaced to the caller
//! - **Fatal setup errors**: the subscription could not be opened; the watcher
//!   logs these and exits
//! - **Propagation errors**: a state push to the routing client failed; the
//!   sink logs these and waits for the next emission

use snafu::{Location, Snafu};

/// Result type alias for resolver operations.
pub type Result<T> = std::result::Result<T, ResolverError>;

/// Errors produced by the resolver pipeline and its collaborators.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ResolverError {
    /// The target descriptor could not be parsed or validated.
    #[snafu(display("Invalid target: {message}"))]
    InvalidTarget {
        /// What was wrong with the descriptor.
        message: String,
    },

    /// The watch subscription could not be established.
    #[snafu(display("Subscription error at {location}: {message}"))]
    Subscribe {
        /// Error description.
        message: String,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Cluster client or watch transport failure.
    #[cfg(feature = "kubernetes")]
    #[snafu(display("Kubernetes error at {location}: {source}"))]
    Kubernetes {
        /// Underlying kube client error.
        source: kube::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A state update could not be delivered to the routing client.
    #[snafu(display("State update failed: {message}"))]
    StateUpdate {
        /// Failure description.
        message: String,
    },
}

impl ResolverError {
    /// Returns true if the error terminates the watcher instance.
    ///
    /// Fatal errors are setup failures: the watcher exits without emitting
    /// and recovery is delegated to the caller re-issuing construction.
    /// Non-fatal errors are logged and superseded by later events.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidTarget { .. } | Self::Subscribe { .. } => true,
            #[cfg(feature = "kubernetes")]
            Self::Kubernetes { .. } => true,
            Self::StateUpdate { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_error_is_fatal() {
        let err = SubscribeSnafu { message: "connection refused".to_owned() }.build();
        assert!(err.is_fatal());
    }

    #[test]
    fn invalid_target_is_fatal() {
        let err = ResolverError::InvalidTarget { message: "empty service name".to_owned() };
        assert!(err.is_fatal());
    }

    #[test]
    fn state_update_is_not_fatal() {
        let err = ResolverError::StateUpdate { message: "balance channel closed".to_owned() };
        assert!(!err.is_fatal());
    }

    #[test]
    fn display_includes_message() {
        let err = ResolverError::InvalidTarget { message: "empty service name".to_owned() };
        assert!(err.to_string().contains("empty service name"));
    }
}
