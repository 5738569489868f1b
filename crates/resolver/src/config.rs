//! Watch target configuration.
//!
//! A [`ServiceTarget`] names the membership record one pipeline instance
//! watches: a service name plus the namespace it lives in. Targets are
//! validated at construction, so the rest of the pipeline never sees an
//! empty service name.

use std::fmt;

use snafu::ensure;

use crate::error::{InvalidTargetSnafu, Result};

/// URI scheme accepted by [`ServiceTarget::parse`].
pub const SCHEME: &str = "endpoints";

/// Namespace used when the target descriptor does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Identifies the membership record to watch: one service in one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceTarget {
    service: String,
    namespace: String,
}

impl ServiceTarget {
    /// Creates a target for `service` in the `default` namespace.
    ///
    /// # Errors
    ///
    /// Returns `ResolverError::InvalidTarget` if the service name is empty.
    pub fn new(service: impl Into<String>) -> Result<Self> {
        let service = service.into();
        ensure!(
            !service.trim().is_empty(),
            InvalidTargetSnafu { message: "service name must not be empty".to_owned() }
        );
        Ok(Self { service, namespace: DEFAULT_NAMESPACE.to_owned() })
    }

    /// Replaces the namespace. An empty or whitespace-only namespace falls
    /// back to `default`.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let trimmed = namespace.trim();
        self.namespace =
            if trimmed.is_empty() { DEFAULT_NAMESPACE.to_owned() } else { trimmed.to_owned() };
        self
    }

    /// Parses an `endpoints://<service>/<namespace>` target descriptor.
    ///
    /// The host position carries the service name and the path carries the
    /// namespace, with slashes and surrounding whitespace stripped. A missing
    /// or empty namespace falls back to `default`.
    ///
    /// ```
    /// use meshwatch_resolver::ServiceTarget;
    ///
    /// let target = ServiceTarget::parse("endpoints://svc-a/ns1").unwrap();
    /// assert_eq!(target.service(), "svc-a");
    /// assert_eq!(target.namespace(), "ns1");
    ///
    /// let target = ServiceTarget::parse("endpoints://svc-a").unwrap();
    /// assert_eq!(target.namespace(), "default");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `ResolverError::InvalidTarget` if the scheme is not
    /// `endpoints` or the service name is empty.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let rest = descriptor.strip_prefix(SCHEME).and_then(|r| r.strip_prefix("://")).ok_or_else(
            || {
                InvalidTargetSnafu {
                    message: format!("expected {SCHEME}://<service>/<namespace>, got '{descriptor}'"),
                }
                .build()
            },
        )?;

        let (service, path) = match rest.split_once('/') {
            Some((service, path)) => (service, path),
            None => (rest, ""),
        };

        let namespace = path.replace('/', "");
        Self::new(service.trim()).map(|t| t.with_namespace(namespace))
    }

    /// Returns the service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl fmt::Display for ServiceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.service)
    }
}
