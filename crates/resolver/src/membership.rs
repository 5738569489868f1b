//! Membership record snapshots and address extraction.
//!
//! A [`MembershipRecord`] is the cluster's readiness-grouped list of network
//! endpoints for one named service, delivered as an immutable snapshot by the
//! watch transport. [`MembershipRecord::addresses`] turns a snapshot into the
//! deduplicated, sorted `host:port` list the routing client consumes.

use std::collections::BTreeSet;

/// A numeric port shared by every address in a [`Subset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPort {
    /// Port number.
    pub port: u16,

    /// Transport protocol (`TCP`, `UDP`, ...), when the cluster reports one.
    pub protocol: Option<String>,
}

impl EndpointPort {
    /// Creates a TCP-or-unspecified port.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self { port, protocol: None }
    }
}

/// A group of addresses sharing the same ports and readiness status within
/// one membership record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subset {
    /// IP-level hosts in this subset.
    pub addresses: Vec<String>,

    /// Ports served by every address in this subset.
    pub ports: Vec<EndpointPort>,
}

impl Subset {
    /// Creates a subset from plain addresses and port numbers.
    pub fn new(
        addresses: impl IntoIterator<Item = impl Into<String>>,
        ports: impl IntoIterator<Item = u16>,
    ) -> Self {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            ports: ports.into_iter().map(EndpointPort::new).collect(),
        }
    }
}

/// The current membership snapshot for one named service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipRecord {
    /// Service name.
    pub name: String,

    /// Namespace the service lives in.
    pub namespace: String,

    /// Readiness-grouped endpoint subsets. Empty when the service has no
    /// reachable backends.
    pub subsets: Vec<Subset>,
}

impl MembershipRecord {
    /// Creates a record from its parts.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        subsets: impl IntoIterator<Item = Subset>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            subsets: subsets.into_iter().collect(),
        }
    }

    /// Resolves the record into a deduplicated, sorted `host:port` list.
    ///
    /// Every address in a subset is paired with every port in that same
    /// subset; addresses never cross subsets. Structurally equal membership
    /// yields byte-identical output regardless of upstream iteration order.
    /// A record with no subsets, no addresses, or no ports resolves to an
    /// empty list; extraction never fails.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        let mut resolved = BTreeSet::new();
        for subset in &self.subsets {
            for address in &subset.addresses {
                for port in &subset.ports {
                    resolved.insert(format!("{}:{}", address, port.port));
                }
            }
        }
        resolved.into_iter().collect()
    }

    /// Returns the `namespace/name` form used in log records.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
