//! Dynamic service-discovery bridge between a Kubernetes cluster and a
//! tonic load-balancing channel.
//!
//! The resolver watches the cluster's `Endpoints` membership record for one
//! named service and continuously republishes the current set of reachable
//! `host:port` targets to a routing client, so RPCs are balanced across
//! healthy backends without reconfiguration or restarts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Cluster watch transport                     │
//! │   KubernetesWatch: list+watch over v1/Endpoints             │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 MembershipWatcher loop                      │
//! │   event → address extraction → blocking handoff             │
//! ├────────────────────── capacity-1 queue ─────────────────────┤
//! │                 StateSink loop                              │
//! │   full-replacement push to the routing client               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                 Routing client                              │
//! │   BalanceChannelRouter → tonic balance channel              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both loops race their waits against one shared cancellation token owned
//! by the [`WatchSession`]; closing the session tears the pipeline down.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use meshwatch_resolver::{BalanceChannelRouter, ResolverBuilder, ServiceTarget};
//!
//! #[tokio::main]
//! async fn main() -> meshwatch_resolver::Result<()> {
//!     let (channel, router) = BalanceChannelRouter::pair(64);
//!
//!     let target = ServiceTarget::new("my-grpc-service")?.with_namespace("prod");
//!     let session = ResolverBuilder::kubernetes().build(&target, router);
//!
//!     // `channel` now re-balances as pods come and go.
//!     // let client = MyServiceClient::new(channel);
//!
//!     session.close();
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
#[cfg(feature = "kubernetes")]
mod kubernetes;
mod membership;
pub mod mock;
mod routing;
mod session;
mod sink;
mod watch;
mod watcher;

pub use config::{ServiceTarget, DEFAULT_NAMESPACE, SCHEME};
pub use error::{ResolverError, Result};
#[cfg(feature = "kubernetes")]
pub use kubernetes::KubernetesWatch;
pub use membership::{EndpointPort, MembershipRecord, Subset};
pub use routing::{BalanceChannelRouter, RoutingClient};
pub use session::{ResolverBuilder, WatchSession};
pub use watch::{MembershipWatch, Subscription, WatchEvent};
