//! The cluster watch transport seam.
//!
//! [`MembershipWatch`] is the boundary to whatever client library performs
//! the actual list/watch against the cluster. The shipped implementation is
//! [`KubernetesWatch`](crate::kubernetes::KubernetesWatch); tests use
//! [`MockMembershipWatch`](crate::mock::MockMembershipWatch). Implementations
//! are expected to re-establish their own event source after transient
//! failures; the watcher loop treats `Error` events as non-fatal and keeps
//! reading.

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use tracing::debug;

use crate::config::ServiceTarget;
use crate::error::Result;
use crate::membership::MembershipRecord;

/// A typed change event for one membership record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The record appeared.
    Created(MembershipRecord),

    /// The record changed.
    Updated(MembershipRecord),

    /// A resync snapshot of the record, carrying the same payload shape as
    /// an update.
    Bookmark(MembershipRecord),

    /// The record was removed; the service has no reachable addresses.
    Deleted(MembershipRecord),

    /// A transport-level error on the event stream. Non-fatal; the
    /// transport re-establishes itself.
    Error(String),
}

impl WatchEvent {
    /// Short event-kind label for log records.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Bookmark(_) => "bookmark",
            Self::Deleted(_) => "deleted",
            Self::Error(_) => "error",
        }
    }
}

/// An open subscription to change events for one membership record.
///
/// The subscription is exclusively owned by the watcher loop that opened it
/// and is stopped on every exit path.
pub struct Subscription {
    events: BoxStream<'static, WatchEvent>,
}

impl Subscription {
    /// Wraps an event stream.
    pub fn new(events: impl Stream<Item = WatchEvent> + Send + 'static) -> Self {
        Self { events: events.boxed() }
    }

    /// Waits for the next event. Returns `None` once the transport has
    /// closed the stream for good.
    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.events.next().await
    }

    /// Stops the subscription, releasing the underlying transport resources.
    pub fn stop(self) {
        debug!("subscription stopped");
        drop(self.events);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Transport capable of watching membership records in a cluster.
#[async_trait]
pub trait MembershipWatch: Send + Sync + 'static {
    /// Opens a subscription to change events for the record named by
    /// `target`, scoped by an equality filter on the record's name.
    ///
    /// # Errors
    ///
    /// Returns an error when the cluster client or the subscription cannot
    /// be established. This is fatal to the watcher instance that requested
    /// it; no retry is attempted by the pipeline.
    async fn list_and_watch(&self, target: &ServiceTarget) -> Result<Subscription>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::membership::MembershipRecord;

    #[test]
    fn event_kind_labels() {
        let rec = MembershipRecord::new("svc-a", "ns1", []);
        assert_eq!(WatchEvent::Created(rec.clone()).kind(), "created");
        assert_eq!(WatchEvent::Updated(rec.clone()).kind(), "updated");
        assert_eq!(WatchEvent::Bookmark(rec.clone()).kind(), "bookmark");
        assert_eq!(WatchEvent::Deleted(rec).kind(), "deleted");
        assert_eq!(WatchEvent::Error("boom".into()).kind(), "error");
    }

    #[tokio::test]
    async fn subscription_drains_stream_in_order() {
        let rec = MembershipRecord::new("svc-a", "ns1", []);
        let events = vec![WatchEvent::Created(rec.clone()), WatchEvent::Deleted(rec)];
        let mut sub = Subscription::new(futures::stream::iter(events.clone()));

        assert_eq!(sub.next_event().await, Some(events[0].clone()));
        assert_eq!(sub.next_event().await, Some(events[1].clone()));
        assert_eq!(sub.next_event().await, None);
    }
}
