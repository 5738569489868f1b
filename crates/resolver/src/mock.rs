//! Controllable test doubles for the pipeline's two collaborators.
//!
//! [`MockMembershipWatch`] stands in for the cluster watch transport: tests
//! script the exact event sequence the watcher observes. [`RecordingRouter`]
//! stands in for the routing client: it records every applied snapshot,
//! forwards each one on a channel for await-style assertions, and supports
//! failure and delay injection for resilience tests.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use meshwatch_resolver::mock::{MockMembershipWatch, RecordingRouter};
//! use meshwatch_resolver::{MembershipRecord, ResolverBuilder, ServiceTarget, Subset, WatchEvent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (watch, events) = MockMembershipWatch::channel();
//! let (router, mut updates) = RecordingRouter::channel();
//!
//! let target = ServiceTarget::new("svc-a").unwrap().with_namespace("ns1");
//! let session = ResolverBuilder::new(watch).build(&target, Arc::clone(&router));
//!
//! let record = MembershipRecord::new("svc-a", "ns1", [Subset::new(["1.2.3.4"], [80])]);
//! events.send(WatchEvent::Created(record)).unwrap();
//!
//! assert_eq!(updates.recv().await.unwrap(), vec!["1.2.3.4:80".to_owned()]);
//! session.shutdown().await;
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::ServiceTarget;
use crate::error::{Result, StateUpdateSnafu, SubscribeSnafu};
use crate::routing::RoutingClient;
use crate::watch::{MembershipWatch, Subscription, WatchEvent};

/// Scriptable watch transport.
///
/// Events sent on the paired channel are delivered to the subscriber in
/// order; dropping the sender closes the event stream. The transport hands
/// out its event stream once, and a second subscription fails, mirroring
/// the one-subscription-per-watcher ownership of the real transport.
pub struct MockMembershipWatch {
    events: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    fail_subscribe: AtomicBool,
    subscriptions: AtomicUsize,
}

impl MockMembershipWatch {
    /// Creates the transport and the sender used to script its events.
    #[must_use]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedSender<WatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watch = Arc::new(Self {
            events: Mutex::new(Some(rx)),
            fail_subscribe: AtomicBool::new(false),
            subscriptions: AtomicUsize::new(0),
        });
        (watch, tx)
    }

    /// Makes every future `list_and_watch` call fail, for fatal-setup tests.
    pub fn fail_subscriptions(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    /// Number of subscription attempts observed.
    #[must_use]
    pub fn subscription_attempts(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembershipWatch for MockMembershipWatch {
    async fn list_and_watch(&self, target: &ServiceTarget) -> Result<Subscription> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);

        if self.fail_subscribe.load(Ordering::SeqCst) {
            return SubscribeSnafu {
                message: format!("injected subscription failure for {target}"),
            }
            .fail();
        }

        let receiver = self.events.lock().take().ok_or_else(|| {
            SubscribeSnafu { message: format!("subscription for {target} already taken") }.build()
        })?;
        Ok(Subscription::new(UnboundedReceiverStream::new(receiver)))
    }
}

/// Recording routing client.
///
/// Applied snapshots are kept in order and also forwarded on the paired
/// channel so tests can await them instead of polling.
pub struct RecordingRouter {
    forward: mpsc::UnboundedSender<Vec<String>>,
    applied: Mutex<Vec<Vec<String>>>,
    fail_next: AtomicUsize,
    delay_ms: AtomicU64,
}

impl RecordingRouter {
    /// Creates the router and the receiver carrying each applied snapshot.
    #[must_use]
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            forward: tx,
            applied: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        });
        (router, rx)
    }

    /// Fails the next `count` updates with a state-update error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Delays every update by `delay`, for backpressure and ordering tests.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Snapshots applied so far, in application order.
    #[must_use]
    pub fn applied(&self) -> Vec<Vec<String>> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl RoutingClient for RecordingRouter {
    async fn update_addresses(&self, addresses: Vec<String>) -> Result<()> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let should_fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return StateUpdateSnafu { message: "injected update failure".to_owned() }.fail();
        }

        self.applied.lock().push(addresses.clone());
        let _ = self.forward.send(addresses);
        Ok(())
    }
}
