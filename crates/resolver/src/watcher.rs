//! The membership watcher loop.
//!
//! One watcher task per pipeline instance: it opens the subscription, turns
//! every relevant event into an address-list emission, and hands each
//! emission to the state sink over a capacity-1 queue. The handoff blocks
//! until the sink accepts or the session is cancelled, so at most one
//! snapshot is ever in flight and the sink observes emissions in exactly
//! delivery order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServiceTarget;
use crate::watch::{MembershipWatch, WatchEvent};

/// Runs the watch loop until cancellation, a fatal setup error, or transport
/// closure.
///
/// Setup failure is fatal to this watcher instance: it is logged and the
/// task exits without emitting anything. Recovery is delegated to the caller
/// re-issuing construction.
pub(crate) async fn run_watcher(
    watch: Arc<dyn MembershipWatch>,
    target: ServiceTarget,
    tx: mpsc::Sender<Vec<String>>,
    cancel: CancellationToken,
) {
    let mut subscription = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            debug!(service = %target, "cancelled before watch was established");
            return;
        }
        result = watch.list_and_watch(&target) => match result {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(service = %target, error = %e, "could not establish membership watch");
                return;
            }
        },
    };

    loop {
        // Cancellation wins over a simultaneously ready event.
        let step = tokio::select! {
            biased;
            () = cancel.cancelled() => Step::Cancelled,
            event = subscription.next_event() => match event {
                Some(event) => Step::Event(event),
                None => Step::StreamClosed,
            },
        };

        let event = match step {
            Step::Cancelled => {
                debug!(service = %target, "membership watch cancelled");
                subscription.stop();
                return;
            }
            Step::StreamClosed => {
                info!(service = %target, "watch transport closed the event stream");
                subscription.stop();
                return;
            }
            Step::Event(event) => event,
        };

        match event {
            WatchEvent::Created(record)
            | WatchEvent::Updated(record)
            | WatchEvent::Bookmark(record) => {
                let addresses = record.addresses();
                info!(
                    record = %record.qualified_name(),
                    count = addresses.len(),
                    "membership update"
                );
                if !deliver(&tx, addresses, &cancel).await {
                    subscription.stop();
                    return;
                }
            }
            WatchEvent::Deleted(record) => {
                info!(record = %record.qualified_name(), "membership record deleted");
                if !deliver(&tx, Vec::new(), &cancel).await {
                    subscription.stop();
                    return;
                }
            }
            WatchEvent::Error(message) => {
                warn!(service = %target, error = %message, "watch stream error, continuing");
            }
        }
    }
}

/// Outcome of one wait in the watch loop.
enum Step {
    Cancelled,
    StreamClosed,
    Event(WatchEvent),
}

/// Blocking handoff of one address list to the sink.
///
/// Returns false when the watcher should exit: the session was cancelled
/// while waiting, or the sink is gone.
async fn deliver(
    tx: &mpsc::Sender<Vec<String>>,
    addresses: Vec<String>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        result = tx.send(addresses) => result.is_ok(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::membership::{MembershipRecord, Subset};
    use crate::mock::MockMembershipWatch;

    fn target() -> ServiceTarget {
        ServiceTarget::new("svc-a").unwrap().with_namespace("ns1")
    }

    fn record(addresses: &[&str], ports: &[u16]) -> MembershipRecord {
        MembershipRecord::new(
            "svc-a",
            "ns1",
            [Subset::new(addresses.iter().copied(), ports.iter().copied())],
        )
    }

    #[tokio::test]
    async fn created_event_emits_resolved_addresses() {
        let (watch, events) = MockMembershipWatch::channel();
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(watch, target(), tx, cancel.clone()));

        events.send(WatchEvent::Created(record(&["1.2.3.4"], &[80]))).unwrap();

        let emitted = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(emitted, vec!["1.2.3.4:80"]);

        cancel.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn deleted_event_emits_empty_list() {
        let (watch, events) = MockMembershipWatch::channel();
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(watch, target(), tx, cancel.clone()));

        events.send(WatchEvent::Created(record(&["1.2.3.4"], &[80]))).unwrap();
        events.send(WatchEvent::Deleted(record(&["1.2.3.4"], &[80]))).unwrap();

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(first, vec!["1.2.3.4:80"]);
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert!(second.is_empty());

        cancel.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn error_event_does_not_terminate_the_loop() {
        let (watch, events) = MockMembershipWatch::channel();
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(watch, target(), tx, cancel.clone()));

        events.send(WatchEvent::Error("stream hiccup".into())).unwrap();
        events.send(WatchEvent::Updated(record(&["5.6.7.8"], &[443]))).unwrap();

        let emitted = timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(emitted, vec!["5.6.7.8:443"]);

        cancel.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn subscription_failure_is_fatal_and_emits_nothing() {
        let (watch, _events) = MockMembershipWatch::channel();
        watch.fail_subscriptions();

        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(watch, target(), tx, cancel));

        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn transport_closure_ends_the_loop() {
        let (watch, events) = MockMembershipWatch::channel();
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(watch, target(), tx, cancel));

        drop(events);

        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_blocked_handoff() {
        let (watch, events) = MockMembershipWatch::channel();
        // Queue capacity 1 and no consumer: the second emission blocks.
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_watcher(watch, target(), tx, cancel.clone()));

        events.send(WatchEvent::Created(record(&["1.2.3.4"], &[80]))).unwrap();
        events.send(WatchEvent::Updated(record(&["5.6.7.8"], &[80]))).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
