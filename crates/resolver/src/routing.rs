//! The routing-client boundary.
//!
//! [`RoutingClient`] is the outbound state interface: the sink hands it the
//! full replacement address list once per processed event. The shipped
//! implementation, [`BalanceChannelRouter`], feeds a tonic
//! [balance channel](tonic::transport::Channel::balance_channel) by diffing
//! consecutive snapshots into endpoint insert/remove changes.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::Sender;
use tonic::transport::{Channel, Endpoint};
use tower::discover::Change;
use tracing::debug;

use crate::error::{Result, StateUpdateSnafu};

/// Maintains the authoritative "current address set" used for routing.
///
/// The routing-client object is externally owned; implementations must not
/// assume the pipeline is its only caller.
#[async_trait]
pub trait RoutingClient: Send + Sync + 'static {
    /// Replaces the full address state with `addresses`, one entry per
    /// resolved `host:port` pair, in the given order.
    ///
    /// # Errors
    ///
    /// Returns an error when the state could not be applied. The pipeline
    /// logs the failure and moves on; the next emission supersedes it.
    async fn update_addresses(&self, addresses: Vec<String>) -> Result<()>;
}

#[async_trait]
impl<T: RoutingClient + ?Sized> RoutingClient for std::sync::Arc<T> {
    async fn update_addresses(&self, addresses: Vec<String>) -> Result<()> {
        (**self).update_addresses(addresses).await
    }
}

/// Routing client backed by a tonic load-balancing channel.
///
/// Tonic's balance channel consumes a stream of endpoint changes rather than
/// full snapshots, so the router keeps the last pushed set and translates
/// each replacement list into the [`Change::Insert`] / [`Change::Remove`]
/// messages that reconcile the channel with it.
pub struct BalanceChannelRouter {
    changes: Sender<Change<String, Endpoint>>,
    current: Mutex<BTreeSet<String>>,
    connect_timeout: Option<Duration>,
}

impl BalanceChannelRouter {
    /// Wraps an existing balance-channel change sender.
    #[must_use]
    pub fn new(changes: Sender<Change<String, Endpoint>>) -> Self {
        Self { changes, current: Mutex::new(BTreeSet::new()), connect_timeout: None }
    }

    /// Creates a balance channel and the router that feeds it.
    ///
    /// `capacity` bounds the in-flight change messages, mirroring
    /// [`Channel::balance_channel`].
    #[must_use]
    pub fn pair(capacity: usize) -> (Channel, Self) {
        let (channel, changes) = Channel::balance_channel(capacity);
        (channel, Self::new(changes))
    }

    /// Applies a connect timeout to every endpoint handed to the channel.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Returns the last successfully pushed address set.
    #[must_use]
    pub fn current_addresses(&self) -> Vec<String> {
        self.current.lock().iter().cloned().collect()
    }

    fn endpoint_for(&self, address: &str) -> Result<Endpoint> {
        let endpoint = Endpoint::from_shared(format!("http://{address}")).map_err(|e| {
            StateUpdateSnafu { message: format!("invalid endpoint address '{address}': {e}") }
                .build()
        })?;
        Ok(match self.connect_timeout {
            Some(timeout) => endpoint.connect_timeout(timeout),
            None => endpoint,
        })
    }
}

#[async_trait]
impl RoutingClient for BalanceChannelRouter {
    async fn update_addresses(&self, addresses: Vec<String>) -> Result<()> {
        let next: BTreeSet<String> = addresses.into_iter().collect();
        let current = self.current.lock().clone();

        // Validate the whole snapshot before mutating the channel.
        let inserts: Vec<(String, Endpoint)> = next
            .difference(&current)
            .map(|address| Ok((address.clone(), self.endpoint_for(address)?)))
            .collect::<Result<_>>()?;

        for address in current.difference(&next) {
            self.changes.send(Change::Remove(address.clone())).await.map_err(|_| {
                StateUpdateSnafu { message: "balance channel closed".to_owned() }.build()
            })?;
        }
        for (address, endpoint) in inserts {
            self.changes.send(Change::Insert(address, endpoint)).await.map_err(|_| {
                StateUpdateSnafu { message: "balance channel closed".to_owned() }.build()
            })?;
        }

        debug!(count = next.len(), "routing state replaced");
        *self.current.lock() = next;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn router() -> (BalanceChannelRouter, mpsc::Receiver<Change<String, Endpoint>>) {
        let (tx, rx) = mpsc::channel(16);
        (BalanceChannelRouter::new(tx), rx)
    }

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn first_snapshot_inserts_every_address() {
        let (router, mut rx) = router();

        router.update_addresses(addrs(&["1.2.3.4:80", "5.6.7.8:80"])).await.unwrap();

        match rx.recv().await.unwrap() {
            Change::Insert(key, _) => assert_eq!(key, "1.2.3.4:80"),
            Change::Remove(_) => panic!("expected insert"),
        }
        match rx.recv().await.unwrap() {
            Change::Insert(key, _) => assert_eq!(key, "5.6.7.8:80"),
            Change::Remove(_) => panic!("expected insert"),
        }
        assert_eq!(router.current_addresses(), addrs(&["1.2.3.4:80", "5.6.7.8:80"]));
    }

    #[tokio::test]
    async fn replacement_removes_stale_and_inserts_new() {
        let (router, mut rx) = router();

        router.update_addresses(addrs(&["1.2.3.4:80"])).await.unwrap();
        let _ = rx.recv().await.unwrap();

        router.update_addresses(addrs(&["5.6.7.8:80"])).await.unwrap();

        match rx.recv().await.unwrap() {
            Change::Remove(key) => assert_eq!(key, "1.2.3.4:80"),
            Change::Insert(..) => panic!("expected remove"),
        }
        match rx.recv().await.unwrap() {
            Change::Insert(key, _) => assert_eq!(key, "5.6.7.8:80"),
            Change::Remove(_) => panic!("expected insert"),
        }
    }

    #[tokio::test]
    async fn identical_snapshot_sends_no_changes() {
        let (router, mut rx) = router();

        router.update_addresses(addrs(&["1.2.3.4:80"])).await.unwrap();
        let _ = rx.recv().await.unwrap();

        router.update_addresses(addrs(&["1.2.3.4:80"])).await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn empty_snapshot_drains_the_channel() {
        let (router, mut rx) = router();

        router.update_addresses(addrs(&["1.2.3.4:80"])).await.unwrap();
        let _ = rx.recv().await.unwrap();

        router.update_addresses(Vec::new()).await.unwrap();

        match rx.recv().await.unwrap() {
            Change::Remove(key) => assert_eq!(key, "1.2.3.4:80"),
            Change::Insert(..) => panic!("expected remove"),
        }
        assert!(router.current_addresses().is_empty());
    }

    #[tokio::test]
    async fn closed_channel_reports_state_update_error() {
        let (router, rx) = router();
        drop(rx);

        let err = router.update_addresses(addrs(&["1.2.3.4:80"])).await.unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn invalid_address_is_rejected_before_any_change() {
        let (router, mut rx) = router();

        let err = router
            .update_addresses(addrs(&["1.2.3.4:80", "bad address:80"]))
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
        assert!(rx.try_recv().is_err());
        assert!(router.current_addresses().is_empty());
    }

    #[tokio::test]
    async fn pair_produces_a_usable_router() {
        let (_channel, router) = BalanceChannelRouter::pair(16);
        router.update_addresses(addrs(&["1.2.3.4:80"])).await.unwrap();
        assert_eq!(router.current_addresses(), addrs(&["1.2.3.4:80"]));
    }
}
