//! Pipeline construction and the session handle.
//!
//! [`ResolverBuilder`] is the factory: given a watch transport and a routing
//! client, it starts the watcher and sink loops for one target and returns
//! the [`WatchSession`] that owns their shared cancellation signal. The
//! builder is passed by reference to wherever a connection is established;
//! there is no ambient registry.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ServiceTarget;
use crate::error::Result;
use crate::routing::RoutingClient;
use crate::sink::run_sink;
use crate::watch::MembershipWatch;
use crate::watcher::run_watcher;

/// Capacity of the watcher → sink handoff queue. A single slot gives the
/// blocking-handoff semantics: at most one snapshot in flight, the watcher
/// suspends until the sink takes it.
const HANDOFF_CAPACITY: usize = 1;

/// Factory for watch pipelines over one transport.
#[derive(Clone)]
pub struct ResolverBuilder {
    watch: Arc<dyn MembershipWatch>,
}

impl ResolverBuilder {
    /// Creates a builder over the given watch transport.
    pub fn new(watch: Arc<dyn MembershipWatch>) -> Self {
        Self { watch }
    }

    /// Creates a builder over the default Kubernetes transport.
    #[cfg(feature = "kubernetes")]
    #[must_use]
    pub fn kubernetes() -> Self {
        Self::new(Arc::new(crate::kubernetes::KubernetesWatch::new()))
    }

    /// Starts the watch pipeline for a validated target.
    ///
    /// Construction is synchronous and fast: both loops are spawned, nothing
    /// waits for a first resolution. The routing client keeps whatever state
    /// it started with until the first membership event arrives.
    pub fn build(&self, target: &ServiceTarget, client: impl RoutingClient) -> WatchSession {
        info!(service = %target, "starting membership watch");

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);

        let watcher = tokio::spawn(run_watcher(
            Arc::clone(&self.watch),
            target.clone(),
            tx,
            cancel.clone(),
        ));
        let sink = tokio::spawn(run_sink(Arc::new(client), rx, cancel.clone()));

        WatchSession { cancel, watcher: Some(watcher), sink: Some(sink) }
    }

    /// Parses an `endpoints://<service>/<namespace>` descriptor and starts
    /// the pipeline for it.
    ///
    /// # Errors
    ///
    /// Returns `ResolverError::InvalidTarget` when the descriptor cannot be
    /// parsed; this is the only caller-visible failure of construction.
    pub fn build_from_uri(
        &self,
        descriptor: &str,
        client: impl RoutingClient,
    ) -> Result<WatchSession> {
        let target = ServiceTarget::parse(descriptor)?;
        Ok(self.build(&target, client))
    }
}

impl std::fmt::Debug for ResolverBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverBuilder").finish_non_exhaustive()
    }
}

/// Handle for one running watch pipeline.
///
/// The session owns the cancellation signal shared by the watcher and sink
/// loops. Dropping the session signals cancellation as well; [`close`]
/// merely makes the teardown explicit.
///
/// [`close`]: WatchSession::close
#[derive(Debug)]
pub struct WatchSession {
    cancel: CancellationToken,
    watcher: Option<JoinHandle<()>>,
    sink: Option<JoinHandle<()>>,
}

impl WatchSession {
    /// Signals both loops to terminate.
    ///
    /// Idempotent and non-blocking; safe to call from any context. The loops
    /// observe the signal at their next suspension point. This does not
    /// wait for them to finish (see [`shutdown`](Self::shutdown)).
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Advisory hint to refresh state sooner than the natural event cadence.
    ///
    /// The watch transport delivers changes as they happen, so there is
    /// nothing to refresh eagerly; the hint is accepted and recorded only.
    pub fn resolve_now(&self) {
        debug!("resolve-now hint received");
    }

    /// Returns true once the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Closes the session and waits for both loops to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }
        if let Some(sink) = self.sink.take() {
            let _ = sink.await;
        }
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::mock::{MockMembershipWatch, RecordingRouter};

    #[tokio::test]
    async fn build_is_synchronous_and_close_is_idempotent() {
        let (watch, _events) = MockMembershipWatch::channel();
        let (router, _updates) = RecordingRouter::channel();
        let builder = ResolverBuilder::new(watch);

        let target = ServiceTarget::new("svc-a").unwrap();
        let session = builder.build(&target, Arc::clone(&router));

        assert!(!session.is_closed());
        session.close();
        session.close();
        assert!(session.is_closed());

        timeout(Duration::from_secs(1), session.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn build_from_uri_rejects_bad_descriptors() {
        let (watch, _events) = MockMembershipWatch::channel();
        let (router, _updates) = RecordingRouter::channel();
        let builder = ResolverBuilder::new(watch);

        assert!(builder.build_from_uri("dns://svc-a", Arc::clone(&router)).is_err());
    }

    #[tokio::test]
    async fn build_from_uri_defaults_the_namespace() {
        let (watch, _events) = MockMembershipWatch::channel();
        let (router, _updates) = RecordingRouter::channel();
        let builder = ResolverBuilder::new(watch);

        let session = builder.build_from_uri("endpoints://svc-a", Arc::clone(&router)).unwrap();
        timeout(Duration::from_secs(1), session.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn resolve_now_is_accepted_while_running() {
        let (watch, _events) = MockMembershipWatch::channel();
        let (router, _updates) = RecordingRouter::channel();
        let builder = ResolverBuilder::new(watch);

        let target = ServiceTarget::new("svc-a").unwrap();
        let session = builder.build(&target, Arc::clone(&router));

        session.resolve_now();
        assert!(!session.is_closed());

        timeout(Duration::from_secs(1), session.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn dropping_the_session_cancels_the_loops() {
        let (watch, _events) = MockMembershipWatch::channel();
        let (router, _updates) = RecordingRouter::channel();
        let builder = ResolverBuilder::new(watch);

        let target = ServiceTarget::new("svc-a").unwrap();
        let session = builder.build(&target, Arc::clone(&router));
        let cancel = session.cancel.clone();

        drop(session);

        assert!(cancel.is_cancelled());
    }
}
