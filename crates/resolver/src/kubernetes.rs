//! Kubernetes watch transport.
//!
//! Watches `v1/Endpoints` records through the kube client, scoped by a
//! `metadata.name` field selector so exactly one record is observed. The
//! subscription performs an initial list (emitting `Created` snapshots and
//! anchoring the resource version), then follows the watch stream. When the
//! server closes the watch window, the stream errors, or the resource
//! version expires (`410 Gone`), the transport re-lists and re-watches on
//! its own with capped exponential backoff. Consumers only ever see
//! `Error` events for the transient failures in between.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, ListParams, WatchEvent as KubeWatchEvent, WatchParams};
use kube::Client;
use parking_lot::Mutex;
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::config::ServiceTarget;
use crate::error::{KubernetesSnafu, Result};
use crate::membership::{EndpointPort, MembershipRecord, Subset};
use crate::watch::{MembershipWatch, Subscription, WatchEvent};

/// Backoff floor between re-establishment attempts.
const RESYNC_BACKOFF_MIN: Duration = Duration::from_millis(250);

/// Backoff ceiling between re-establishment attempts.
const RESYNC_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// HTTP status of an expired watch window.
const GONE: u16 = 410;

/// Membership watch transport backed by a Kubernetes cluster.
///
/// The cluster client is built from the ambient configuration (in-cluster
/// service account or kubeconfig) the first time a subscription is opened;
/// a malformed or absent configuration therefore surfaces as the fatal
/// setup error of the watcher that requested the subscription. Callers that
/// want that failure at construction time instead build the client
/// themselves and use [`with_client`](Self::with_client).
pub struct KubernetesWatch {
    client: Mutex<Option<Client>>,
}

impl KubernetesWatch {
    /// Creates a transport that infers its cluster client on first use.
    #[must_use]
    pub fn new() -> Self {
        Self { client: Mutex::new(None) }
    }

    /// Creates a transport over an already-configured cluster client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client: Mutex::new(Some(client)) }
    }

    async fn client(&self) -> Result<Client> {
        if let Some(client) = self.client.lock().clone() {
            return Ok(client);
        }
        let client = Client::try_default().await.context(KubernetesSnafu)?;
        Ok(self.client.lock().get_or_insert(client).clone())
    }
}

impl Default for KubernetesWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KubernetesWatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesWatch").finish_non_exhaustive()
    }
}

#[async_trait]
impl MembershipWatch for KubernetesWatch {
    async fn list_and_watch(&self, target: &ServiceTarget) -> Result<Subscription> {
        let client = self.client().await?;
        let api: Api<corev1::Endpoints> = Api::namespaced(client, target.namespace());
        let selector = format!("metadata.name={}", target.service());
        let list_params = ListParams::default().fields(&selector);
        let watch_params = WatchParams::default().fields(&selector).disable_bookmarks();

        let list = api.list(&list_params).await.context(KubernetesSnafu)?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let initial: Vec<WatchEvent> =
            list.items.into_iter().map(|endpoints| WatchEvent::Created(record_from(endpoints))).collect();

        let watch =
            api.watch(&watch_params, &resource_version).await.context(KubernetesSnafu)?;
        debug!(service = %target, resource_version = %resource_version, "endpoints watch established");

        let state = WatchState {
            api,
            list_params,
            watch_params,
            target: target.clone(),
            resource_version,
            stream: Some(watch.boxed()),
            pending: VecDeque::new(),
            attempt: 0,
        };

        let follow = stream::unfold(state, |mut state| async move {
            let event = state.next().await;
            Some((event, state))
        });
        Ok(Subscription::new(stream::iter(initial).chain(follow)))
    }
}

/// One live watch plus the bookkeeping needed to survive its expiry.
struct WatchState {
    api: Api<corev1::Endpoints>,
    list_params: ListParams,
    watch_params: WatchParams,
    target: ServiceTarget,
    resource_version: String,
    stream: Option<BoxStream<'static, kube::Result<KubeWatchEvent<corev1::Endpoints>>>>,
    pending: VecDeque<WatchEvent>,
    attempt: u32,
}

impl WatchState {
    /// Produces the next domain event, re-establishing the watch as needed.
    /// Never terminates the stream: transient failures become `Error`
    /// events and trigger an internal resync.
    async fn next(&mut self) -> WatchEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }

            let polled = match self.stream.as_mut() {
                Some(stream) => stream.next().await,
                None => {
                    if let Some(event) = self.reestablish().await {
                        return event;
                    }
                    continue;
                }
            };

            match polled {
                Some(Ok(KubeWatchEvent::Added(endpoints))) => {
                    self.track_version(&endpoints);
                    return WatchEvent::Created(record_from(endpoints));
                }
                Some(Ok(KubeWatchEvent::Modified(endpoints))) => {
                    self.track_version(&endpoints);
                    return WatchEvent::Updated(record_from(endpoints));
                }
                Some(Ok(KubeWatchEvent::Deleted(endpoints))) => {
                    self.track_version(&endpoints);
                    return WatchEvent::Deleted(record_from(endpoints));
                }
                Some(Ok(KubeWatchEvent::Bookmark(bookmark))) => {
                    // Bookmarks are disabled in the watch params; if one
                    // arrives anyway it only advances the version anchor.
                    self.resource_version = bookmark.metadata.resource_version.clone();
                }
                Some(Ok(KubeWatchEvent::Error(status))) => {
                    if status.code == GONE {
                        // The version window expired; resync from a fresh list.
                        self.resource_version.clear();
                        self.stream = None;
                    }
                    return WatchEvent::Error(status.message);
                }
                Some(Err(e)) => {
                    self.stream = None;
                    return WatchEvent::Error(e.to_string());
                }
                None => {
                    // Server closed the watch window; re-establish from the
                    // tracked version.
                    debug!(service = %self.target, "watch window closed, re-establishing");
                    self.stream = None;
                }
            }
        }
    }

    /// Re-lists and re-watches after the current stream died. A fresh list
    /// is replayed as resync snapshots; an empty list means the record is
    /// gone and is replayed as a deletion. Returns the event to surface, if
    /// any; `None` hands control back to the polling loop.
    async fn reestablish(&mut self) -> Option<WatchEvent> {
        self.attempt = self.attempt.saturating_add(1);
        let backoff = resync_backoff(self.attempt);
        warn!(
            service = %self.target,
            attempt = self.attempt,
            backoff_ms = backoff.as_millis() as u64,
            "re-establishing endpoints watch"
        );
        tokio::time::sleep(backoff).await;

        let list = match self.api.list(&self.list_params).await {
            Ok(list) => list,
            Err(e) => return Some(WatchEvent::Error(e.to_string())),
        };
        self.resource_version = list.metadata.resource_version.clone().unwrap_or_default();

        if list.items.is_empty() {
            self.pending.push_back(WatchEvent::Deleted(MembershipRecord::new(
                self.target.service(),
                self.target.namespace(),
                [],
            )));
        } else {
            self.pending.extend(
                list.items.into_iter().map(|endpoints| WatchEvent::Updated(record_from(endpoints))),
            );
        }

        match self.api.watch(&self.watch_params, &self.resource_version).await {
            Ok(stream) => {
                self.attempt = 0;
                self.stream = Some(stream.boxed());
            }
            Err(e) => return Some(WatchEvent::Error(e.to_string())),
        }

        self.pending.pop_front()
    }

    fn track_version(&mut self, endpoints: &corev1::Endpoints) {
        if let Some(version) = &endpoints.metadata.resource_version {
            self.resource_version.clone_from(version);
        }
    }
}

/// Capped exponential backoff for resync attempts.
fn resync_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(8);
    RESYNC_BACKOFF_MIN.saturating_mul(2u32.saturating_pow(exponent)).min(RESYNC_BACKOFF_MAX)
}

/// Converts the cluster's endpoints object into a membership snapshot.
///
/// Only ready addresses participate; ports outside the valid range are
/// dropped rather than rejected, keeping extraction total.
fn record_from(endpoints: corev1::Endpoints) -> MembershipRecord {
    let name = endpoints.metadata.name.unwrap_or_default();
    let namespace = endpoints.metadata.namespace.unwrap_or_default();
    let subsets = endpoints
        .subsets
        .unwrap_or_default()
        .into_iter()
        .map(|subset| Subset {
            addresses: subset
                .addresses
                .unwrap_or_default()
                .into_iter()
                .map(|address| address.ip)
                .collect(),
            ports: subset
                .ports
                .unwrap_or_default()
                .into_iter()
                .filter_map(|port| {
                    u16::try_from(port.port)
                        .ok()
                        .map(|number| EndpointPort { port: number, protocol: port.protocol })
                })
                .collect(),
        })
        .collect();
    MembershipRecord { name, namespace, subsets }
}
