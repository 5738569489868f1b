//! The state sink loop.
//!
//! One sink task per pipeline instance: it drains address lists off the
//! handoff queue and applies each one, unconditionally, as the full
//! replacement state of the routing client. A failed push is logged and
//! superseded by the next natural emission; it is never retried here.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::routing::RoutingClient;

/// Runs the sink loop until cancellation or queue closure.
pub(crate) async fn run_sink(
    client: Arc<dyn RoutingClient>,
    mut rx: mpsc::Receiver<Vec<String>>,
    cancel: CancellationToken,
) {
    loop {
        // Cancellation wins over a simultaneously ready snapshot.
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("state sink cancelled");
                return;
            }
            received = rx.recv() => match received {
                Some(addresses) => {
                    if let Err(e) = client.update_addresses(addresses).await {
                        warn!(error = %e, "state update failed, waiting for next emission");
                    }
                }
                None => {
                    debug!("address queue closed, state sink exiting");
                    return;
                }
            },
        }
    }
}
