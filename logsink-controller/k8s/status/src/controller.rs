use crate::state::{SharedState, Update};
use kubert::lease::Claim;
use logsink_controller_core::{SinkId, CONTROLLER_NAME};
use logsink_controller_k8s_api as k8s;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use serde::de::DeserializeOwned;
use std::{fmt::Debug, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Duration},
};

/// Writes sink status patches to the API server while this replica holds the write lease.
pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    client: k8s::Client,
    name: String,
    updates: mpsc::Receiver<Update>,
    state: SharedState,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
    patch_dequeued: Counter,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: k8s::Client,
        name: impl ToString,
        updates: mpsc::Receiver<Update>,
        state: SharedState,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            client,
            name: name.to_string(),
            updates,
            state,
            patch_timeout,
            metrics,
        }
    }

    /// Process updates received from the reconciliation state and patch resources' statuses.
    pub async fn run(mut self) {
        let params = k8s::PatchParams::apply(CONTROLLER_NAME);

        while let Some(Update { id, patch }) = self.updates.recv().await {
            self.metrics.patch_dequeued.inc();

            // Only the lease holder writes status. Followers drop their updates; the next leader
            // republishes every status when it acquires the lease.
            if !self.claims.borrow().is_current_for(&self.name) {
                tracing::trace!(%id, "Not the lease holder; skipping status patch");
                continue;
            }

            let patched = match &id {
                SinkId::Namespaced { namespace, name } => {
                    let api = k8s::Api::<k8s::LogSink>::namespaced(self.client.clone(), namespace);
                    self.patch(api, name, &params, &patch).await
                }
                SinkId::Cluster { name } => {
                    let api = k8s::Api::<k8s::ClusterLogSink>::all(self.client.clone());
                    self.patch(api, name, &params, &patch).await
                }
            };

            match patched {
                Ok(Ok(())) => {
                    tracing::debug!(%id, "Patched sink status");
                    self.metrics.patch_succeeded.inc();
                }
                Ok(Err(error)) => {
                    tracing::error!(%id, %error, "Failed to patch sink status");
                    self.metrics.patch_failed.inc();
                    self.state.write().unpublished(&id);
                }
                Err(_) => {
                    tracing::error!(%id, timeout = ?self.patch_timeout, "Timed out patching sink status");
                    self.metrics.patch_timeout.inc();
                    self.state.write().unpublished(&id);
                }
            }
        }

        tracing::debug!("Status updates closed");
    }

    async fn patch<K>(
        &self,
        api: k8s::Api<K>,
        name: &str,
        params: &k8s::PatchParams,
        patch: &k8s::Patch<serde_json::Value>,
    ) -> Result<Result<(), k8s::Error>, time::error::Elapsed>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        time::timeout(self.patch_timeout, api.patch_status(name, params, patch))
            .await
            .map(|res| res.map(|_| ()))
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful patch operations",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of failed patch operations",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Count of patch operations that timed out",
            patch_timeout.clone(),
        );

        let patch_dequeued = Counter::default();
        prom.register(
            "patch_dequeued",
            "Count of patches dequeued from the update channel",
            patch_dequeued.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
            patch_dequeued,
        }
    }
}
