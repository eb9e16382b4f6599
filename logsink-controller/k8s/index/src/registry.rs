use crate::{conversion, ClusterInfo};
use kubert::index::{ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use logsink_controller_core::{output, LogSinkSpec, RegistrySnapshot, Scope, SinkId};
use logsink_controller_k8s_api::{self as k8s, ResourceExt};
use logsink_controller_k8s_status::SharedState;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;

pub type SharedRegistry = Arc<RwLock<Registry>>;

/// A change to the set of declared sinks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Added(LogSinkSpec),
    Modified(LogSinkSpec),
    Deleted(SinkId),
}

/// Holds the declared intent of every sink in the cluster.
///
/// The sink map is shared copy-on-write with the snapshots that have been taken from it, so taking
/// a snapshot is cheap and a snapshot never observes later changes.
#[derive(Debug)]
pub struct Registry {
    sinks: Arc<BTreeMap<SinkId, LogSinkSpec>>,
    cluster_info: Arc<ClusterInfo>,

    /// Receives eager validation results so that invalid sinks are reported without waiting for
    /// the next compilation.
    status: SharedState,

    changes: watch::Sender<u64>,
}

// === impl Registry ===

impl Registry {
    pub fn new(cluster_info: Arc<ClusterInfo>, status: SharedState) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            sinks: Default::default(),
            cluster_info,
            status,
            changes,
        }
    }

    pub fn shared(cluster_info: Arc<ClusterInfo>, status: SharedState) -> SharedRegistry {
        Arc::new(RwLock::new(Self::new(cluster_info, status)))
    }

    /// Returns the current contents of the registry. Never blocks writers for longer than it takes
    /// to clone a reference.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot::new(self.sinks.clone())
    }

    /// Subscribes to the registry's change generation. The value is incremented whenever the
    /// registry's contents change; intermediate values may be skipped.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Counts the sinks declared with the given scope.
    pub fn count(&self, scope: Scope) -> usize {
        self.sinks.keys().filter(|id| id.scope() == scope).count()
    }

    /// Applies a change to the registry, returning true if the registry's contents changed.
    ///
    /// Adding a sink that already exists is treated as a modification and deleting an unknown sink
    /// is a no-op.
    pub fn apply_event(&mut self, event: Event) -> bool {
        let changed = match event {
            Event::Added(spec) | Event::Modified(spec) => self.upsert(spec, None),
            Event::Deleted(id) => self.remove(&id),
        };
        if changed {
            self.notify();
        }
        changed
    }

    fn upsert(&mut self, spec: LogSinkSpec, generation: Option<i64>) -> bool {
        let validation = output::build(&spec).err();
        if let Some(error) = validation.as_ref() {
            tracing::info!(id = %spec.id, %error, "Invalid sink");
        }
        self.status.write().observe(&spec, generation, validation);

        if self.sinks.get(&spec.id) == Some(&spec) {
            return false;
        }
        tracing::debug!(id = %spec.id, "Updating sink");
        Arc::make_mut(&mut self.sinks).insert(spec.id.clone(), spec);
        true
    }

    fn remove(&mut self, id: &SinkId) -> bool {
        self.status.write().forget(id);
        if !self.sinks.contains_key(id) {
            return false;
        }
        tracing::debug!(%id, "Removing sink");
        Arc::make_mut(&mut self.sinks).remove(id);
        true
    }

    /// Replaces every sink of the given scope. Used when a watch is restarted and the API server
    /// provides a complete list of resources.
    fn reset_scope(&mut self, scope: Scope, specs: Vec<(LogSinkSpec, Option<i64>)>) {
        let mut sinks = self
            .sinks
            .iter()
            .filter(|(id, _)| id.scope() != scope)
            .map(|(id, spec)| (id.clone(), spec.clone()))
            .collect::<BTreeMap<_, _>>();

        for (spec, generation) in specs {
            let validation = output::build(&spec).err();
            self.status.write().observe(&spec, generation, validation);
            sinks.insert(spec.id.clone(), spec);
        }

        let removed = self
            .sinks
            .keys()
            .filter(|id| !sinks.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        if !removed.is_empty() {
            let mut status = self.status.write();
            for id in &removed {
                tracing::debug!(%id, "Removing sink");
                status.forget(id);
            }
        }

        if *self.sinks != sinks {
            self.sinks = Arc::new(sinks);
            self.notify();
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }
}

impl IndexNamespacedResource<k8s::LogSink> for Registry {
    fn apply(&mut self, sink: k8s::LogSink) {
        let Some(spec) = conversion::namespaced_spec(&sink) else {
            tracing::warn!(name = %sink.name_unchecked(), "LogSink has no namespace");
            return;
        };
        if self.upsert(spec, sink.metadata.generation) {
            self.notify();
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.apply_event(Event::Deleted(SinkId::namespaced(namespace, name)));
    }

    fn reset(&mut self, sinks: Vec<k8s::LogSink>, _removed: NamespacedRemoved) {
        let specs = sinks
            .iter()
            .filter_map(|sink| {
                let spec = conversion::namespaced_spec(sink)?;
                Some((spec, sink.metadata.generation))
            })
            .collect();
        self.reset_scope(Scope::Namespace, specs);
    }
}

impl IndexClusterResource<k8s::ClusterLogSink> for Registry {
    fn apply(&mut self, sink: k8s::ClusterLogSink) {
        let spec = conversion::cluster_spec(&sink, &self.cluster_info.controller_ns);
        if self.upsert(spec, sink.metadata.generation) {
            self.notify();
        }
    }

    fn delete(&mut self, name: String) {
        self.apply_event(Event::Deleted(SinkId::cluster(name)));
    }

    fn reset(&mut self, sinks: Vec<k8s::ClusterLogSink>, _removed: ClusterRemoved) {
        let specs = sinks
            .iter()
            .map(|sink| {
                let spec = conversion::cluster_spec(sink, &self.cluster_info.controller_ns);
                (spec, sink.metadata.generation)
            })
            .collect();
        self.reset_scope(Scope::Cluster, specs);
    }
}
