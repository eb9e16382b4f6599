use ahash::AHashMap as HashMap;
#[cfg(not(test))]
use chrono::offset::Utc;
use logsink_controller_core::{
    Fingerprint, LogSinkSpec, RegistrySnapshot, Scope, SinkId, SinkStatus, ValidationError,
};
use logsink_controller_k8s_api as k8s;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;

pub type SharedState = Arc<RwLock<ReconciliationState>>;

/// What a target's reconciler is currently doing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Compiling,
    Diffing,
    Applying,

    /// The last attempt failed; a retry is scheduled.
    Failed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetState {
    pub phase: Phase,

    /// The fingerprint of the configuration most recently confirmed on the target.
    pub last_applied: Option<Fingerprint>,

    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// Tracks reconciliation progress for every target and the resulting status of every sink.
///
/// A sink's reported status is the aggregate of its status on every target: `Invalid` wins over
/// `Pending`, which wins over `Ready`. A status patch is only emitted when a sink's aggregate
/// status (or observed generation) changes.
#[derive(Debug)]
pub struct ReconciliationState {
    targets: BTreeMap<String, TargetState>,
    sinks: HashMap<SinkId, SinkState>,
    updates: mpsc::Sender<Update>,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: SinkId,
    pub patch: k8s::Patch<serde_json::Value>,
}

#[derive(Debug, Default)]
struct SinkState {
    spec: Option<LogSinkSpec>,
    generation: Option<i64>,
    invalid: Option<ValidationError>,
    targets: BTreeMap<String, SinkStatus>,
    published: Option<(Option<i64>, SinkStatus)>,
}

// === impl ReconciliationState ===

impl ReconciliationState {
    pub fn new(
        targets: impl IntoIterator<Item = impl ToString>,
        updates: mpsc::Sender<Update>,
    ) -> Self {
        Self {
            targets: targets
                .into_iter()
                .map(|t| (t.to_string(), TargetState::default()))
                .collect(),
            sinks: HashMap::new(),
            updates,
        }
    }

    pub fn shared(
        targets: impl IntoIterator<Item = impl ToString>,
        updates: mpsc::Sender<Update>,
    ) -> SharedState {
        Arc::new(RwLock::new(Self::new(targets, updates)))
    }

    pub fn target(&self, name: &str) -> Option<&TargetState> {
        self.targets.get(name)
    }

    pub fn set_phase(&mut self, target: &str, phase: Phase) {
        if let Some(state) = self.targets.get_mut(target) {
            state.phase = phase;
        }
    }

    /// Records that a configuration has been confirmed on a target.
    pub fn applied(&mut self, target: &str, fingerprint: Fingerprint) {
        if let Some(state) = self.targets.get_mut(target) {
            state.last_applied = Some(fingerprint);
        }
    }

    /// Records that a reconciliation pass brought the target up to date.
    pub fn completed(&mut self, target: &str) {
        if let Some(state) = self.targets.get_mut(target) {
            state.phase = Phase::Idle;
            state.consecutive_failures = 0;
            state.last_error = None;
        }
    }

    pub fn failed(&mut self, target: &str, error: impl ToString) {
        if let Some(state) = self.targets.get_mut(target) {
            state.phase = Phase::Failed;
            state.consecutive_failures += 1;
            state.last_error = Some(error.to_string());
        }
    }

    /// Records the latest declaration of a sink along with the result of validating it.
    ///
    /// Invalid sinks are reported immediately. When a sink's declaration changes, its per-target
    /// statuses are discarded until the targets have been reconciled against the new declaration.
    pub fn observe(
        &mut self,
        spec: &LogSinkSpec,
        generation: Option<i64>,
        invalid: Option<ValidationError>,
    ) {
        let sink = self.sinks.entry(spec.id.clone()).or_default();
        if sink.spec.as_ref() != Some(spec)
            || sink.generation != generation
            || sink.invalid != invalid
        {
            sink.targets.clear();
        }
        sink.spec = Some(spec.clone());
        sink.generation = generation;
        sink.invalid = invalid;
        self.publish(&spec.id);
    }

    /// Stops tracking a deleted sink.
    pub fn forget(&mut self, id: &SinkId) {
        self.sinks.remove(id);
    }

    /// Records the status of sinks on a target after a reconciliation pass over `compiled`.
    ///
    /// Sinks that are not (or no longer) observed are ignored, as are sinks whose declaration
    /// changed after `compiled` was taken: the target does not hold their new declaration yet.
    pub fn report(
        &mut self,
        target: &str,
        compiled: &RegistrySnapshot,
        statuses: BTreeMap<SinkId, SinkStatus>,
    ) {
        if !self.targets.contains_key(target) {
            tracing::debug!(%target, "Ignoring report for unknown target");
            return;
        }
        for (id, status) in statuses {
            let Some(sink) = self.sinks.get_mut(&id) else {
                continue;
            };
            if sink.spec.as_ref() != compiled.get(&id) {
                tracing::debug!(%id, %target, "Ignoring status for a superseded declaration");
                continue;
            }
            sink.targets.insert(target.to_string(), status);
            self.publish(&id);
        }
    }

    /// Marks a sink's status as not written, e.g. because the patch failed, so that it is sent
    /// again on the next report.
    pub fn unpublished(&mut self, id: &SinkId) {
        if let Some(sink) = self.sinks.get_mut(id) {
            sink.published = None;
        }
    }

    /// Returns the aggregate status of a sink.
    pub fn status(&self, id: &SinkId) -> Option<SinkStatus> {
        self.sinks.get(id).map(|sink| self.aggregate(sink))
    }

    /// Re-sends the status of every sink, e.g. after acquiring leadership.
    pub fn republish(&mut self) {
        let ids = self.sinks.keys().cloned().collect::<Vec<_>>();
        for id in ids {
            if let Some(sink) = self.sinks.get_mut(&id) {
                sink.published = None;
            }
            self.publish(&id);
        }
    }

    fn aggregate(&self, sink: &SinkState) -> SinkStatus {
        if let Some(error) = sink.invalid.as_ref() {
            return SinkStatus::Invalid(error.to_string());
        }
        self.targets
            .keys()
            .map(|target| match sink.targets.get(target) {
                Some(status) => status.clone(),
                None => SinkStatus::Pending(format!("Waiting for {target} to be reconciled")),
            })
            .reduce(SinkStatus::merge)
            .unwrap_or_else(|| SinkStatus::Pending("No targets are configured".to_string()))
    }

    fn publish(&mut self, id: &SinkId) {
        let Some(sink) = self.sinks.get(id) else {
            return;
        };
        let published = (sink.generation, self.aggregate(sink));
        if sink.published.as_ref() == Some(&published) {
            return;
        }

        let (generation, status) = &published;
        tracing::debug!(%id, %status, "Updating sink status");
        let patch = make_patch(id, *generation, status);
        match self.updates.try_send(Update {
            id: id.clone(),
            patch,
        }) {
            Ok(()) => {
                if let Some(sink) = self.sinks.get_mut(id) {
                    sink.published = Some(published);
                }
            }
            Err(error) => {
                tracing::error!(%id, %error, "Failed to send sink status patch");
            }
        }
    }
}

pub(crate) fn make_patch(
    id: &SinkId,
    generation: Option<i64>,
    status: &SinkStatus,
) -> k8s::Patch<serde_json::Value> {
    #[cfg(not(test))]
    let timestamp = Utc::now();
    #[cfg(test)]
    let timestamp = chrono::DateTime::<chrono::Utc>::MIN_UTC;

    let condition_status = match status {
        SinkStatus::Ready => "True",
        SinkStatus::Invalid(_) => "False",
        SinkStatus::Pending(_) => "Unknown",
    };
    let status = k8s::LogSinkStatus {
        observed_generation: generation,
        conditions: vec![k8s::Condition {
            type_: "Ready".to_string(),
            status: condition_status.to_string(),
            reason: status.reason().to_string(),
            message: status.message().to_string(),
            last_transition_time: Some(timestamp.to_rfc3339()),
        }],
    };
    let kind = match id.scope() {
        Scope::Namespace => "LogSink",
        Scope::Cluster => "ClusterLogSink",
    };
    k8s::Patch::Merge(serde_json::json!({
        "apiVersion": k8s::API_VERSION,
        "kind": kind,
        "status": status,
    }))
}
