use crate::{ClusterInfo, Event, Registry};
use kubert::index::{IndexClusterResource, IndexNamespacedResource};
use logsink_controller_core::{LogSinkSpec, SecretKeyRef, SinkId, SinkKind, SinkStatus};
use logsink_controller_k8s_api as k8s;
use logsink_controller_k8s_status::{ReconciliationState, SharedState, Update};
use std::sync::Arc;
use tokio::sync::mpsc;

fn new_registry() -> (Registry, SharedState, mpsc::Receiver<Update>) {
    let (updates_tx, updates_rx) = mpsc::channel(100);
    let state = ReconciliationState::shared(["knative-observability/fluent-bit"], updates_tx);
    let cluster_info = Arc::new(ClusterInfo {
        controller_ns: "knative-observability".to_string(),
    });
    (Registry::new(cluster_info, state.clone()), state, updates_rx)
}

fn apply_sink(registry: &mut Registry, sink: k8s::LogSink) {
    IndexNamespacedResource::apply(registry, sink)
}

fn apply_cluster_sink(registry: &mut Registry, sink: k8s::ClusterLogSink) {
    IndexClusterResource::apply(registry, sink)
}

fn sink_spec(type_: &str) -> k8s::SinkSpec {
    k8s::SinkSpec {
        type_: type_.to_string(),
        host: Some("receiver".to_string()),
        port: Some(24903),
        url: Some("https://receiver:7070/webhook".to_string()),
        ..k8s::SinkSpec::default()
    }
}

fn mk_sink(ns: &str, name: &str, sink: k8s::SinkSpec) -> k8s::LogSink {
    k8s::LogSink {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: k8s::LogSinkSpec { sink },
        status: None,
    }
}

fn mk_cluster_sink(name: &str, sink: k8s::SinkSpec) -> k8s::ClusterLogSink {
    k8s::ClusterLogSink {
        metadata: k8s::ObjectMeta {
            name: Some(name.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: k8s::ClusterLogSinkSpec { sink },
        status: None,
    }
}

#[test]
fn applies_and_deletes_namespaced_sinks() {
    let (mut registry, _, _updates) = new_registry();
    let mut changes = registry.subscribe();

    apply_sink(&mut registry, mk_sink("ns-a", "sink", sink_spec("syslog")));
    assert!(changes.has_changed().unwrap());
    let _ = changes.borrow_and_update();

    let snapshot = registry.snapshot();
    let id = SinkId::namespaced("ns-a", "sink");
    let spec = snapshot.get(&id).expect("sink must be indexed");
    assert!(matches!(spec.kind, SinkKind::Syslog(_)));

    IndexNamespacedResource::<k8s::LogSink>::delete(
        &mut registry,
        "ns-a".to_string(),
        "sink".to_string(),
    );
    assert!(changes.has_changed().unwrap());
    assert!(registry.is_empty());
}

#[test]
fn unchanged_sink_does_not_notify() {
    let (mut registry, _, _updates) = new_registry();
    let mut changes = registry.subscribe();

    apply_sink(&mut registry, mk_sink("ns-a", "sink", sink_spec("syslog")));
    let _ = changes.borrow_and_update();

    apply_sink(&mut registry, mk_sink("ns-a", "sink", sink_spec("syslog")));
    assert!(!changes.has_changed().unwrap());

    IndexNamespacedResource::<k8s::LogSink>::delete(
        &mut registry,
        "ns-a".to_string(),
        "unknown".to_string(),
    );
    assert!(!changes.has_changed().unwrap());
}

#[test]
fn events() {
    let (mut registry, _, _updates) = new_registry();
    let spec = LogSinkSpec {
        id: SinkId::cluster("all"),
        kind: SinkKind::Webhook(Default::default()),
        insecure_skip_verify: false,
        credentials: None,
    };

    assert!(registry.apply_event(Event::Added(spec.clone())));
    // Re-adding an identical sink is a modification that changes nothing.
    assert!(!registry.apply_event(Event::Added(spec.clone())));
    assert!(!registry.apply_event(Event::Modified(spec.clone())));
    assert_eq!(registry.len(), 1);

    assert!(registry.apply_event(Event::Deleted(spec.id.clone())));
    assert!(!registry.apply_event(Event::Deleted(spec.id)));
    assert!(registry.is_empty());
}

#[test]
fn credentials_are_resolved_per_scope() {
    let (mut registry, _, _updates) = new_registry();
    let with_creds = || k8s::SinkSpec {
        credentials_secret_ref: Some(k8s::SecretKeySelector {
            name: "ca".to_string(),
            key: "ca.crt".to_string(),
        }),
        ..sink_spec("webhook")
    };
    apply_sink(&mut registry, mk_sink("ns-a", "hook", with_creds()));
    apply_cluster_sink(&mut registry, mk_cluster_sink("all", with_creds()));

    let snapshot = registry.snapshot();
    let credentials = |id: &SinkId| snapshot.get(id).and_then(|s| s.credentials.clone());
    assert_eq!(
        credentials(&SinkId::namespaced("ns-a", "hook")),
        Some(SecretKeyRef {
            namespace: "ns-a".to_string(),
            name: "ca".to_string(),
            key: "ca.crt".to_string(),
        })
    );
    assert_eq!(
        credentials(&SinkId::cluster("all")),
        Some(SecretKeyRef {
            namespace: "knative-observability".to_string(),
            name: "ca".to_string(),
            key: "ca.crt".to_string(),
        })
    );
}

#[test]
fn snapshots_are_isolated_from_later_changes() {
    let (mut registry, _, _updates) = new_registry();
    apply_sink(&mut registry, mk_sink("ns-a", "sink", sink_spec("syslog")));
    let before = registry.snapshot();

    apply_sink(&mut registry, mk_sink("ns-b", "sink", sink_spec("syslog")));
    IndexNamespacedResource::<k8s::LogSink>::delete(
        &mut registry,
        "ns-a".to_string(),
        "sink".to_string(),
    );

    assert_eq!(before.len(), 1);
    assert!(before.get(&SinkId::namespaced("ns-a", "sink")).is_some());
    let after = registry.snapshot();
    assert_eq!(after.len(), 1);
    assert!(after.get(&SinkId::namespaced("ns-b", "sink")).is_some());
}

#[test]
fn reset_replaces_only_its_scope() {
    let (mut registry, state, _updates) = new_registry();
    apply_sink(&mut registry, mk_sink("ns-a", "old", sink_spec("syslog")));
    apply_cluster_sink(&mut registry, mk_cluster_sink("all", sink_spec("syslog")));

    IndexNamespacedResource::reset(
        &mut registry,
        vec![mk_sink("ns-b", "new", sink_spec("syslog"))],
        Default::default(),
    );

    let snapshot = registry.snapshot();
    let ids = snapshot.iter().map(|s| s.id.clone()).collect::<Vec<_>>();
    assert_eq!(
        ids,
        vec![SinkId::namespaced("ns-b", "new"), SinkId::cluster("all")]
    );
    assert!(state
        .read()
        .status(&SinkId::namespaced("ns-a", "old"))
        .is_none());

    IndexClusterResource::reset(&mut registry, vec![], Default::default());
    assert_eq!(registry.len(), 1);
}

#[test]
fn invalid_sinks_are_reported_eagerly() {
    let (mut registry, state, _updates) = new_registry();
    let bad = k8s::SinkSpec {
        host: None,
        ..sink_spec("syslog")
    };
    apply_sink(&mut registry, mk_sink("ns-a", "bad", bad));
    apply_sink(&mut registry, mk_sink("ns-a", "good", sink_spec("syslog")));
    apply_cluster_sink(&mut registry, mk_cluster_sink("kafka", sink_spec("kafka")));

    // Invalid sinks are still recorded; they are excluded at compilation.
    assert_eq!(registry.len(), 3);

    let state = state.read();
    assert!(matches!(
        state.status(&SinkId::namespaced("ns-a", "bad")),
        Some(SinkStatus::Invalid(_))
    ));
    assert!(matches!(
        state.status(&SinkId::cluster("kafka")),
        Some(SinkStatus::Invalid(_))
    ));
    // Valid sinks wait for the reconciler.
    assert!(matches!(
        state.status(&SinkId::namespaced("ns-a", "good")),
        Some(SinkStatus::Pending(_))
    ));
}
