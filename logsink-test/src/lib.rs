#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::Namespace;
use logsink_controller_core::{CompiledConfig, NamespaceTag, OutputId, RoutingDocument, SinkId};
use logsink_controller_k8s_api::{self as k8s, ConfigMap, ObjectMeta};
use logsink_controller_runtime::{Target, CONFIG_KEY};
use maplit::{btreemap, convert_args};
use std::time::Duration;
use tracing::Instrument;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const TIMEOUT: Duration = Duration::from_secs(60);

/// Runs a test with a random namespace that is deleted on test completion
pub async fn with_temp_ns<F, Fut>(test: F)
where
    F: FnOnce(kube::Client, String) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let _tracing = init_tracing();

    tracing::debug!("initializing client");
    let client = kube::Client::try_default()
        .await
        .expect("failed to initialize k8s client");

    let namespace = create_ns(&client).await;

    tracing::trace!("spawning");
    let test = test(client.clone(), namespace.clone());
    let res = tokio::spawn(test.instrument(tracing::info_span!("test", %namespace))).await;
    if res.is_err() {
        // If the test failed, stop tracing so the log is not polluted with more information about
        // cleanup after the failure was printed.
        drop(_tracing);
    }

    delete_ns(&client, &namespace).await;
    if let Err(err) = res {
        std::panic::resume_unwind(err.into_panic());
    }
}

/// Creates a namespace with a random name.
pub async fn create_ns(client: &kube::Client) -> String {
    let namespace = format!("logsink-test-{}", random_suffix(6));
    let api = kube::Api::<Namespace>::all(client.clone());

    tracing::debug!(%namespace, "creating");
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(namespace.clone()),
            labels: Some(convert_args!(btreemap!(
                "logsink-test" => std::thread::current().name().unwrap_or(""),
            ))),
            ..Default::default()
        },
        ..Default::default()
    };
    api.create(
        &kube::api::PostParams {
            dry_run: false,
            field_manager: Some("logsink-test".to_string()),
        },
        &ns,
    )
    .await
    .expect("failed to create Namespace");
    namespace
}

pub async fn delete_ns(client: &kube::Client, namespace: &str) {
    tracing::debug!(%namespace, "deleting");
    kube::Api::<Namespace>::all(client.clone())
        .delete(namespace, &kube::api::DeleteParams::background())
        .await
        .expect("failed to delete Namespace");
}

/// Creates a namespace-scoped resource.
pub async fn create<T>(client: &kube::Client, obj: T) -> T
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    T: serde::Serialize + serde::de::DeserializeOwned + Clone + std::fmt::Debug,
    T::DynamicType: Default,
{
    let params = kube::api::PostParams {
        field_manager: Some("logsink-test".to_string()),
        ..Default::default()
    };
    let api = obj
        .meta()
        .namespace
        .as_deref()
        .map(|ns| kube::Api::<T>::namespaced(client.clone(), ns))
        .unwrap_or_else(|| kube::Api::<T>::default_namespaced(client.clone()));
    api.create(&params, &obj)
        .await
        .expect("failed to create resource")
}

/// Creates a cluster-scoped resource.
pub async fn create_cluster_scoped<T>(client: &kube::Client, obj: T) -> T
where
    T: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>,
    T: serde::Serialize + serde::de::DeserializeOwned + Clone + std::fmt::Debug,
    T::DynamicType: Default,
{
    let params = kube::api::PostParams {
        field_manager: Some("logsink-test".to_string()),
        ..Default::default()
    };
    kube::Api::<T>::all(client.clone())
        .create(&params, &obj)
        .await
        .expect("failed to create resource")
}

pub async fn delete_cluster_sink(client: &kube::Client, name: &str) {
    kube::Api::<k8s::ClusterLogSink>::all(client.clone())
        .delete(name, &kube::api::DeleteParams::background())
        .await
        .expect("failed to delete ClusterLogSink");
}

pub fn mk_sink(ns: &str, name: &str, sink: k8s::SinkSpec) -> k8s::LogSink {
    k8s::LogSink {
        metadata: ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: k8s::LogSinkSpec { sink },
        status: None,
    }
}

pub fn mk_cluster_sink(name: &str, sink: k8s::SinkSpec) -> k8s::ClusterLogSink {
    k8s::ClusterLogSink {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: k8s::ClusterLogSinkSpec { sink },
        status: None,
    }
}

pub fn syslog(host: &str, port: i64) -> k8s::SinkSpec {
    k8s::SinkSpec {
        type_: "syslog".to_string(),
        host: Some(host.to_string()),
        port: Some(port),
        enable_tls: true,
        insecure_skip_verify: true,
        ..Default::default()
    }
}

pub fn webhook(url: &str) -> k8s::SinkSpec {
    k8s::SinkSpec {
        type_: "webhook".to_string(),
        url: Some(url.to_string()),
        insecure_skip_verify: true,
        ..Default::default()
    }
}

/// The ConfigMap the controller under test writes to. Overridden by `LOGSINK_TEST_TARGET`.
pub fn target() -> Target {
    std::env::var("LOGSINK_TEST_TARGET")
        .ok()
        .and_then(|t| t.parse().ok())
        .unwrap_or_else(|| Target::new("knative-observability", "fluent-bit"))
}

/// Reads the routing document from the target ConfigMap.
pub async fn routing(client: &kube::Client) -> Option<RoutingDocument> {
    let target = target();
    let api = kube::Api::<ConfigMap>::namespaced(client.clone(), &target.namespace);
    let rendered = api
        .get_opt(&target.name)
        .await
        .expect("failed to read target ConfigMap")?
        .data?
        .remove(CONFIG_KEY)?;
    let config = CompiledConfig::parse(&rendered).expect("routing document must be valid");
    Some(config.document().clone())
}

/// Waits until the routing document satisfies a predicate.
pub async fn await_routing(
    client: &kube::Client,
    f: impl Fn(&RoutingDocument) -> bool,
) -> RoutingDocument {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if let Some(doc) = routing(client).await {
            if f(&doc) {
                return doc;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for routing configuration");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Waits until a `LogSink` reports a `Ready` condition with the given reason.
pub async fn await_sink_reason(client: &kube::Client, ns: &str, name: &str, reason: &str) {
    let api = kube::Api::<k8s::LogSink>::namespaced(client.clone(), ns);
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let sink = api.get(name).await.expect("failed to read LogSink");
        let found = sink
            .status
            .iter()
            .flat_map(|s| s.conditions.iter())
            .any(|c| c.type_ == "Ready" && c.reason == reason);
        if found {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {ns}/{name} to be {reason}: {:?}", sink.status);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Lists the outputs that receive records emitted in a namespace.
pub fn outputs_for(doc: &RoutingDocument, namespace: &str) -> Vec<OutputId> {
    let tag = NamespaceTag::for_namespace(namespace);
    doc.outputs_for(&tag).cloned().collect()
}

pub fn namespaced_output(ns: &str, name: &str) -> OutputId {
    OutputId::from(&SinkId::namespaced(ns, name))
}

pub fn cluster_output(name: &str) -> OutputId {
    OutputId::from(&SinkId::cluster(name))
}

pub fn random_suffix(len: usize) -> String {
    use rand::Rng;

    let rng = &mut rand::thread_rng();
    (0..len)
        .map(|_| rng.sample(LowercaseAlphanumeric) as char)
        .collect()
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "logsink=trace,debug".parse().unwrap()),
            )
            .finish(),
    )
}

struct LowercaseAlphanumeric;

// Modified from `rand::distributions::Alphanumeric`
//
// Copyright 2018 Developers of the Rand project
// Copyright (c) 2014 The Rust Project Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
impl rand::distributions::Distribution<u8> for LowercaseAlphanumeric {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> u8 {
        const RANGE: u32 = 26 + 10;
        const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        loop {
            let var = rng.next_u32() >> (32 - 6);
            if var < RANGE {
                return CHARSET[var as usize];
            }
        }
    }
}
