use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Forwards the logs and events of a single namespace to a destination.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "observability.knative.dev",
    version = "v1alpha1",
    kind = "LogSink",
    status = "LogSinkStatus",
    namespaced
)]
pub struct LogSinkSpec {
    #[serde(flatten)]
    pub sink: SinkSpec,
}

/// Forwards the logs and events of every namespace to a destination.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "observability.knative.dev",
    version = "v1alpha1",
    kind = "ClusterLogSink",
    status = "LogSinkStatus"
)]
pub struct ClusterLogSinkSpec {
    #[serde(flatten)]
    pub sink: SinkSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SinkSpec {
    /// Either `syslog` or `webhook`.
    #[serde(rename = "type")]
    pub type_: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,

    #[serde(default, rename = "enableTLS")]
    pub enable_tls: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// A secret holding credentials (e.g. a CA bundle) for the destination. Namespaced sinks may
    /// only reference secrets in their own namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_ref: Option<SecretKeySelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogSinkStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,

    /// One of `True`, `False`, or `Unknown`.
    pub status: String,

    pub reason: String,

    pub message: String,

    /// RFC 3339 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}
