#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod sink;

pub use self::sink::{
    ClusterLogSink, ClusterLogSinkSpec, Condition, LogSink, LogSinkSpec, LogSinkStatus,
    SecretKeySelector, SinkSpec,
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{ConfigMap, Secret},
    },
    ByteString,
};
pub use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, ResourceExt},
    Client, Error, Resource,
};

pub const API_GROUP: &str = "observability.knative.dev";
pub const API_VERSION: &str = "observability.knative.dev/v1alpha1";
