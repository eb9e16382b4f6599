use logsink_controller_core::{
    sink::{SyslogParams, WebhookParams},
    LogSinkSpec, SecretKeyRef, SinkId, SinkKind,
};
use logsink_controller_k8s_api::{self as k8s, ResourceExt};

/// Converts a `LogSink` resource into its declared intent.
///
/// Credentials are always resolved in the sink's own namespace. Returns `None` if the resource has
/// no namespace.
pub fn namespaced_spec(sink: &k8s::LogSink) -> Option<LogSinkSpec> {
    let namespace = sink.namespace()?;
    let id = SinkId::namespaced(namespace.clone(), sink.name_unchecked());
    Some(convert(id, &sink.spec.sink, &namespace))
}

/// Converts a `ClusterLogSink` resource into its declared intent, resolving credentials in
/// `secrets_ns`.
pub fn cluster_spec(sink: &k8s::ClusterLogSink, secrets_ns: &str) -> LogSinkSpec {
    let id = SinkId::cluster(sink.name_unchecked());
    convert(id, &sink.spec.sink, secrets_ns)
}

fn convert(id: SinkId, spec: &k8s::SinkSpec, secrets_ns: &str) -> LogSinkSpec {
    let kind = match spec.type_.to_ascii_lowercase().as_str() {
        "syslog" => SinkKind::Syslog(SyslogParams {
            host: spec.host.clone(),
            port: spec.port,
            enable_tls: spec.enable_tls,
        }),
        "webhook" => SinkKind::Webhook(WebhookParams {
            url: spec.url.clone(),
        }),
        _ => SinkKind::Unsupported(spec.type_.clone()),
    };

    let credentials = spec
        .credentials_secret_ref
        .as_ref()
        .map(|selector| SecretKeyRef {
            namespace: secrets_ns.to_string(),
            name: selector.name.clone(),
            key: selector.key.clone(),
        });

    LogSinkSpec {
        id,
        kind,
        insecure_skip_verify: spec.insecure_skip_verify,
        credentials,
    }
}
