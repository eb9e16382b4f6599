use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};
use thiserror::Error;

/// Identifies a declared sink.
///
/// Namespace-scoped sinks are unique by namespace and name; cluster-scoped sinks are unique by
/// name. The two classes never collide.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SinkId {
    Namespaced { namespace: String, name: String },
    Cluster { name: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Namespace,
    Cluster,
}

/// The declared intent of a `LogSink` or `ClusterLogSink`, as mirrored from the API server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSinkSpec {
    pub id: SinkId,
    pub kind: SinkKind,
    pub insecure_skip_verify: bool,
    pub credentials: Option<SecretKeyRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkKind {
    Syslog(SyslogParams),
    Webhook(WebhookParams),

    /// A sink type that this controller cannot route to. Holds the declared type name.
    Unsupported(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyslogParams {
    pub host: Option<String>,
    pub port: Option<i64>,
    pub enable_tls: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WebhookParams {
    pub url: Option<String>,
}

/// References a key in a `Secret`. The namespace is always resolved by the time a spec reaches the
/// registry, so a namespace-scoped sink can only ever refer to its own namespace's secrets.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

/// An immutable, point-in-time copy of every declared sink, ordered by identity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    sinks: Arc<BTreeMap<SinkId, LogSinkSpec>>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("duplicate sink identity {0}")]
    DuplicateIdentity(SinkId),

    #[error("sink indexed as {key} declares identity {declared}")]
    IdentityMismatch { key: SinkId, declared: SinkId },
}

// === impl SinkId ===

impl SinkId {
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Namespaced {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self::Cluster { name: name.into() }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Self::Namespaced { .. } => Scope::Namespace,
            Self::Cluster { .. } => Scope::Cluster,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Namespaced { namespace, .. } => Some(namespace),
            Self::Cluster { .. } => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Namespaced { name, .. } | Self::Cluster { name } => name,
        }
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespaced { namespace, name } => write!(f, "namespace/{namespace}/{name}"),
            Self::Cluster { name } => write!(f, "cluster/{name}"),
        }
    }
}

// === impl LogSinkSpec ===

impl LogSinkSpec {
    pub fn scope(&self) -> Scope {
        self.id.scope()
    }
}

// === impl SecretKeyRef ===

impl fmt::Display for SecretKeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[{}]", self.namespace, self.name, self.key)
    }
}

// === impl RegistrySnapshot ===

impl RegistrySnapshot {
    pub fn new(sinks: Arc<BTreeMap<SinkId, LogSinkSpec>>) -> Self {
        Self { sinks }
    }

    /// Assembles a snapshot from a list of specs, rejecting duplicate identities.
    pub fn from_specs(specs: impl IntoIterator<Item = LogSinkSpec>) -> Result<Self, ConsistencyError> {
        let mut sinks = BTreeMap::new();
        for spec in specs {
            let id = spec.id.clone();
            if sinks.insert(id.clone(), spec).is_some() {
                return Err(ConsistencyError::DuplicateIdentity(id));
            }
        }
        Ok(Self::new(Arc::new(sinks)))
    }

    /// Ensures that every entry is indexed under its own identity.
    pub fn check(&self) -> Result<(), ConsistencyError> {
        for (key, spec) in self.sinks.iter() {
            if *key != spec.id {
                return Err(ConsistencyError::IdentityMismatch {
                    key: key.clone(),
                    declared: spec.id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &SinkId) -> Option<&LogSinkSpec> {
        self.sinks.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogSinkSpec> {
        self.sinks.values()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Lists the namespaces that have at least one namespace-scoped sink.
    pub fn namespaces(&self) -> BTreeSet<&str> {
        self.sinks.keys().filter_map(SinkId::namespace).collect()
    }

    /// Lists every secret referenced by a declared sink.
    pub fn credentials(&self) -> BTreeSet<&SecretKeyRef> {
        self.sinks
            .values()
            .filter_map(|spec| spec.credentials.as_ref())
            .collect()
    }
}
