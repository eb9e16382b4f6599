use serde::{Deserialize, Serialize};
use std::fmt;

const PREFIX: &str = "ns.";

/// The routing label attached to logs and events that originate in a namespace.
///
/// Tags are derived from the namespace name alone, so every process computes the same tag for a
/// namespace without coordinating. Distinct namespaces always produce distinct tags.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamespaceTag(String);

// === impl NamespaceTag ===

impl NamespaceTag {
    pub fn for_namespace(namespace: &str) -> Self {
        Self(format!("{PREFIX}{namespace}"))
    }

    /// Returns the namespace this tag was derived from.
    pub fn namespace(&self) -> &str {
        self.0.strip_prefix(PREFIX).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_raw(tag: String) -> Self {
        Self(tag)
    }
}

impl fmt::Display for NamespaceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
