//! Renders routing rules and output descriptors into the agent's configuration document.
//!
//! Rendering is deterministic: outputs are keyed in a sorted map, rules keep the compiler's order,
//! and struct fields serialize in declaration order. Two renders of equal input are byte-identical
//! and therefore share a fingerprint.

use crate::{
    output::{OutputDescriptor, OutputId},
    routing::RoutingRule,
    tag::NamespaceTag,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{collections::BTreeMap, fmt, sync::Arc};

/// The document consumed by the log-shipping agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDocument {
    pub outputs: BTreeMap<OutputId, OutputDescriptor>,
    pub routes: Vec<RoutingRule>,
}

/// A content hash of a rendered document.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

/// A rendered routing document and its fingerprint.
#[derive(Clone, Debug)]
pub struct CompiledConfig {
    document: RoutingDocument,
    rendered: Arc<str>,
    fingerprint: Fingerprint,
}

pub fn render(
    rules: Vec<RoutingRule>,
    descriptors: impl IntoIterator<Item = OutputDescriptor>,
) -> Result<CompiledConfig, serde_json::Error> {
    let mut outputs = descriptors
        .into_iter()
        .map(|d| (d.id.clone(), d))
        .collect::<BTreeMap<_, _>>();

    // Rules for sinks without a descriptor (i.e. invalid sinks) are dropped, so an invalid sink
    // never widens or disturbs anyone else's routing.
    let routes = rules
        .into_iter()
        .filter(|rule| {
            let known = outputs.contains_key(&rule.output);
            if !known {
                tracing::debug!(output = %rule.output, "Dropping route without an output");
            }
            known
        })
        .collect::<Vec<_>>();
    outputs.retain(|id, _| routes.iter().any(|r| r.output == *id));

    CompiledConfig::from_document(RoutingDocument { outputs, routes })
}

// === impl RoutingDocument ===

impl RoutingDocument {
    /// Returns every output that receives a record with the given tag.
    ///
    /// Agents evaluate all matching routes, so a record is delivered once to each returned output.
    pub fn outputs_for<'a>(&'a self, tag: &'a NamespaceTag) -> impl Iterator<Item = &'a OutputId> + 'a {
        self.routes
            .iter()
            .filter(move |rule| rule.selects(tag))
            .map(|rule| &rule.output)
    }
}

// === impl CompiledConfig ===

impl CompiledConfig {
    pub fn from_document(document: RoutingDocument) -> Result<Self, serde_json::Error> {
        let rendered = serde_json::to_string_pretty(&document)?;
        let fingerprint = Fingerprint::of(rendered.as_bytes());
        Ok(Self {
            document,
            rendered: rendered.into(),
            fingerprint,
        })
    }

    /// Parses a previously rendered document.
    pub fn parse(rendered: &str) -> Result<Self, serde_json::Error> {
        Self::from_document(serde_json::from_str(rendered)?)
    }

    pub fn empty() -> Result<Self, serde_json::Error> {
        Self::from_document(RoutingDocument::default())
    }

    pub fn document(&self) -> &RoutingDocument {
        &self.document
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl PartialEq for CompiledConfig {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for CompiledConfig {}

// === impl Fingerprint ===

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}
