//! Compiles declared sinks into routing rules.
//!
//! Namespace-scoped sinks produce exactly one rule that selects their own namespace's tag and
//! explicitly excludes every other known namespace's tag. Cluster-scoped sinks produce a single
//! wildcard rule; these are the only rules that may select more than one namespace.
//!
//! Namespace-scoped rules are ordered before cluster-scoped rules. The order is otherwise stable
//! (by tag, then output) so that identical snapshots always compile to identical rule lists.

use crate::{
    output::OutputId,
    sink::{RegistrySnapshot, Scope},
    tag::NamespaceTag,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;

const WILDCARD: &str = "*";

/// Selects the records a rule applies to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Selector {
    Namespace(NamespaceTag),

    /// Every namespace, including namespaces that do not exist yet.
    All,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(rename = "match")]
    pub selector: Selector,
    pub output: OutputId,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub exclude: BTreeSet<NamespaceTag>,
}

pub fn compile(snapshot: &RegistrySnapshot) -> Vec<RoutingRule> {
    let (cluster, namespaced): (Vec<_>, Vec<_>) = snapshot
        .iter()
        .partition(|spec| spec.scope() == Scope::Cluster);

    let known = snapshot
        .namespaces()
        .into_iter()
        .map(NamespaceTag::for_namespace)
        .collect::<BTreeSet<_>>();

    let mut rules = namespaced
        .into_iter()
        .filter_map(|spec| {
            let tag = NamespaceTag::for_namespace(spec.id.namespace()?);
            let exclude = known.iter().filter(|t| **t != tag).cloned().collect();
            Some(RoutingRule {
                selector: Selector::Namespace(tag),
                output: OutputId::from(&spec.id),
                exclude,
            })
        })
        .collect::<Vec<_>>();
    rules.sort_by(|a, b| (&a.selector, &a.output).cmp(&(&b.selector, &b.output)));

    let mut cluster_rules = cluster
        .into_iter()
        .map(|spec| RoutingRule {
            selector: Selector::All,
            output: OutputId::from(&spec.id),
            exclude: BTreeSet::new(),
        })
        .collect::<Vec<_>>();
    cluster_rules.sort_by(|a, b| a.output.cmp(&b.output));

    rules.extend(cluster_rules);
    rules
}

// === impl RoutingRule ===

impl RoutingRule {
    /// Indicates whether a record with the given tag is routed by this rule.
    pub fn selects(&self, tag: &NamespaceTag) -> bool {
        if self.exclude.contains(tag) {
            return false;
        }
        match &self.selector {
            Selector::All => true,
            Selector::Namespace(t) => t == tag,
        }
    }

    pub fn is_cluster_wide(&self) -> bool {
        matches!(self.selector, Selector::All)
    }
}

// === impl Selector ===

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str(WILDCARD),
            Self::Namespace(tag) => serializer.serialize_str(tag.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == WILDCARD {
            return Ok(Self::All);
        }
        if s.is_empty() {
            return Err(de::Error::custom("empty match selector"));
        }
        Ok(Self::Namespace(NamespaceTag::from_raw(s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{LogSinkSpec, SinkId, SinkKind, SyslogParams};

    fn sink(id: SinkId) -> LogSinkSpec {
        LogSinkSpec {
            id,
            kind: SinkKind::Syslog(SyslogParams {
                host: Some("receiver".to_string()),
                port: Some(24903),
                enable_tls: true,
            }),
            insecure_skip_verify: true,
            credentials: None,
        }
    }

    fn snapshot(ids: impl IntoIterator<Item = SinkId>) -> RegistrySnapshot {
        RegistrySnapshot::from_specs(ids.into_iter().map(sink)).unwrap()
    }

    fn tag(ns: &str) -> NamespaceTag {
        NamespaceTag::for_namespace(ns)
    }

    #[test]
    fn namespaced_sink_selects_only_its_namespace() {
        let rules = compile(&snapshot([
            SinkId::namespaced("ns-a", "sink"),
            SinkId::namespaced("ns-b", "sink"),
        ]));
        assert_eq!(rules.len(), 2);

        let a = &rules[0];
        assert_eq!(a.selector, Selector::Namespace(tag("ns-a")));
        assert_eq!(a.output.as_str(), "namespace/ns-a/sink");
        assert_eq!(a.exclude, [tag("ns-b")].into_iter().collect());
        assert!(a.selects(&tag("ns-a")));
        assert!(!a.selects(&tag("ns-b")));
        assert!(!a.selects(&tag("ns-c")));

        let b = &rules[1];
        assert_eq!(b.selector, Selector::Namespace(tag("ns-b")));
        assert_eq!(b.exclude, [tag("ns-a")].into_iter().collect());
    }

    #[test]
    fn cluster_sinks_fan_out_after_namespaced_rules() {
        let rules = compile(&snapshot([
            SinkId::cluster("all"),
            SinkId::namespaced("ns-a", "sink"),
        ]));
        assert_eq!(rules.len(), 2);
        assert!(!rules[0].is_cluster_wide());
        assert!(rules[1].is_cluster_wide());
        assert!(rules[1].exclude.is_empty());
        for ns in ["ns-a", "ns-b", "not-created-yet"] {
            assert!(rules[1].selects(&tag(ns)));
        }
    }

    #[test]
    fn fan_out_within_a_namespace_is_allowed() {
        let rules = compile(&snapshot([
            SinkId::namespaced("ns-a", "one"),
            SinkId::namespaced("ns-a", "two"),
        ]));
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.selects(&tag("ns-a"))));
        assert!(rules.iter().all(|r| r.exclude.is_empty()));
    }

    #[test]
    fn namespace_without_sinks_has_no_rules() {
        let rules = compile(&snapshot([SinkId::namespaced("ns-a", "sink")]));
        assert!(!rules.iter().any(|r| r.selects(&tag("ns-b"))));
        assert!(compile(&RegistrySnapshot::default()).is_empty());
    }

    /// No rule produced by a namespace-scoped sink ever selects two namespaces.
    #[test]
    fn no_namespaced_rule_selects_another_namespace() {
        let namespaces = ["ns-a", "ns-b", "ns-c", "kube-system"];
        let rules = compile(&snapshot(
            namespaces
                .iter()
                .flat_map(|ns| [SinkId::namespaced(*ns, "x"), SinkId::namespaced(*ns, "y")])
                .chain([SinkId::cluster("all")]),
        ));
        for rule in rules.iter().filter(|r| !r.is_cluster_wide()) {
            let selected = namespaces
                .iter()
                .filter(|ns| rule.selects(&tag(ns)))
                .count();
            assert_eq!(selected, 1, "{rule:?}");
        }
    }

    #[test]
    fn compilation_is_stable() {
        let ids = [
            SinkId::namespaced("ns-b", "sink"),
            SinkId::cluster("z"),
            SinkId::namespaced("ns-a", "sink"),
            SinkId::cluster("a"),
        ];
        let mut reversed = ids.clone();
        reversed.reverse();
        assert_eq!(compile(&snapshot(ids)), compile(&snapshot(reversed)));
    }

    #[test]
    fn selector_wire_format() {
        assert_eq!(serde_json::to_string(&Selector::All).unwrap(), "\"*\"");
        assert_eq!(
            serde_json::to_string(&Selector::Namespace(tag("ns-a"))).unwrap(),
            "\"ns.ns-a\""
        );
        let selector: Selector = serde_json::from_str("\"ns.ns-a\"").unwrap();
        assert_eq!(selector, Selector::Namespace(tag("ns-a")));
        assert!(serde_json::from_str::<Selector>("\"\"").is_err());
    }
}
