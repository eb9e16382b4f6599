use std::{fmt, str::FromStr};

/// Names the ConfigMap from which a log-shipping agent loads its routing configuration.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid target {0:?}: expected <namespace>/<name>")]
pub struct InvalidTarget(String);

// === impl Target ===

impl Target {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl FromStr for Target {
    type Err = InvalidTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(InvalidTarget(s.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let target = "knative-observability/fluent-bit".parse::<Target>().unwrap();
        assert_eq!(target, Target::new("knative-observability", "fluent-bit"));
        assert_eq!(target.to_string(), "knative-observability/fluent-bit");

        for invalid in ["", "fluent-bit", "/fluent-bit", "ns/", "a/b/c"] {
            assert!(invalid.parse::<Target>().is_err(), "{invalid:?}");
        }
    }
}
