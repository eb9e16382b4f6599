//! Orders configuration changes so that routing is never wider than it should be.
//!
//! Moving a target from its current configuration to a desired one may both remove access (a sink
//! is deleted, a destination changes, an exclusion is added) and grant access (a sink is added).
//! Agents pick up whole documents, so when a change removes anything we first apply the
//! intersection of the current and desired routing and only then apply the desired document. No
//! intermediate document ever routes a record somewhere the current document would not.

use crate::{
    config::{CompiledConfig, RoutingDocument},
    output::OutputId,
    routing::{RoutingRule, Selector},
};
use std::collections::{BTreeMap, BTreeSet};

/// Returns the documents to apply, in order, to move a target from `current` to `desired`.
///
/// The result is empty when the target is already up to date.
pub fn plan(
    current: Option<&CompiledConfig>,
    desired: &CompiledConfig,
) -> Result<Vec<CompiledConfig>, serde_json::Error> {
    let Some(current) = current else {
        return Ok(vec![desired.clone()]);
    };
    if current.fingerprint() == desired.fingerprint() {
        return Ok(vec![]);
    }

    let narrowed = narrow(current.document(), desired.document());
    let mut stages = Vec::with_capacity(2);
    if narrowed != *current.document() && narrowed != *desired.document() {
        stages.push(CompiledConfig::from_document(narrowed)?);
    }
    stages.push(desired.clone());
    Ok(stages)
}

/// Lists outputs whose routing differs between two documents.
pub fn affected(current: Option<&RoutingDocument>, desired: &RoutingDocument) -> BTreeSet<OutputId> {
    let empty = RoutingDocument::default();
    let current = current.unwrap_or(&empty);
    let current_rules = rules_by_key(current);
    let desired_rules = rules_by_key(desired);

    current_rules
        .keys()
        .chain(desired_rules.keys())
        .filter(|key| {
            let (_, output) = key;
            current_rules.get(*key) != desired_rules.get(*key)
                || current.outputs.get(*output) != desired.outputs.get(*output)
        })
        .map(|(_, output)| (*output).clone())
        .collect()
}

/// Computes a document that routes a record to an output only if both documents do.
fn narrow(current: &RoutingDocument, desired: &RoutingDocument) -> RoutingDocument {
    let desired_rules = rules_by_key(desired);

    let routes = current
        .routes
        .iter()
        .filter_map(|rule| {
            let next = desired_rules.get(&(&rule.selector, &rule.output))?;
            let before = current.outputs.get(&rule.output)?;
            let after = desired.outputs.get(&rule.output)?;
            if before != after {
                return None;
            }
            let mut rule = rule.clone();
            rule.exclude.extend(next.exclude.iter().cloned());
            Some(rule)
        })
        .collect::<Vec<_>>();

    let outputs = current
        .outputs
        .iter()
        .filter(|(id, _)| routes.iter().any(|r| r.output == **id))
        .map(|(id, out)| (id.clone(), out.clone()))
        .collect();

    RoutingDocument { outputs, routes }
}

fn rules_by_key(doc: &RoutingDocument) -> BTreeMap<(&Selector, &OutputId), &RoutingRule> {
    doc.routes
        .iter()
        .map(|rule| ((&rule.selector, &rule.output), rule))
        .collect()
}
