use crate::{
    config::{self, CompiledConfig},
    output::{self, OutputDescriptor, OutputId, ValidationError},
    routing,
    sink::{ConsistencyError, RegistrySnapshot, SecretKeyRef, SinkId},
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// The outcome of compiling a registry snapshot.
#[derive(Clone, Debug)]
pub struct Compilation {
    pub config: CompiledConfig,
    pub sinks: BTreeMap<SinkId, Admission>,
}

/// Describes whether a sink made it into a compiled configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted(OutputId),
    Invalid(ValidationError),

    /// The sink is valid but its credentials could not be resolved.
    Unresolved(String),
}

/// Credentials material resolved ahead of compilation, keyed by reference.
///
/// Only a digest of each secret is retained.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedCredentials(BTreeMap<SecretKeyRef, Result<String, String>>);

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error("failed to encode routing document: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Compiles a snapshot into a routing configuration.
///
/// Sinks that fail validation or whose credentials are unavailable are left out of the
/// configuration; they never prevent other sinks from being compiled.
pub fn compile(
    snapshot: &RegistrySnapshot,
    credentials: &ResolvedCredentials,
) -> Result<Compilation, CompileError> {
    snapshot.check()?;

    let rules = routing::compile(snapshot);
    let mut sinks = BTreeMap::new();
    let mut descriptors = Vec::with_capacity(snapshot.len());
    for spec in snapshot.iter() {
        let admission = match output::build(spec) {
            Err(error) => Admission::Invalid(error),
            Ok(mut descriptor) => match credentials.attach(&mut descriptor) {
                Err(reason) => Admission::Unresolved(reason),
                Ok(()) => {
                    let id = descriptor.id.clone();
                    descriptors.push(descriptor);
                    Admission::Admitted(id)
                }
            },
        };
        sinks.insert(spec.id.clone(), admission);
    }

    let config = config::render(rules, descriptors)?;
    Ok(Compilation { config, sinks })
}

// === impl ResolvedCredentials ===

impl ResolvedCredentials {
    pub fn insert_material(&mut self, secret: SecretKeyRef, material: &[u8]) {
        let digest = hex::encode(Sha256::digest(material));
        self.0.insert(secret, Ok(digest));
    }

    pub fn insert_error(&mut self, secret: SecretKeyRef, reason: impl ToString) {
        self.0.insert(secret, Err(reason.to_string()));
    }

    fn attach(&self, descriptor: &mut OutputDescriptor) -> Result<(), String> {
        let Some(credentials) = descriptor.credentials.as_mut() else {
            return Ok(());
        };
        match self.0.get(&credentials.secret) {
            Some(Ok(digest)) => {
                credentials.digest = Some(digest.clone());
                Ok(())
            }
            Some(Err(reason)) => Err(format!(
                "credentials {} are unavailable: {reason}",
                credentials.secret
            )),
            None => Err(format!(
                "credentials {} have not been resolved",
                credentials.secret
            )),
        }
    }
}
