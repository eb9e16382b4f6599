//! Builds concrete output descriptors from declared sinks.
//!
//! Every field the transport requires is resolved here; a sink that cannot be fully resolved is
//! rejected with a [`ValidationError`] and never produces a descriptor.

use crate::sink::{LogSinkSpec, SecretKeyRef, SinkId, SinkKind, SyslogParams, WebhookParams};
use serde::{Deserialize, Serialize};
use std::{fmt, num::NonZeroU16};
use thiserror::Error;

/// Names an output in the compiled configuration. Derived from the owning sink's identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputId(String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub id: OutputId,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Protocol {
    Syslog {
        host: String,
        port: NonZeroU16,
        tls: TlsMode,
    },
    Webhook {
        url: String,
        tls: TlsMode,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TlsMode {
    Disabled,
    Verify,
    SkipVerify,
}

/// Credentials the agent must mount to reach an output.
///
/// The digest of the secret material is filled in once the reference is resolved so that a
/// rotated secret changes the compiled configuration's fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub secret: SecretKeyRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is out of range: {value}")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported sink type {0:?}")]
    UnsupportedType(String),
}

pub fn build(spec: &LogSinkSpec) -> Result<OutputDescriptor, ValidationError> {
    let protocol = match &spec.kind {
        SinkKind::Syslog(syslog) => build_syslog(syslog, spec.insecure_skip_verify)?,
        SinkKind::Webhook(webhook) => build_webhook(webhook, spec.insecure_skip_verify)?,
        SinkKind::Unsupported(kind) => return Err(ValidationError::UnsupportedType(kind.clone())),
    };

    Ok(OutputDescriptor {
        id: OutputId::from(&spec.id),
        protocol,
        credentials: spec.credentials.clone().map(|secret| Credentials {
            secret,
            digest: None,
        }),
    })
}

fn build_syslog(params: &SyslogParams, insecure_skip_verify: bool) -> Result<Protocol, ValidationError> {
    let host = params
        .host
        .as_deref()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(ValidationError::MissingField("host"))?;

    let port = params.port.ok_or(ValidationError::MissingField("port"))?;
    let port = u16::try_from(port)
        .ok()
        .and_then(NonZeroU16::new)
        .ok_or(ValidationError::OutOfRange {
            field: "port",
            value: port,
        })?;

    let tls = match (params.enable_tls, insecure_skip_verify) {
        (false, _) => TlsMode::Disabled,
        (true, false) => TlsMode::Verify,
        (true, true) => TlsMode::SkipVerify,
    };

    Ok(Protocol::Syslog {
        host: host.to_string(),
        port,
        tls,
    })
}

fn build_webhook(params: &WebhookParams, insecure_skip_verify: bool) -> Result<Protocol, ValidationError> {
    let url = params
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or(ValidationError::MissingField("url"))?;

    let invalid = |reason: &str| ValidationError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let uri = url
        .parse::<http::Uri>()
        .map_err(|error| invalid(&error.to_string()))?;

    let tls = match uri.scheme_str() {
        Some("https") if insecure_skip_verify => TlsMode::SkipVerify,
        Some("https") => TlsMode::Verify,
        Some("http") if insecure_skip_verify => TlsMode::Disabled,
        Some("http") => {
            return Err(invalid(
                "scheme must be https unless insecureSkipVerify is set",
            ))
        }
        Some(_) => return Err(invalid("scheme must be http or https")),
        None => return Err(invalid("missing scheme")),
    };

    if uri.host().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }

    Ok(Protocol::Webhook {
        url: url.to_string(),
        tls,
    })
}

// === impl OutputId ===

impl OutputId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&SinkId> for OutputId {
    fn from(id: &SinkId) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for OutputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
