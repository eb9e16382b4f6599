//! LogSink routing core
//!
//! Everything in this crate is pure: it turns a point-in-time snapshot of declared sinks into a
//! deterministic routing document for the log-shipping agent. Nothing here performs I/O.
//!
//! ```text
//! [ RegistrySnapshot ] -> [ output::build ] -> [ OutputDescriptor ] -\
//!                      \-> [ routing::compile ] -> [ RoutingRule ] ---> [ config::render ] -> [ CompiledConfig ]
//! ```
//!
//! The routing compiler enforces tenant isolation: a rule created by a namespace-scoped sink only
//! ever selects its own namespace's tag. Only cluster-scoped sinks fan out across namespaces.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod compile;
pub mod config;
pub mod output;
pub mod plan;
pub mod routing;
pub mod sink;
mod status;
mod tag;

pub use self::{
    compile::{compile, Admission, Compilation, CompileError, ResolvedCredentials},
    config::{CompiledConfig, Fingerprint, RoutingDocument},
    output::{OutputDescriptor, OutputId, Protocol, TlsMode, ValidationError},
    routing::{RoutingRule, Selector},
    sink::{ConsistencyError, LogSinkSpec, RegistrySnapshot, Scope, SecretKeyRef, SinkId, SinkKind},
    status::SinkStatus,
    tag::NamespaceTag,
};

pub const CONTROLLER_NAME: &str = "observability.knative.dev/logsink-controller";
