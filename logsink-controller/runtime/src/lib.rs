//! Drives the routing configuration of each target toward the state declared by LogSink resources.
//!
//! One [`Reconciler`] runs per target. It compiles a snapshot of the registry, diffs the result
//! against the configuration last confirmed on the target, and applies the difference through an
//! [`Agent`]. Removals are always applied before additions.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use logsink_controller_core as core;
pub use logsink_controller_k8s_api as k8s;
pub use logsink_controller_k8s_index as index;
pub use logsink_controller_k8s_status as status;

mod agent;
mod args;
mod lease;
mod reconcile;
mod secrets;
mod target;

pub use self::{
    agent::{Agent, ApplyError, ConfigMapAgent, CONFIG_KEY, FINGERPRINT_ANNOTATION},
    args::Args,
    reconcile::{Leadership, ReconcileMetrics, Reconciler, ResyncHandle},
    secrets::{KubeSecrets, SecretError, SecretSource},
    target::{InvalidTarget, Target},
};
