//! LogSink registry
//!
//! The registry mirrors the cluster's `LogSink` and `ClusterLogSink` resources. It is owned and
//! updated by the tasks that process watch events (via `kubert::index`) and read by reconcilers,
//! which take snapshots of it:
//!
//! ```text
//! [ LogSink ] ---------\
//!                       >--> [ Registry ] --snapshot--> [ Reconciler ]
//! [ ClusterLogSink ] --/         |
//!                                \--validation--> [ ReconciliationState ]
//! ```
//!
//! The registry holds declarations only. Routing rules and output descriptors are always derived
//! from a snapshot, never stored, so the compiled configuration is a pure function of the declared
//! sinks.
//!
//! Every mutation that changes the registry's contents bumps a generation counter published on a
//! `watch` channel. Reconcilers wait on that channel, so a burst of changes coalesces into a single
//! recompilation against the latest snapshot.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster_info;
mod conversion;
pub mod metrics;
mod registry;

#[cfg(test)]
mod tests;

pub use self::{
    cluster_info::ClusterInfo,
    conversion::{cluster_spec, namespaced_spec},
    registry::{Event, Registry, SharedRegistry},
};
