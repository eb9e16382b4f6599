use crate::{
    agent::{Agent, ApplyError},
    core::{
        self, plan, Admission, Compilation, CompiledConfig, OutputId, RegistrySnapshot,
        ResolvedCredentials, RoutingDocument, SinkStatus,
    },
    index::SharedRegistry,
    secrets::SecretSource,
    status::{Phase, SharedState},
    target::Target,
};
use kubert::lease::Claim;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::{
    sync::watch,
    time::{self, Duration, Instant, MissedTickBehavior},
};

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Reconciles a single target.
pub struct Reconciler<A, S> {
    target: Target,
    name: String,
    registry: SharedRegistry,
    state: SharedState,
    agent: A,
    secrets: S,
    leadership: Leadership,
    metrics: ReconcileMetrics,

    leading: bool,
    current: Current,
    backoff: Backoff,
}

/// Determines whether this replica may write configuration.
#[derive(Clone, Debug)]
pub struct Leadership {
    claims: watch::Receiver<Arc<Claim>>,
    name: String,
}

/// Forces every reconciler to recompile and reapply, even if nothing has changed.
#[derive(Clone, Debug)]
pub struct ResyncHandle(Arc<watch::Sender<u64>>);

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    reconciles: Family<TriggerLabels, Counter>,
    noops: Family<TargetLabels, Counter>,
    applies: Family<TargetLabels, Counter>,
    apply_failures: Family<FailureLabels, Counter>,
    compile_failures: Family<TargetLabels, Counter>,
    excluded_sinks: Family<TargetLabels, Gauge>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TargetLabels {
    target: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct TriggerLabels {
    target: String,
    trigger: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct FailureLabels {
    target: String,
    error: &'static str,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trigger {
    Startup,
    Changed,
    Resync,
    Periodic,
    Retry,
}

/// What is known about the configuration held by the target.
#[derive(Clone, Debug)]
enum Current {
    /// The target has not been read yet, or holds a document that could not be parsed.
    Unknown,
    Absent,
    Applied(CompiledConfig),
}

#[derive(Clone, Debug, Default)]
struct Backoff {
    failures: u32,
}

// === impl Reconciler ===

impl<A: Agent, S: SecretSource> Reconciler<A, S> {
    pub fn new(
        target: Target,
        registry: SharedRegistry,
        state: SharedState,
        agent: A,
        secrets: S,
        leadership: Leadership,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            name: target.to_string(),
            target,
            registry,
            state,
            agent,
            secrets,
            leadership,
            metrics,
            leading: false,
            current: Current::Unknown,
            backoff: Backoff::default(),
        }
    }

    /// Reconciles the target whenever the registry changes, a resync is requested, the resync
    /// interval elapses, or a failed attempt is due to be retried. Changes that arrive while a pass
    /// is in progress are coalesced into the next pass.
    ///
    /// Returns when the registry is dropped.
    pub async fn run(
        mut self,
        mut changes: watch::Receiver<u64>,
        mut resyncs: watch::Receiver<u64>,
        resync_interval: Duration,
    ) {
        let _ = changes.borrow_and_update();
        let _ = resyncs.borrow_and_update();
        let mut resyncs_open = true;

        let mut periodic = time::interval_at(Instant::now() + resync_interval, resync_interval);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut trigger = Trigger::Startup;
        loop {
            let ok = self.reconcile(trigger).await;

            let retry = time::sleep(self.backoff.delay());
            tokio::pin!(retry);
            if !ok {
                tracing::info!(delay = ?self.backoff.delay(), "Retrying");
            }

            trigger = loop {
                tokio::select! {
                    res = changes.changed() => match res {
                        Ok(()) => break Trigger::Changed,
                        Err(_) => {
                            tracing::debug!("Registry dropped");
                            return;
                        }
                    },
                    res = resyncs.changed(), if resyncs_open => match res {
                        Ok(()) => break Trigger::Resync,
                        Err(_) => resyncs_open = false,
                    },
                    _ = periodic.tick() => break Trigger::Periodic,
                    _ = &mut retry, if !ok => break Trigger::Retry,
                }
            };
        }
    }

    /// Runs a single reconciliation pass, returning false if it must be retried.
    async fn reconcile(&mut self, trigger: Trigger) -> bool {
        self.metrics.reconciles(&self.name, trigger).inc();

        if !self.leadership.is_leader() {
            tracing::debug!("Not the lease holder; skipping reconciliation");
            self.leading = false;
            return true;
        }
        if !self.leading {
            // Another replica may have written the target while this one was following.
            if let Err(error) = self.load_current().await {
                tracing::warn!(%error, "Failed to read routing configuration");
                self.metrics.apply_failures(&self.name, &error).inc();
                self.fail(&error);
                return false;
            }
            self.leading = true;
        }

        tracing::debug!(?trigger, "Reconciling");
        self.set_phase(Phase::Compiling);
        let snapshot = self.registry.read().snapshot();
        let credentials = self.resolve_credentials(&snapshot).await;
        let compilation = match core::compile(&snapshot, &credentials) {
            Ok(compilation) => compilation,
            Err(error) => {
                tracing::error!(%error, "Failed to compile routing configuration");
                self.metrics.compile_failures(&self.name).inc();
                self.fail(&error);
                return false;
            }
        };

        self.set_phase(Phase::Diffing);
        let desired = &compilation.config;
        let stages = match self.plan(desired) {
            Ok(stages) => stages,
            Err(error) => {
                tracing::error!(%error, "Failed to plan routing configuration");
                self.metrics.compile_failures(&self.name).inc();
                self.fail(&error);
                return false;
            }
        };
        if stages.is_empty() {
            tracing::debug!(fingerprint = %desired.fingerprint(), "Target is up to date");
            self.metrics.noops(&self.name).inc();
            self.complete(&snapshot, &compilation);
            return true;
        }

        self.set_phase(Phase::Applying);
        let affected = plan::affected(self.current.document(), desired.document());
        for stage in stages {
            tracing::info!(
                fingerprint = %stage.fingerprint(),
                outputs = stage.document().outputs.len(),
                routes = stage.document().routes.len(),
                "Applying routing configuration",
            );
            if let Err(error) = self.agent.apply(&self.target, &stage).await {
                tracing::warn!(%error, "Failed to apply routing configuration");
                self.metrics.apply_failures(&self.name, &error).inc();
                self.fail(&error);
                // The target keeps serving the last configuration it accepted. Sinks whose
                // routing differs from it are pending until a retry succeeds.
                self.report(&snapshot, &compilation, Some((&affected, &error)));
                return false;
            }
            self.metrics.applies(&self.name).inc();
            self.state.write().applied(&self.name, stage.fingerprint());
            self.current = Current::Applied(stage);
        }

        self.complete(&snapshot, &compilation);
        true
    }

    /// Reads the configuration held by the target. A stored document that cannot be parsed is
    /// cleared before anything is applied; any other error leaves the target untouched.
    async fn load_current(&mut self) -> Result<(), ApplyError> {
        self.current = match self.agent.current(&self.target).await {
            Ok(Some(config)) => {
                tracing::info!(fingerprint = %config.fingerprint(), "Loaded routing configuration");
                self.state.write().applied(&self.name, config.fingerprint());
                Current::Applied(config)
            }
            Ok(None) => Current::Absent,
            Err(error @ ApplyError::Rejected(_)) => {
                tracing::warn!(
                    %error,
                    "Stored routing configuration is unreadable; it will be cleared"
                );
                Current::Unknown
            }
            Err(error) => return Err(error),
        };
        Ok(())
    }

    async fn resolve_credentials(&self, snapshot: &RegistrySnapshot) -> ResolvedCredentials {
        let mut resolved = ResolvedCredentials::default();
        for secret in snapshot.credentials() {
            match self.secrets.lookup(secret).await {
                Ok(material) => resolved.insert_material(secret.clone(), &material),
                Err(error) => {
                    tracing::info!(%secret, %error, "Failed to resolve credentials");
                    resolved.insert_error(secret.clone(), error);
                }
            }
        }
        resolved
    }

    fn plan(&self, desired: &CompiledConfig) -> Result<Vec<CompiledConfig>, serde_json::Error> {
        match &self.current {
            Current::Applied(current) => plan::plan(Some(current), desired),
            Current::Absent => plan::plan(None, desired),
            Current::Unknown => {
                // Whatever the target holds is removed before anything is granted.
                let empty = CompiledConfig::empty()?;
                if empty == *desired {
                    return Ok(vec![empty]);
                }
                Ok(vec![empty, desired.clone()])
            }
        }
    }

    fn complete(&mut self, snapshot: &RegistrySnapshot, compilation: &Compilation) {
        self.backoff.reset();
        self.state.write().completed(&self.name);
        self.report(snapshot, compilation, None);
    }

    fn fail(&mut self, error: &dyn std::fmt::Display) {
        self.backoff.failed();
        self.state.write().failed(&self.name, error);
    }

    fn set_phase(&self, phase: Phase) {
        self.state.write().set_phase(&self.name, phase);
    }

    fn report(
        &self,
        snapshot: &RegistrySnapshot,
        compilation: &Compilation,
        failure: Option<(&BTreeSet<OutputId>, &ApplyError)>,
    ) {
        let statuses = compilation
            .sinks
            .iter()
            .map(|(id, admission)| {
                let status = match admission {
                    Admission::Invalid(error) => SinkStatus::Invalid(error.to_string()),
                    Admission::Unresolved(reason) => SinkStatus::Pending(reason.clone()),
                    Admission::Admitted(output) => match failure {
                        Some((affected, error)) if affected.contains(output) => {
                            SinkStatus::Pending(format!(
                                "Failed to apply configuration to {}: {error}",
                                self.target
                            ))
                        }
                        _ => SinkStatus::Ready,
                    },
                };
                (id.clone(), status)
            })
            .collect::<BTreeMap<_, _>>();

        let excluded = statuses.values().filter(|s| !s.is_ready()).count();
        self.metrics
            .excluded_sinks(&self.name)
            .set(excluded as i64);
        self.state.write().report(&self.name, snapshot, statuses);
    }
}

// === impl Current ===

impl Current {
    fn document(&self) -> Option<&RoutingDocument> {
        match self {
            Self::Applied(config) => Some(config.document()),
            Self::Unknown | Self::Absent => None,
        }
    }
}

// === impl Backoff ===

impl Backoff {
    fn failed(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    fn reset(&mut self) {
        self.failures = 0;
    }

    /// Doubles with each consecutive failure, starting at one second and capped at five minutes.
    fn delay(&self) -> Duration {
        let exp = self.failures.saturating_sub(1).min(16);
        MIN_BACKOFF.saturating_mul(1 << exp).min(MAX_BACKOFF)
    }
}

// === impl Leadership ===

impl Leadership {
    pub fn new(claims: watch::Receiver<Arc<Claim>>, name: impl ToString) -> Self {
        Self {
            claims,
            name: name.to_string(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.name)
    }
}

// === impl ResyncHandle ===

impl Default for ResyncHandle {
    fn default() -> Self {
        let (tx, _) = watch::channel(0);
        Self(Arc::new(tx))
    }
}

impl ResyncHandle {
    pub fn resync(&self) {
        self.0.send_modify(|n| *n += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.0.subscribe()
    }
}

// === impl Trigger ===

impl Trigger {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Changed => "changed",
            Self::Resync => "resync",
            Self::Periodic => "periodic",
            Self::Retry => "retry",
        }
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of reconciliation passes by trigger",
            reconciles.clone(),
        );

        let noops = Family::default();
        prom.register(
            "noops",
            "Count of reconciliation passes that found the target up to date",
            noops.clone(),
        );

        let applies = Family::default();
        prom.register(
            "applies",
            "Count of configurations applied to a target",
            applies.clone(),
        );

        let apply_failures = Family::default();
        prom.register(
            "apply_failures",
            "Count of failed attempts to apply a configuration",
            apply_failures.clone(),
        );

        let compile_failures = Family::default();
        prom.register(
            "compile_failures",
            "Count of failed attempts to compile a configuration",
            compile_failures.clone(),
        );

        let excluded_sinks = Family::default();
        prom.register(
            "excluded_sinks",
            "Gauge of sinks that are not routed on a target",
            excluded_sinks.clone(),
        );

        Self {
            reconciles,
            noops,
            applies,
            apply_failures,
            compile_failures,
            excluded_sinks,
        }
    }

    fn target(target: &str) -> TargetLabels {
        TargetLabels {
            target: target.to_string(),
        }
    }

    fn reconciles(&self, target: &str, trigger: Trigger) -> Counter {
        self.reconciles
            .get_or_create(&TriggerLabels {
                target: target.to_string(),
                trigger: trigger.as_str(),
            })
            .clone()
    }

    fn noops(&self, target: &str) -> Counter {
        self.noops.get_or_create(&Self::target(target)).clone()
    }

    fn applies(&self, target: &str) -> Counter {
        self.applies.get_or_create(&Self::target(target)).clone()
    }

    fn apply_failures(&self, target: &str, error: &ApplyError) -> Counter {
        self.apply_failures
            .get_or_create(&FailureLabels {
                target: target.to_string(),
                error: error.kind(),
            })
            .clone()
    }

    fn compile_failures(&self, target: &str) -> Counter {
        self.compile_failures
            .get_or_create(&Self::target(target))
            .clone()
    }

    fn excluded_sinks(&self, target: &str) -> Gauge {
        self.excluded_sinks
            .get_or_create(&Self::target(target))
            .clone()
    }
}
