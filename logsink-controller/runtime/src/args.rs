use crate::{
    agent::ConfigMapAgent,
    index::{self, metrics::IndexMetrics, ClusterInfo},
    k8s, lease,
    reconcile::{Leadership, ReconcileMetrics, Reconciler, ResyncHandle},
    secrets::KubeSecrets,
    status,
    target::Target,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use kubert::lease::Claim;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::{mpsc, watch},
    time::Duration,
};
use tracing::{info_span, Instrument};

// The maximum number of status patches to buffer.
const STATUS_UPDATE_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Parser)]
#[clap(
    name = "logsink-controller",
    about = "Compiles LogSink resources into log-shipping agent routing"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "logsink=info,warn",
        env = "LOGSINK_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// ConfigMaps, as `namespace/name`, from which log-shipping agents load their routing.
    #[clap(
        long = "target",
        default_value = "knative-observability/fluent-bit",
        value_delimiter = ','
    )]
    targets: Vec<Target>,

    /// The namespace in which the controller runs. Credentials referenced by cluster-scoped sinks
    /// are read from this namespace.
    #[clap(long, default_value = "knative-observability")]
    controller_namespace: String,

    #[clap(long, default_value = "logsink-controller")]
    controller_deployment_name: String,

    /// How often every target is recompiled and checked even if nothing has changed.
    #[clap(long, default_value = "60")]
    resync_interval_secs: u64,

    #[clap(long, default_value = "5000")]
    apply_timeout_ms: u64,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            targets,
            controller_namespace,
            controller_deployment_name,
            resync_interval_secs,
            apply_timeout_ms,
            patch_timeout_ms,
        } = self;

        if targets.is_empty() {
            bail!("at least one --target must be configured");
        }

        let cluster_info = Arc::new(ClusterInfo {
            controller_ns: controller_namespace.clone(),
        });

        // The reconciliation state tracks each target's progress and publishes sink statuses;
        // the registry mirrors declared sinks and validates them as they are indexed.
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let state = status::ReconciliationState::shared(targets.iter(), updates_tx);
        let registry = index::Registry::shared(cluster_info, state.clone());

        let mut prom = <Registry>::default();
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("sink_status"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let indexed = IndexMetrics::register(
            registry.clone(),
            prom.sub_registry_with_prefix("logsink_index"),
        )
        .shared();
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").context("Failed to fetch `HOSTNAME` environment variable")?;

        let claims = lease::init(
            &runtime,
            &controller_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        // Spawn resource watches.

        let sinks = runtime.watch_all::<k8s::LogSink>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(indexed.clone(), sinks).instrument(info_span!("logsinks")),
        );

        let cluster_sinks = runtime.watch_all::<k8s::ClusterLogSink>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(indexed, cluster_sinks)
                .instrument(info_span!("clusterlogsinks")),
        );

        // Spawn a reconciler for each target.

        let resync = ResyncHandle::default();
        let agent = ConfigMapAgent::new(runtime.client(), Duration::from_millis(apply_timeout_ms));
        let secrets = KubeSecrets::new(runtime.client());
        let resync_interval = Duration::from_secs(resync_interval_secs);
        for target in targets {
            let span = info_span!("reconcile", %target);
            let changes = registry.read().subscribe();
            let reconciler = Reconciler::new(
                target,
                registry.clone(),
                state.clone(),
                agent.clone(),
                secrets.clone(),
                Leadership::new(claims.clone(), &hostname),
                reconcile_metrics.clone(),
            );
            tokio::spawn(
                reconciler
                    .run(changes, resync.subscribe(), resync_interval)
                    .instrument(span),
            );
        }

        tokio::spawn(
            on_leadership(claims.clone(), hostname.clone(), state.clone(), resync.clone())
                .instrument(info_span!("leadership")),
        );
        tokio::spawn(resync_on_hangup(resync).instrument(info_span!("sighup")));

        let status_controller = status::Controller::new(
            claims,
            runtime.client(),
            hostname,
            updates_rx,
            state,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// When this replica acquires the write lease, republishes every sink status and reconciles every
/// target, since the previous leader may have left either behind.
async fn on_leadership(
    mut claims: watch::Receiver<Arc<Claim>>,
    hostname: String,
    state: status::SharedState,
    resync: ResyncHandle,
) {
    let mut leading = false;
    loop {
        let current = claims.borrow_and_update().is_current_for(&hostname);
        if current && !leading {
            tracing::info!("Acquired the write lease");
            state.write().republish();
            resync.resync();
        } else if !current && leading {
            tracing::info!("Lost the write lease");
        }
        leading = current;

        if claims.changed().await.is_err() {
            return;
        }
    }
}

/// Forces a resync of every target on SIGHUP.
async fn resync_on_hangup(resync: ResyncHandle) {
    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(error) => {
            tracing::warn!(%error, "Failed to register SIGHUP handler");
            return;
        }
    };
    while hangups.recv().await.is_some() {
        tracing::info!("Forcing resync");
        resync.resync();
    }
}
