use crate::k8s::{
    self,
    api::{apps::v1::Deployment, coordination::v1::Lease},
    ObjectMeta, Patch, PatchParams, Resource,
};
use anyhow::{Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kubert::lease::{Claim, ClaimParams, LeaseManager};
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::watch, time::Duration};

const LEASE_NAME: &str = "logsink-controller-write";
const FIELD_MANAGER: &str = "logsink-controller";

const CLAIM_PARAMS: ClaimParams = ClaimParams {
    lease_duration: Duration::from_secs(30),
    renew_grace_period: Duration::from_secs(1),
};

/// Ensures the write lease exists and starts competing for it.
///
/// Only the holder of the lease applies routing configuration and writes sink status.
pub async fn init<T>(
    runtime: &kubert::Runtime<T>,
    ns: &str,
    deployment_name: &str,
    hostname: &str,
) -> Result<watch::Receiver<Arc<Claim>>> {
    let owner = deployment_owner(runtime.client(), ns, deployment_name).await?;
    let api = k8s::Api::<Lease>::namespaced(runtime.client(), ns);
    create_if_missing(&api, mk_lease(ns, owner)).await?;

    let (claims, _task) = LeaseManager::init(api, LEASE_NAME)
        .await?
        .spawn(hostname, CLAIM_PARAMS)
        .await?;
    Ok(claims)
}

/// The Lease is owned by the controller's Deployment so that it is removed along with it.
async fn deployment_owner(
    client: k8s::Client,
    ns: &str,
    deployment_name: &str,
) -> Result<OwnerReference> {
    let deployment = k8s::Api::<Deployment>::namespaced(client, ns)
        .get(deployment_name)
        .await
        .with_context(|| format!("failed to fetch deployment {ns}/{deployment_name}"))?;
    deployment
        .controller_owner_ref(&())
        .context("deployment has no name or uid")
}

async fn create_if_missing(api: &k8s::Api<Lease>, lease: Lease) -> Result<()> {
    let params = PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    };
    match api.patch(LEASE_NAME, &params, &Patch::Apply(lease)).await {
        Ok(lease) => tracing::info!(?lease, "Created Lease resource"),
        // The resource version precondition fails when the Lease already exists.
        Err(k8s::Error::Api(_)) => tracing::debug!("Lease already exists"),
        Err(error) => return Err(error.into()),
    }
    Ok(())
}

fn mk_lease(ns: &str, owner: OwnerReference) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(LEASE_NAME.to_string()),
            namespace: Some(ns.to_string()),
            // Only create the Lease if it does not already exist.
            resource_version: Some("0".to_string()),
            owner_references: Some(vec![owner]),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/component".to_string(),
                FIELD_MANAGER.to_string(),
            )])),
            ..Default::default()
        },
        spec: None,
    }
}
