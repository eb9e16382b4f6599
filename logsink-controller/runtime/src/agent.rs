use crate::{
    core::CompiledConfig,
    k8s::{self, Api, ConfigMap, ObjectMeta, Patch, PatchParams},
    target::Target,
};
use std::collections::BTreeMap;
use tokio::time::{self, Duration};

/// The ConfigMap key holding the rendered routing document.
pub const CONFIG_KEY: &str = "routing.json";

/// Annotates a target ConfigMap with the fingerprint of its routing document.
pub const FINGERPRINT_ANNOTATION: &str = "observability.knative.dev/config-fingerprint";

const FIELD_MANAGER: &str = "logsink-controller";

/// Applies routing configuration to a log-shipping agent.
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    /// Reads the configuration currently held by the target, if any.
    async fn current(&self, target: &Target) -> Result<Option<CompiledConfig>, ApplyError>;

    /// Replaces the target's configuration. Succeeds only once the configuration is stored.
    async fn apply(&self, target: &Target, config: &CompiledConfig) -> Result<(), ApplyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("target is unreachable: {0}")]
    Unreachable(String),

    #[error("configuration was rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Stores routing configuration in the ConfigMap that the agents mount.
#[derive(Clone)]
pub struct ConfigMapAgent {
    client: k8s::Client,
    timeout: Duration,
}

// === impl ApplyError ===

impl ApplyError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::Rejected(_) => "rejected",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classifies an API error. Client errors are rejections, except for those that indicate
    /// throttling or a request timeout.
    pub(crate) fn from_api(error: k8s::Error) -> Self {
        match &error {
            k8s::Error::Api(rsp)
                if (400..500).contains(&rsp.code) && rsp.code != 408 && rsp.code != 429 =>
            {
                Self::Rejected(error.to_string())
            }
            _ => Self::Unreachable(error.to_string()),
        }
    }
}

// === impl ConfigMapAgent ===

impl ConfigMapAgent {
    pub fn new(client: k8s::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, target: &Target) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), &target.namespace)
    }
}

#[async_trait::async_trait]
impl Agent for ConfigMapAgent {
    async fn current(&self, target: &Target) -> Result<Option<CompiledConfig>, ApplyError> {
        let configmap = time::timeout(self.timeout, self.api(target).get_opt(&target.name))
            .await
            .map_err(|_| ApplyError::Timeout(self.timeout))?
            .map_err(ApplyError::from_api)?;

        let Some(rendered) = configmap
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(CONFIG_KEY))
        else {
            return Ok(None);
        };
        CompiledConfig::parse(&rendered).map(Some).map_err(|error| {
            ApplyError::Rejected(format!("stored configuration cannot be parsed: {error}"))
        })
    }

    async fn apply(&self, target: &Target, config: &CompiledConfig) -> Result<(), ApplyError> {
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(target.name.clone()),
                namespace: Some(target.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    FINGERPRINT_ANNOTATION.to_string(),
                    config.fingerprint().to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                CONFIG_KEY.to_string(),
                config.rendered().to_string(),
            )])),
            ..Default::default()
        };

        let params = PatchParams::apply(FIELD_MANAGER).force();
        time::timeout(
            self.timeout,
            self.api(target)
                .patch(&target.name, &params, &Patch::Apply(&configmap)),
        )
        .await
        .map_err(|_| ApplyError::Timeout(self.timeout))?
        .map_err(ApplyError::from_api)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> k8s::Error {
        k8s::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "nope".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn classifies_api_errors() {
        assert_eq!(ApplyError::from_api(api_error(422)).kind(), "rejected");
        assert_eq!(ApplyError::from_api(api_error(403)).kind(), "rejected");
        assert_eq!(ApplyError::from_api(api_error(408)).kind(), "unreachable");
        assert_eq!(ApplyError::from_api(api_error(429)).kind(), "unreachable");
        assert_eq!(ApplyError::from_api(api_error(503)).kind(), "unreachable");
    }
}
