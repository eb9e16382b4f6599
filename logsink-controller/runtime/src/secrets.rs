use crate::{
    core::SecretKeyRef,
    k8s::{self, Api, Secret},
};

/// Looks up credentials material referenced by sinks.
#[async_trait::async_trait]
pub trait SecretSource: Send + Sync {
    async fn lookup(&self, secret: &SecretKeyRef) -> Result<Vec<u8>, SecretError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret {0} does not exist")]
    NotFound(SecretKeyRef),

    #[error("failed to read secret: {0}")]
    Api(#[from] k8s::Error),
}

/// Reads credentials from Kubernetes secrets.
#[derive(Clone)]
pub struct KubeSecrets {
    client: k8s::Client,
}

impl KubeSecrets {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl SecretSource for KubeSecrets {
    async fn lookup(&self, secret: &SecretKeyRef) -> Result<Vec<u8>, SecretError> {
        let api = Api::<Secret>::namespaced(self.client.clone(), &secret.namespace);
        api.get_opt(&secret.name)
            .await?
            .and_then(|s| s.data)
            .and_then(|mut data| data.remove(&secret.key))
            .map(|k8s::ByteString(bytes)| bytes)
            .ok_or_else(|| SecretError::NotFound(secret.clone()))
    }
}
