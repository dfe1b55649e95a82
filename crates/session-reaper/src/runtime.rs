//! Container runtime access (Kubernetes pods).

use crate::error::RuntimeError;
use crate::models::PodRef;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, LogParams};
use kube::Client;
use tracing::{debug, info, warn};

/// Result of a delete call. Both variants mean the pod is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    /// The pod was already removed (duplicate delivery or fallback delete).
    AlreadyGone,
}

/// Operations the teardown path needs from the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Resolve a pod. A missing pod is [`RuntimeError::NotFound`].
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodRef, RuntimeError>;

    /// Fetch the logs of one container in a pod.
    async fn get_pod_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Result<String, RuntimeError>;

    /// Delete a pod. Deleting a pod that no longer exists is a success.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<Deletion, RuntimeError>;
}

/// Pod IP from the pod status. Kubernetes does not always report one.
#[must_use]
pub fn get_pod_ip(pod: &Pod) -> Option<String> {
    let ip = pod
        .status
        .as_ref()
        .and_then(|status| status.pod_ip.clone())
        .filter(|ip| !ip.is_empty());

    if ip.is_none() {
        warn!(
            pod_name = pod.metadata.name.as_deref().unwrap_or_default(),
            "Pod does not have an IP"
        );
    }
    ip
}

/// [`ContainerRuntime`] backed by the Kubernetes API.
///
/// Holds one client created at startup; clones share the underlying connection pool.
#[derive(Clone)]
pub struct KubeRuntime {
    client: Client,
}

impl KubeRuntime {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ContainerRuntime for KubeRuntime {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodRef, RuntimeError> {
        debug!(pod_name = %name, namespace = %namespace, "Getting pod");

        let pod = self.pods(namespace).get(name).await.map_err(|e| {
            warn!(pod_name = %name, error = %e, "Failed to read pod");
            RuntimeError::from_kube(e, "get", namespace, name)
        })?;

        Ok(PodRef {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ip: get_pod_ip(&pod),
        })
    }

    async fn get_pod_logs(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Result<String, RuntimeError> {
        debug!(pod_name = %name, container = %container, "Fetching pod logs");

        let params = LogParams {
            container: Some(container.to_string()),
            ..LogParams::default()
        };

        let logs = self
            .pods(namespace)
            .logs(name, &params)
            .await
            .map_err(|e| RuntimeError::from_kube(e, "read logs of", namespace, name))?;

        info!(pod_name = %name, bytes = logs.len(), "Fetched pod logs");
        Ok(logs)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<Deletion, RuntimeError> {
        info!(pod_name = %name, namespace = %namespace, "Deleting pod");

        match self.pods(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod_name = %name, "Pod deleted");
                Ok(Deletion::Deleted)
            }
            Err(kube::Error::Api(err)) if err.code == 404 => {
                info!(pod_name = %name, "Pod already gone");
                Ok(Deletion::AlreadyGone)
            }
            Err(e) => Err(RuntimeError::from_kube(e, "delete", namespace, name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;
    use kube::api::ObjectMeta;

    fn pod_with_ip(ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("chrome-1".to_string()),
                ..ObjectMeta::default()
            },
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn test_pod_ip_present() {
        assert_eq!(get_pod_ip(&pod_with_ip(Some("10.0.0.5"))), Some("10.0.0.5".to_string()));
    }

    #[test]
    fn test_pod_ip_absent_is_not_an_error() {
        assert_eq!(get_pod_ip(&pod_with_ip(None)), None);
        assert_eq!(get_pod_ip(&pod_with_ip(Some(""))), None);
        assert_eq!(get_pod_ip(&Pod::default()), None);
    }
}
