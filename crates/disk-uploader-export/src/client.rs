//! Cluster access used by the export pipeline
//!
//! Every cluster interaction the pipeline performs goes through
//! [`ClusterClient`], so the stages can be exercised against mocks.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, PostParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use disk_uploader_common::crd::VirtualMachineExport;
use disk_uploader_common::FIELD_MANAGER;

/// Trait abstracting the Kubernetes operations of the export pipeline
///
/// Errors are returned as raw `kube::Error` so each stage can classify them
/// (lookup, create, credential, transport).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a Pod by namespace and name
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error>;

    /// Create a Secret; fails if it already exists
    async fn create_secret(&self, secret: &Secret) -> Result<(), kube::Error>;

    /// Get a Secret by namespace and name
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error>;

    /// Create a VirtualMachineExport; fails if it already exists
    async fn create_export(&self, export: &VirtualMachineExport) -> Result<(), kube::Error>;

    /// Get a VirtualMachineExport by namespace and name
    async fn get_export(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualMachineExport, kube::Error>;
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, kube::Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), kube::Error> {
        let namespace = secret.metadata.namespace.as_deref().unwrap_or_default();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), secret).await?;
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, kube::Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await
    }

    async fn create_export(&self, export: &VirtualMachineExport) -> Result<(), kube::Error> {
        let namespace = export.metadata.namespace.as_deref().unwrap_or_default();
        let api: Api<VirtualMachineExport> = Api::namespaced(self.client.clone(), namespace);
        api.create(&Self::post_params(), export).await?;
        Ok(())
    }

    async fn get_export(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<VirtualMachineExport, kube::Error> {
        let api: Api<VirtualMachineExport> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await
    }
}
