//! End-to-end export-and-extract sequencing
//!
//! Stages run strictly in order and the first failure ends the run. Nothing
//! is retried or rolled back: the secret and export are owned by the pod and
//! are garbage collected with it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use disk_uploader_common::kube_utils::PollConfig;
use disk_uploader_common::{Result, EXPORT_TOKEN_HEADER};

use crate::client::ClusterClient;
use crate::credentials::CredentialProvisioner;
use crate::disk::{write_certificate_file, DiskTransfer};
use crate::endpoint::{EndpointResolver, ResolvedEndpoint};
use crate::export::{ExportManager, ExportSource};
use crate::owner::{OwnershipResolver, PodIdentity};

/// File name of the downloaded disk inside the scratch directory
pub const DISK_FILE_NAME: &str = "disk.qcow2";

/// File name of the export server certificate inside the scratch directory
pub const CERT_FILE_NAME: &str = "tls.crt";

/// Builds a container image from a disk file and pushes it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImagePublisher: Send + Sync {
    /// Package `disk_path` and push it to `destination` within `push_timeout`
    async fn publish(&self, disk_path: &Path, destination: &str, push_timeout: Duration) -> Result<()>;
}

/// Inputs of one pipeline run, resolved once at startup
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Object to export; the secret and export share its namespace and name
    pub source: ExportSource,
    /// Volume of the export to download
    pub volume_name: String,
    /// Image reference to push to
    pub image_destination: String,
    /// Budget for the whole push
    pub push_timeout: Duration,
    /// Readiness polling interval and deadline
    pub poll: PollConfig,
    /// Directory holding the certificate and downloaded disk
    pub scratch_dir: PathBuf,
    /// Run virt-sysprep on the disk before publishing
    pub enable_virt_sysprep: bool,
}

impl PipelineConfig {
    /// Path the disk is downloaded to
    pub fn disk_path(&self) -> PathBuf {
        self.scratch_dir.join(DISK_FILE_NAME)
    }

    /// Path the certificate is written to
    pub fn cert_path(&self) -> PathBuf {
        self.scratch_dir.join(CERT_FILE_NAME)
    }
}

/// Runs every stage from token secret to pushed image
pub struct ExportPipeline {
    credentials: CredentialProvisioner,
    exports: ExportManager,
    endpoints: EndpointResolver,
    transfer: Arc<dyn DiskTransfer>,
    publisher: Arc<dyn ImagePublisher>,
}

impl ExportPipeline {
    /// Wire the pipeline stages around one cluster client
    ///
    /// The owner pod is resolved lazily and shared by every stage that
    /// creates objects.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        identity: PodIdentity,
        transfer: Arc<dyn DiskTransfer>,
        publisher: Arc<dyn ImagePublisher>,
    ) -> Self {
        let owners = Arc::new(OwnershipResolver::new(client.clone(), identity));
        Self {
            credentials: CredentialProvisioner::new(client.clone(), owners.clone()),
            exports: ExportManager::new(client.clone(), owners),
            endpoints: EndpointResolver::new(client),
            transfer,
            publisher,
        }
    }

    /// Wait for the export and collect URL, certificate and token
    ///
    /// The certificate is written to the scratch directory before the token
    /// is read; the returned path points at it.
    async fn resolve_endpoint(&self, config: &PipelineConfig) -> Result<(ResolvedEndpoint, PathBuf)> {
        let ExportSource {
            namespace, name, ..
        } = &config.source;

        self.exports
            .wait_until_ready_with(namespace, name, config.poll)
            .await?;

        let url = self
            .endpoints
            .get_raw_disk_url(namespace, name, &config.volume_name)
            .await?;
        let certificate = self.endpoints.get_certificate(namespace, name).await?;
        let cert_path = write_certificate_file(&config.cert_path(), &certificate)?;
        let token = self.credentials.get_export_token(namespace, name).await?;

        let endpoint = ResolvedEndpoint {
            url,
            certificate,
            token,
        };
        Ok((endpoint, cert_path))
    }

    /// Run the pipeline once
    pub async fn run(&self, config: &PipelineConfig) -> Result<()> {
        let ExportSource {
            kind,
            namespace,
            name,
        } = &config.source;
        info!(
            source_kind = %kind,
            namespace = %namespace,
            name = %name,
            volume = %config.volume_name,
            destination = %config.image_destination,
            "Starting disk export"
        );

        self.credentials
            .create_export_secret(namespace, name)
            .await?;
        self.exports
            .create_export(&config.source, Some(name.as_str()))
            .await?;

        let (endpoint, cert_path) = self.resolve_endpoint(config).await?;

        let disk_path = config.disk_path();
        self.transfer
            .download(
                &endpoint.url,
                EXPORT_TOKEN_HEADER,
                &endpoint.token,
                &cert_path,
                &disk_path,
            )
            .await?;

        if config.enable_virt_sysprep {
            self.transfer.sysprep(&disk_path).await?;
        }

        self.publisher
            .publish(&disk_path, &config.image_destination, config.push_timeout)
            .await?;

        info!(
            namespace = %namespace,
            name = %name,
            destination = %config.image_destination,
            "Successfully uploaded disk image"
        );
        Ok(())
    }
}
