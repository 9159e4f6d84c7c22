//! Registry push of containerdisk images

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::manifest::IMAGE_LAYER_MEDIA_TYPE;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tracing::{debug, info, warn};

use disk_uploader_common::{Error, Result};
use disk_uploader_export::ImagePublisher;

use crate::containerdisk::{build_container_disk, ContainerDisk};

/// Environment variable holding the registry user name
pub const REGISTRY_USERNAME_ENV: &str = "REGISTRY_USERNAME";
/// Environment variable holding the registry password
pub const REGISTRY_PASSWORD_ENV: &str = "REGISTRY_PASSWORD";

/// Default ceiling on the layer size read back for upload (4 GiB)
///
/// The registry client uploads blobs from memory, so the whole layer is
/// resident while it is pushed. Larger layers fail before the read.
pub const DEFAULT_MAX_LAYER_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Credentials for the destination registry
#[derive(Clone, Default)]
pub struct RegistryCredentials {
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RegistryCredentials {
    fn anonymous() -> Self {
        Self::default()
    }

    /// Basic auth; used only when both values are non-empty
    pub fn from_values(username: Option<String>, password: Option<String>) -> Self {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
        match (non_empty(username), non_empty(password)) {
            (Some(u), Some(p)) => Self {
                username: Some(u),
                password: Some(p),
            },
            _ => Self::anonymous(),
        }
    }

    /// Whether basic auth will be sent
    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> RegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => RegistryAuth::Basic(u.clone(), p.clone()),
            _ => RegistryAuth::Anonymous,
        }
    }
}

/// Parse an image reference, mapping failures to an image error
pub fn parse_reference(destination: &str) -> Result<Reference> {
    destination
        .parse::<Reference>()
        .map_err(|e| Error::image(destination, format!("invalid image reference: {}", e)))
}

/// Builds containerdisks and pushes them over HTTPS
pub struct ContainerDiskPublisher {
    client: Client,
    credentials: RegistryCredentials,
    max_layer_size: u64,
}

impl ContainerDiskPublisher {
    /// Create a publisher using the given credentials
    pub fn new(credentials: RegistryCredentials) -> Self {
        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        });
        Self {
            client,
            credentials,
            max_layer_size: DEFAULT_MAX_LAYER_SIZE,
        }
    }

    /// Override the largest layer, in bytes, that will be pushed
    pub fn with_max_layer_size(mut self, bytes: u64) -> Self {
        self.max_layer_size = bytes;
        self
    }

    async fn load_layer(&self, destination: &str, image: &ContainerDisk) -> Result<ImageLayer> {
        let layer = &image.layer;
        if layer.size > self.max_layer_size {
            return Err(Error::image(
                destination,
                format!(
                    "containerdisk layer is {} bytes, above the {} byte upload limit",
                    layer.size, self.max_layer_size
                ),
            ));
        }

        let data = tokio::fs::read(&layer.path)
            .await
            .map_err(|e| Error::io(&layer.path, e))?;
        Ok(ImageLayer::new(data, IMAGE_LAYER_MEDIA_TYPE.to_string(), None))
    }

    async fn push(
        &self,
        reference: &Reference,
        destination: &str,
        layer: ImageLayer,
        config: Config,
    ) -> Result<()> {
        let auth = self.credentials.to_oci_auth();
        let response = self
            .client
            .push(reference, &[layer], config, &auth, None)
            .await
            .map_err(|e| Error::image(destination, format!("failed to push image: {}", e)))?;

        info!(
            destination = %destination,
            manifest_url = %response.manifest_url,
            "Image pushed successfully"
        );
        Ok(())
    }

    async fn upload(
        &self,
        reference: &Reference,
        destination: &str,
        image: ContainerDisk,
        push_timeout: Duration,
    ) -> Result<()> {
        let layer = self.load_layer(destination, &image).await?;

        info!(
            destination = %destination,
            layer_size = image.layer.size,
            anonymous = self.credentials.is_anonymous(),
            timeout = ?push_timeout,
            "Pushing containerdisk image"
        );
        let push = self.push(reference, destination, layer, image.config);
        match tokio::time::timeout(push_timeout, push).await {
            Ok(result) => result,
            Err(_) => {
                warn!(destination = %destination, timeout = ?push_timeout, "Image push timed out");
                Err(Error::timeout(format!("push of {}", destination), push_timeout))
            }
        }
    }
}

#[async_trait]
impl ImagePublisher for ContainerDiskPublisher {
    async fn publish(&self, disk_path: &Path, destination: &str, push_timeout: Duration) -> Result<()> {
        let reference = parse_reference(destination)?;

        info!(disk = %disk_path.display(), destination = %destination, "Building containerdisk image");
        let path: PathBuf = disk_path.to_path_buf();
        let image = tokio::task::spawn_blocking(move || build_container_disk(&path))
            .await
            .map_err(|e| Error::image(destination, format!("image build task failed: {}", e)))??;

        let layer_path = image.layer.path.clone();
        let result = self.upload(&reference, destination, image, push_timeout).await;

        if let Err(e) = tokio::fs::remove_file(&layer_path).await {
            debug!(layer = %layer_path.display(), error = %e, "Failed to remove layer file");
        }
        result
    }
}
