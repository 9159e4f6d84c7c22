//! Download endpoint resolution from a Ready export

use std::sync::Arc;

use tracing::debug;

use disk_uploader_common::crd::{ExportLink, VirtualMachineExport, RAW_FORMAT};
use disk_uploader_common::{Error, Result};

use crate::client::ClusterClient;

/// Everything needed to download one volume of an export
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// Raw disk URL
    pub url: String,
    /// CA certificate (PEM) of the export server
    pub certificate: String,
    /// Export token sent in the request header
    pub token: String,
}

impl std::fmt::Debug for ResolvedEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedEndpoint")
            .field("url", &self.url)
            .field("certificate", &self.certificate)
            .field("token", &"<redacted>")
            .finish()
    }
}

fn internal_links<'a>(
    export: &'a VirtualMachineExport,
    namespace: &str,
    name: &str,
) -> Result<&'a ExportLink> {
    export
        .internal_links()
        .ok_or_else(|| Error::StatusUnavailable {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
}

/// Raw disk URL of `volume` in the export's internal links
pub fn raw_disk_url<'a>(
    export: &'a VirtualMachineExport,
    namespace: &str,
    name: &str,
    volume: &str,
) -> Result<&'a str> {
    let links = internal_links(export, namespace, name)?;
    let export_ref = format!("{}/{}", namespace, name);

    let found = links
        .volumes
        .iter()
        .find(|v| v.name == volume)
        .ok_or_else(|| Error::VolumeNotFound {
            export: export_ref.clone(),
            volume: volume.to_string(),
        })?;

    found.url_for(RAW_FORMAT).ok_or_else(|| Error::FormatNotFound {
        export: export_ref,
        volume: volume.to_string(),
        format: RAW_FORMAT.to_string(),
    })
}

/// CA certificate of the export server from the internal links
pub fn certificate<'a>(
    export: &'a VirtualMachineExport,
    namespace: &str,
    name: &str,
) -> Result<&'a str> {
    let links = internal_links(export, namespace, name)?;
    if links.cert.is_empty() {
        return Err(Error::CertificateUnavailable {
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
    Ok(&links.cert)
}

/// Reads download details from the current export status
pub struct EndpointResolver {
    client: Arc<dyn ClusterClient>,
}

impl EndpointResolver {
    /// Create a resolver using the given client
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Fetch the export and return the raw URL of `volume`
    pub async fn get_raw_disk_url(&self, namespace: &str, name: &str, volume: &str) -> Result<String> {
        let export = self.client.get_export(namespace, name).await?;
        let url = raw_disk_url(&export, namespace, name, volume)?;
        debug!(namespace = %namespace, name = %name, volume = %volume, url = %url, "Resolved raw disk URL");
        Ok(url.to_string())
    }

    /// Fetch the export and return its CA certificate
    pub async fn get_certificate(&self, namespace: &str, name: &str) -> Result<String> {
        let export = self.client.get_export(namespace, name).await?;
        Ok(certificate(&export, namespace, name)?.to_string())
    }
}
