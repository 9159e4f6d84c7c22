//! VirtualMachineExport CRD (export.kubevirt.io/v1beta1)
//!
//! A VirtualMachineExport asks the KubeVirt export controller to serve the
//! disks of a VirtualMachine, VirtualMachineSnapshot or PersistentVolumeClaim
//! over HTTPS. Once the export server is up the status flips to `Ready` and
//! carries per-volume download links plus the server's CA certificate.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Format name of an uncompressed raw disk link
pub const RAW_FORMAT: &str = "raw";

/// VirtualMachineExport requests a downloadable export of a disk source.
///
/// Example:
/// ```yaml
/// apiVersion: export.kubevirt.io/v1beta1
/// kind: VirtualMachineExport
/// metadata:
///   name: fedora
///   namespace: vms
/// spec:
///   tokenSecretRef: fedora
///   source:
///     apiGroup: kubevirt.io
///     kind: VirtualMachine
///     name: fedora
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "export.kubevirt.io",
    version = "v1beta1",
    kind = "VirtualMachineExport",
    namespaced,
    status = "VirtualMachineExportStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineExportSpec {
    /// What is being exported
    pub source: SourceReference,

    /// Name of the secret holding the token the export server accepts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<String>,
}

/// Typed reference to the exported object in the export's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    /// API group of the source; absent for the core group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// Kind of the source (VirtualMachine, VirtualMachineSnapshot, PersistentVolumeClaim)
    pub kind: String,
    /// Name of the source
    pub name: String,
}

/// VirtualMachineExport status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineExportStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ExportPhase,

    /// Download links, present once the export server is running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<ExportLinks>,

    /// Secret the export server reads its token from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_secret_ref: Option<String>,

    /// Name of the service fronting the export server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

/// VirtualMachineExport phase
///
/// Only the Pending -> Ready transition matters to the uploader; any phase
/// it does not know is treated as "not ready yet".
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExportPhase {
    /// Export server is being set up
    #[default]
    Pending,
    /// Export server is serving the volumes
    Ready,
    /// Any other phase reported by the export controller
    #[serde(other)]
    Unknown,
}

/// Internal (in-cluster) and external (ingress/route) link sets
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ExportLinks {
    /// Links reachable from inside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<ExportLink>,
    /// Links reachable from outside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExportLink>,
}

/// One link set: the server certificate plus per-volume URLs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ExportLink {
    /// PEM encoded CA certificate of the export server
    #[serde(default)]
    pub cert: String,
    /// Exported volumes
    #[serde(default)]
    pub volumes: Vec<ExportVolume>,
}

/// A single exported volume and the formats it is served in
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ExportVolume {
    /// Volume name as known to the source
    pub name: String,
    /// Available download formats
    #[serde(default)]
    pub formats: Vec<ExportVolumeFormat>,
}

/// Download URL for one format of a volume
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ExportVolumeFormat {
    /// Format name (raw, gzip, dir, tar.gz)
    pub format: String,
    /// Download URL
    pub url: String,
}

impl VirtualMachineExport {
    /// Check whether the export controller reports the export as Ready
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == ExportPhase::Ready)
            .unwrap_or(false)
    }

    /// Get the in-cluster link set, if the status carries one
    pub fn internal_links(&self) -> Option<&ExportLink> {
        self.status
            .as_ref()
            .and_then(|s| s.links.as_ref())
            .and_then(|l| l.internal.as_ref())
    }
}

impl ExportVolume {
    /// First URL offered in the given format
    pub fn url_for(&self, format: &str) -> Option<&str> {
        self.formats
            .iter()
            .find(|f| f.format == format)
            .map(|f| f.url.as_str())
    }
}
