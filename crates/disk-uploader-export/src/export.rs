//! VirtualMachineExport creation and readiness
//!
//! The export is created once per run, owned by the uploader pod, and then
//! polled (never watched) until the export controller reports it Ready.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use disk_uploader_common::crd::{SourceReference, VirtualMachineExport, VirtualMachineExportSpec};
use disk_uploader_common::kube_utils::{poll_until, PollConfig, PollError};
use disk_uploader_common::{Error, Result};

use crate::client::ClusterClient;
use crate::owner::OwnershipResolver;

/// Kind of object a VirtualMachineExport can expose
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportSourceKind {
    /// `vm`: a VirtualMachine
    VirtualMachine,
    /// `vmsnapshot`: a VirtualMachineSnapshot
    VirtualMachineSnapshot,
    /// `pvc`: a PersistentVolumeClaim
    PersistentVolumeClaim,
}

impl ExportSourceKind {
    /// API group of the source kind; empty for the core group
    pub fn api_group(&self) -> &'static str {
        match self {
            Self::VirtualMachine => "kubevirt.io",
            Self::VirtualMachineSnapshot => "snapshot.kubevirt.io",
            Self::PersistentVolumeClaim => "",
        }
    }

    /// Kind name as the API server spells it
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VirtualMachine => "VirtualMachine",
            Self::VirtualMachineSnapshot => "VirtualMachineSnapshot",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
        }
    }

    /// Short tag accepted on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VirtualMachine => "vm",
            Self::VirtualMachineSnapshot => "vmsnapshot",
            Self::PersistentVolumeClaim => "pvc",
        }
    }
}

impl FromStr for ExportSourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vm" => Ok(Self::VirtualMachine),
            "vmsnapshot" => Ok(Self::VirtualMachineSnapshot),
            "pvc" => Ok(Self::PersistentVolumeClaim),
            other => Err(Error::InvalidSourceKind {
                kind: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ExportSourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The object being exported
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportSource {
    /// Source kind
    pub kind: ExportSourceKind,
    /// Namespace of both the source and the export
    pub namespace: String,
    /// Name of both the source and the export
    pub name: String,
}

impl ExportSource {
    /// Build a source from its command-line kind tag
    ///
    /// Rejects unknown kinds before anything touches the cluster.
    pub fn new(kind: &str, namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            kind: kind.parse()?,
            namespace: namespace.into(),
            name: name.into(),
        })
    }

    /// Typed reference placed in the export spec
    pub fn reference(&self) -> SourceReference {
        SourceReference {
            api_group: Some(self.kind.api_group().to_string()),
            kind: self.kind.kind().to_string(),
            name: self.name.clone(),
        }
    }
}

/// Build an unowned VirtualMachineExport for `source`
///
/// The export shares the namespace and name of its source.
pub fn build_export(source: &ExportSource, token_secret_ref: Option<&str>) -> VirtualMachineExport {
    let mut export = VirtualMachineExport::new(
        &source.name,
        VirtualMachineExportSpec {
            source: source.reference(),
            token_secret_ref: token_secret_ref.map(str::to_string),
        },
    );
    export.metadata.namespace = Some(source.namespace.clone());
    export
}

/// Creates exports and waits for them to become Ready
pub struct ExportManager {
    client: Arc<dyn ClusterClient>,
    owners: Arc<OwnershipResolver>,
}

impl ExportManager {
    /// Create a manager using the given client and owner resolver
    pub fn new(client: Arc<dyn ClusterClient>, owners: Arc<OwnershipResolver>) -> Self {
        Self { client, owners }
    }

    /// Create the export for `source`, owned by the uploader pod
    pub async fn create_export(
        &self,
        source: &ExportSource,
        token_secret_ref: Option<&str>,
    ) -> Result<()> {
        let mut export = build_export(source, token_secret_ref);
        self.owners.set_pod_owner_reference(&mut export).await?;

        self.client
            .create_export(&export)
            .await
            .map_err(|e| {
                let err = Error::Create {
                    kind: "VirtualMachineExport".to_string(),
                    namespace: source.namespace.clone(),
                    name: source.name.clone(),
                    source: e,
                };
                if err.is_already_exists() {
                    warn!(
                        namespace = %source.namespace,
                        name = %source.name,
                        "VirtualMachineExport already exists; it is removed with the pod that created it"
                    );
                }
                err
            })?;

        info!(
            namespace = %source.namespace,
            name = %source.name,
            source_kind = %source.kind.kind(),
            "Created VirtualMachineExport"
        );
        Ok(())
    }

    /// Wait for the export to become Ready with the default 15s/3600s budget
    pub async fn wait_until_ready(&self, namespace: &str, name: &str) -> Result<()> {
        self.wait_until_ready_with(namespace, name, PollConfig::default())
            .await
    }

    /// Wait for the export to become Ready
    ///
    /// The first poll is immediate. A failed get ends the wait at once;
    /// phases other than Ready (including unknown ones) keep it going.
    pub async fn wait_until_ready_with(
        &self,
        namespace: &str,
        name: &str,
        config: PollConfig,
    ) -> Result<()> {
        info!(
            namespace = %namespace,
            name = %name,
            interval = ?config.interval,
            timeout = ?config.timeout,
            "Waiting for VirtualMachineExport to become ready"
        );

        let result = poll_until(config, || async {
            let export = self.client.get_export(namespace, name).await?;
            let phase = export.status.as_ref().map(|s| s.phase);
            debug!(namespace = %namespace, name = %name, phase = ?phase, "Polled VirtualMachineExport");
            Ok::<bool, kube::Error>(export.is_ready())
        })
        .await;

        match result {
            Ok(()) => {
                info!(namespace = %namespace, name = %name, "VirtualMachineExport is ready");
                Ok(())
            }
            Err(PollError::Timeout(waited)) => {
                warn!(namespace = %namespace, name = %name, waited = ?waited, "VirtualMachineExport never became ready");
                Err(Error::timeout(
                    format!("VirtualMachineExport {}/{} to become ready", namespace, name),
                    waited,
                ))
            }
            Err(PollError::Check(e)) => Err(Error::Kube(e)),
        }
    }
}
