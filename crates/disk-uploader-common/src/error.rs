//! Error types for the disk uploader
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant names the stage that failed and carries the namespace,
//! resource name, volume or path it was working on.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for export-and-upload operations
#[derive(Debug, Error)]
pub enum Error {
    /// Export source kind is not one of vm, vmsnapshot, pvc
    #[error("invalid export source kind '{kind}': expected one of vm, vmsnapshot, pvc")]
    InvalidSourceKind {
        /// The rejected kind string
        kind: String,
    },

    /// A required environment variable is not set
    #[error("environment variable {variable} is not set")]
    Environment {
        /// Name of the missing variable
        variable: String,
    },

    /// The owning pod could not be fetched
    #[error("failed to look up pod {namespace}/{name}: {reason}")]
    Lookup {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
        /// Why the lookup failed
        reason: String,
    },

    /// Owner and owned object live in different namespaces
    #[error(
        "can't create owner reference for objects in different namespaces \
         (object in {object_namespace}, owner in {owner_namespace})"
    )]
    CrossNamespace {
        /// Namespace of the object receiving the owner reference
        object_namespace: String,
        /// Namespace of the owning pod
        owner_namespace: String,
    },

    /// The cluster rejected a create call
    #[error("failed to create {kind} {namespace}/{name}: {source}")]
    Create {
        /// Resource kind being created
        kind: String,
        /// Resource namespace
        namespace: String,
        /// Resource name
        name: String,
        /// The underlying kube-rs error
        #[source]
        source: kube::Error,
    },

    /// A bounded wait elapsed before its condition held
    #[error("timed out after {waited:?} waiting for {operation}")]
    Timeout {
        /// What was being waited for
        operation: String,
        /// How long we waited
        waited: Duration,
    },

    /// The export status carries no internal links yet
    #[error("no links found in VirtualMachineExport {namespace}/{name} status")]
    StatusUnavailable {
        /// Export namespace
        namespace: String,
        /// Export name
        name: String,
    },

    /// The requested volume is not among the export's internal volumes
    #[error("volume {volume} is not found in VirtualMachineExport {export} internal volumes")]
    VolumeNotFound {
        /// Export in namespace/name form
        export: String,
        /// Requested volume name
        volume: String,
    },

    /// The volume exists but offers no URL in the wanted format
    #[error("volume {volume} of VirtualMachineExport {export} has no {format} format URL")]
    FormatNotFound {
        /// Export in namespace/name form
        export: String,
        /// Volume name
        volume: String,
        /// The missing format
        format: String,
    },

    /// The export status carries no certificate
    #[error("no certificate found in VirtualMachineExport {namespace}/{name} status")]
    CertificateUnavailable {
        /// Export namespace
        namespace: String,
        /// Export name
        name: String,
    },

    /// Export token could not be generated, stored or read back
    #[error("export credential error for secret {namespace}/{name}: {message}")]
    Credential {
        /// Secret namespace
        namespace: String,
        /// Secret name
        name: String,
        /// Description of what failed
        message: String,
    },

    /// The materialized disk file is missing or has zero size
    #[error("disk image file {} does not exist or is empty", path.display())]
    EmptyOutput {
        /// Expected output path
        path: PathBuf,
    },

    /// An external tool could not be spawned or exited unsuccessfully
    #[error("command {program} failed: {message}")]
    Command {
        /// Program name
        program: String,
        /// Exit status or spawn error
        message: String,
    },

    /// Container image could not be built or pushed
    #[error("image error for {reference}: {message}")]
    Image {
        /// Image reference (or local path while building)
        reference: String,
        /// Description of what failed
        message: String,
    },

    /// Local file system error
    #[error("io error on {}: {source}", path.display())]
    Io {
        /// Path being read or written
        path: PathBuf,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// Kubernetes client configuration could not be loaded
    #[error("kubernetes client configuration error: {message}")]
    ClientConfig {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Kubernetes API error outside of create/lookup (gets, transport)
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),
}

impl Error {
    /// Create an environment error for a missing variable
    pub fn environment(variable: impl Into<String>) -> Self {
        Self::Environment {
            variable: variable.into(),
        }
    }

    /// Create a pod lookup error
    pub fn lookup(
        namespace: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Lookup {
            namespace: namespace.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a credential error for the given secret
    pub fn credential(
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Credential {
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited,
        }
    }

    /// Create a command error
    pub fn command(program: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: msg.into(),
        }
    }

    /// Create an image build/push error
    pub fn image(reference: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Image {
            reference: reference.into(),
            message: msg.into(),
        }
    }

    /// Create a client configuration error
    pub fn client_config(msg: impl Into<String>) -> Self {
        Self::ClientConfig {
            message: msg.into(),
        }
    }

    /// Create an io error bound to a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Check if this error came from a bounded wait running out
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Check if the cluster reported that the resource already exists
    ///
    /// Concurrent runs against the same namespace/name are unsupported, so
    /// this is only used to give a clearer message.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::Create {
                source: kube::Error::Api(ae),
                ..
            } => ae.code == 409,
            _ => false,
        }
    }
}
