//! Common types for kubevirt-disk-uploader: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable carrying the name of the pod running the uploader
pub const POD_NAME_ENV: &str = "POD_NAME";

/// Environment variable carrying the namespace of the pod running the uploader
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";

/// Optional environment variable overriding the namespace of the export
pub const VM_NAMESPACE_ENV: &str = "VM_NAMESPACE";

/// HTTP header the export server expects the bearer token in
pub const EXPORT_TOKEN_HEADER: &str = "x-kubevirt-export-token";

/// Secret data key holding the export token
pub const EXPORT_TOKEN_KEY: &str = "token";

/// Field manager / user agent name used for cluster writes
pub const FIELD_MANAGER: &str = "kubevirt-disk-uploader";
