//! Export-and-extract pipeline for KubeVirt disks
//!
//! Provisions an export token secret, creates a `VirtualMachineExport`,
//! waits for it to become Ready, resolves the raw disk URL and certificate,
//! and streams the disk into a local qcow2 file that is then handed to an
//! [`pipeline::ImagePublisher`]:
//!
//! - [`credentials`]: token generation and the token secret
//! - [`owner`]: pod identity and owner references
//! - [`export`]: export creation and readiness wait
//! - [`endpoint`]: download URL and certificate from the export status
//! - [`disk`]: nbdkit/qemu-img download and optional virt-sysprep
//! - [`pipeline`]: end-to-end sequencing

pub mod client;
pub mod credentials;
pub mod disk;
pub mod endpoint;
pub mod export;
pub mod owner;
pub mod pipeline;

pub use client::{ClusterClient, KubeClusterClient};
pub use export::{ExportSource, ExportSourceKind};
pub use owner::PodIdentity;
pub use pipeline::{ExportPipeline, ImagePublisher, PipelineConfig};

#[cfg(test)]
pub(crate) mod testing;
