//! Custom Resource Definitions consumed by the uploader
//!
//! The uploader never installs these CRDs; KubeVirt owns them. The types
//! only model the fields the export pipeline reads and writes.

mod export;

pub use export::{
    ExportLink, ExportLinks, ExportPhase, ExportVolume, ExportVolumeFormat, SourceReference,
    VirtualMachineExport, VirtualMachineExportSpec, VirtualMachineExportStatus, RAW_FORMAT,
};
