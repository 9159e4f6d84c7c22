//! Containerdisk images for exported KubeVirt disks
//!
//! - [`containerdisk`]: single-layer image layout for a qcow2 disk
//! - [`registry`]: registry credentials and the push with its time budget

pub mod containerdisk;
pub mod registry;

pub use containerdisk::{build_container_disk, ContainerDisk, LayerFile};
pub use registry::{ContainerDiskPublisher, RegistryCredentials, DEFAULT_MAX_LAYER_SIZE};
