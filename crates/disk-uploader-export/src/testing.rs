//! Fixtures shared by the unit tests of this crate

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use disk_uploader_common::crd::{
    ExportLink, ExportLinks, ExportPhase, ExportVolume, ExportVolumeFormat, SourceReference,
    VirtualMachineExport, VirtualMachineExportSpec, VirtualMachineExportStatus,
};

pub const POD_NAME: &str = "uploader-run-abcde";
pub const POD_UID: &str = "5f0c4a2e-4f7e-4c1b-9d7e-1d2b3c4d5e6f";
pub const NAMESPACE: &str = "vms";
pub const CERT: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} from apiserver", reason),
        reason: reason.to_string(),
        code,
    })
}

pub fn pod(namespace: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(POD_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(POD_UID.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn export_with_status(name: &str, status: Option<VirtualMachineExportStatus>) -> VirtualMachineExport {
    let mut export = VirtualMachineExport::new(
        name,
        VirtualMachineExportSpec {
            source: SourceReference {
                api_group: Some("kubevirt.io".to_string()),
                kind: "VirtualMachine".to_string(),
                name: name.to_string(),
            },
            token_secret_ref: Some(name.to_string()),
        },
    );
    export.metadata.namespace = Some(NAMESPACE.to_string());
    export.status = status;
    export
}

pub fn pending_export(name: &str) -> VirtualMachineExport {
    export_with_status(
        name,
        Some(VirtualMachineExportStatus {
            phase: ExportPhase::Pending,
            ..Default::default()
        }),
    )
}

pub fn ready_export(name: &str, volumes: Vec<ExportVolume>) -> VirtualMachineExport {
    export_with_status(
        name,
        Some(VirtualMachineExportStatus {
            phase: ExportPhase::Ready,
            links: Some(ExportLinks {
                internal: Some(ExportLink {
                    cert: CERT.to_string(),
                    volumes,
                }),
                external: None,
            }),
            token_secret_ref: Some(name.to_string()),
            service_name: Some(format!("virt-export-{}", name)),
        }),
    )
}

pub fn volume(name: &str, formats: &[(&str, &str)]) -> ExportVolume {
    ExportVolume {
        name: name.to_string(),
        formats: formats
            .iter()
            .map(|(format, url)| ExportVolumeFormat {
                format: format.to_string(),
                url: url.to_string(),
            })
            .collect(),
    }
}
