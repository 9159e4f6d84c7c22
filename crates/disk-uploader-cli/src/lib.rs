//! kubevirt-disk-uploader command line
//!
//! Flags and environment are read once here and folded into a
//! [`PipelineConfig`]; nothing below this crate looks at the environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::{ArgAction, Parser};
use tracing::info;

use disk_uploader_common::kube_utils::{create_client, PollConfig};
use disk_uploader_common::telemetry::LogFormat;
use disk_uploader_common::{POD_NAMESPACE_ENV, POD_NAME_ENV, VM_NAMESPACE_ENV};
use disk_uploader_export::disk::NbdkitTransfer;
use disk_uploader_export::{
    ExportPipeline, ExportSource, KubeClusterClient, PipelineConfig, PodIdentity,
};
use disk_uploader_image::registry::{REGISTRY_PASSWORD_ENV, REGISTRY_USERNAME_ENV};
use disk_uploader_image::{ContainerDiskPublisher, RegistryCredentials};

const SECS_PER_MINUTE: u64 = 60;
const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Extracts a KubeVirt disk through a VirtualMachineExport and pushes it as a containerdisk
#[derive(Parser, Debug)]
#[command(name = "kubevirt-disk-uploader")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Kind of the export source: vm, vmsnapshot or pvc
    #[arg(long, default_value = "vm")]
    pub export_source_kind: String,

    /// Name of the VM, VM snapshot or PVC to export
    #[arg(long, visible_alias = "vmname")]
    pub export_source_name: String,

    /// Namespace of the export source (defaults to the pod namespace)
    #[arg(long, visible_alias = "vmnamespace")]
    pub export_source_namespace: Option<String>,

    /// Name of the volume to extract from the export
    #[arg(long = "volumename")]
    pub volume_name: String,

    /// Destination of the containerdisk image
    #[arg(long = "imagedestination")]
    pub image_destination: String,

    /// Containerdisk push timeout in minutes
    #[arg(long = "pushtimeout", default_value_t = 60)]
    pub push_timeout_minutes: u64,

    /// Run virt-sysprep on the disk before building the image
    #[arg(
        long = "enablevirtsysprep",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub enable_virt_sysprep: bool,

    /// Largest containerdisk layer to push, in MiB
    #[arg(long, default_value_t = 4096)]
    pub max_layer_size_mib: u64,

    /// Seconds between VirtualMachineExport readiness polls
    #[arg(long, default_value_t = 15)]
    pub poll_interval_secs: u64,

    /// Seconds to wait for the VirtualMachineExport to become ready
    #[arg(long, default_value_t = 3600)]
    pub ready_timeout_secs: u64,

    /// Directory for the downloaded disk and the export certificate
    #[arg(long, default_value = "./tmp")]
    pub scratch_dir: PathBuf,

    /// Path to a kubeconfig file (in-cluster or default config otherwise)
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Log output format: text or json
    #[arg(long, default_value = "text")]
    pub log_format: LogFormat,

    /// Name of the pod running the uploader
    #[arg(long, env = POD_NAME_ENV)]
    pub pod_name: Option<String>,

    /// Namespace of the pod running the uploader
    #[arg(long, env = POD_NAMESPACE_ENV)]
    pub pod_namespace: Option<String>,

    /// Overrides the export source namespace
    #[arg(long, env = VM_NAMESPACE_ENV, hide = true)]
    pub vm_namespace: Option<String>,

    /// Registry user name
    #[arg(long, env = REGISTRY_USERNAME_ENV, hide_env_values = true)]
    pub registry_username: Option<String>,

    /// Registry password
    #[arg(long, env = REGISTRY_PASSWORD_ENV, hide_env_values = true)]
    pub registry_password: Option<String>,
}

/// Everything a run needs, validated before touching the cluster
#[derive(Debug)]
pub struct Settings {
    /// Uploader pod; owns every created object
    pub identity: PodIdentity,
    /// Pipeline inputs
    pub pipeline: PipelineConfig,
    /// Destination registry credentials
    pub credentials: RegistryCredentials,
    /// Largest containerdisk layer to push, in bytes
    pub max_layer_size: u64,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}

impl Cli {
    /// Validate flags and environment into [`Settings`]
    ///
    /// The export namespace is `VM_NAMESPACE` if set, else the source
    /// namespace flag, else the pod namespace.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let identity = PodIdentity::from_lookup(|key| match key {
            POD_NAME_ENV => self.pod_name.clone(),
            POD_NAMESPACE_ENV => self.pod_namespace.clone(),
            _ => None,
        })?;

        let namespace = non_empty(&self.vm_namespace)
            .or_else(|| non_empty(&self.export_source_namespace))
            .unwrap_or_else(|| identity.namespace.clone());

        ensure!(
            !self.export_source_name.is_empty(),
            "--export-source-name must not be empty"
        );
        ensure!(!self.volume_name.is_empty(), "--volumename must not be empty");
        ensure!(
            !self.image_destination.is_empty(),
            "--imagedestination must not be empty"
        );
        ensure!(
            self.poll_interval_secs > 0,
            "--poll-interval-secs must be greater than zero"
        );

        let push_timeout_secs = self
            .push_timeout_minutes
            .checked_mul(SECS_PER_MINUTE)
            .with_context(|| format!("--pushtimeout {} is too large", self.push_timeout_minutes))?;
        let max_layer_size = self
            .max_layer_size_mib
            .checked_mul(BYTES_PER_MIB)
            .with_context(|| {
                format!("--max-layer-size-mib {} is too large", self.max_layer_size_mib)
            })?;

        let source = ExportSource::new(&self.export_source_kind, namespace, &self.export_source_name)?;

        Ok(Settings {
            identity,
            pipeline: PipelineConfig {
                source,
                volume_name: self.volume_name.clone(),
                image_destination: self.image_destination.clone(),
                push_timeout: Duration::from_secs(push_timeout_secs),
                poll: PollConfig::new(
                    Duration::from_secs(self.poll_interval_secs),
                    Duration::from_secs(self.ready_timeout_secs),
                ),
                scratch_dir: self.scratch_dir.clone(),
                enable_virt_sysprep: self.enable_virt_sysprep,
            },
            credentials: RegistryCredentials::from_values(
                self.registry_username.clone(),
                self.registry_password.clone(),
            ),
            max_layer_size,
        })
    }

    /// Run the export-and-upload pipeline once
    pub async fn run(self) -> anyhow::Result<()> {
        let settings = self.settings()?;
        let source = &settings.pipeline.source;
        info!(
            pod = %settings.identity.name,
            pod_namespace = %settings.identity.namespace,
            source_kind = %source.kind,
            namespace = %source.namespace,
            name = %source.name,
            "Starting kubevirt-disk-uploader"
        );

        let client = create_client(self.kubeconfig.as_deref()).await?;
        let pipeline = ExportPipeline::new(
            Arc::new(KubeClusterClient::new(client)),
            settings.identity,
            Arc::new(NbdkitTransfer::default()),
            Arc::new(
                ContainerDiskPublisher::new(settings.credentials)
                    .with_max_layer_size(settings.max_layer_size),
            ),
        );

        pipeline.run(&settings.pipeline).await.with_context(|| {
            format!(
                "failed to upload disk of {} {}/{}",
                settings.pipeline.source.kind.kind(),
                settings.pipeline.source.namespace,
                settings.pipeline.source.name
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::parser::ValueSource;
    use clap::{CommandFactory, FromArgMatches};
    use disk_uploader_common::Error;
    use disk_uploader_image::DEFAULT_MAX_LAYER_SIZE;
    use disk_uploader_export::ExportSourceKind;

    const REQUIRED: &[&str] = &[
        "kubevirt-disk-uploader",
        "--pod-name",
        "uploader-1",
        "--pod-namespace",
        "pods",
        "--vmname",
        "fedora",
        "--volumename",
        "rootdisk",
        "--imagedestination",
        "quay.io/example/fedora:latest",
    ];

    /// Parse flags, ignoring anything clap picked up from the environment
    fn parse(extra: &[&str]) -> Cli {
        let args: Vec<&str> = REQUIRED.iter().chain(extra.iter()).copied().collect();
        let matches = Cli::command().try_get_matches_from(args).unwrap();
        let mut cli = Cli::from_arg_matches(&matches).unwrap();

        let from_env = |id: &str| matches.value_source(id) == Some(ValueSource::EnvVariable);
        if from_env("vm_namespace") {
            cli.vm_namespace = None;
        }
        if from_env("registry_username") {
            cli.registry_username = None;
        }
        if from_env("registry_password") {
            cli.registry_password = None;
        }
        cli
    }

    #[test]
    fn defaults() {
        let cli = parse(&[]);
        let settings = cli.settings().unwrap();
        let p = &settings.pipeline;

        assert_eq!(settings.identity, PodIdentity::new("uploader-1", "pods"));
        assert_eq!(p.source.kind, ExportSourceKind::VirtualMachine);
        assert_eq!(p.source.name, "fedora");
        assert_eq!(p.volume_name, "rootdisk");
        assert_eq!(p.push_timeout, Duration::from_secs(3600));
        assert_eq!(p.poll, PollConfig::default());
        assert_eq!(p.scratch_dir, PathBuf::from("./tmp"));
        assert!(!p.enable_virt_sysprep);
        assert_eq!(cli.log_format, LogFormat::Text);
        assert_eq!(settings.max_layer_size, DEFAULT_MAX_LAYER_SIZE);
    }

    #[test]
    fn export_namespace_precedence() {
        // pod namespace when nothing else is given
        assert_eq!(parse(&[]).settings().unwrap().pipeline.source.namespace, "pods");

        let flag = parse(&["--vmnamespace", "vms"]);
        assert_eq!(flag.settings().unwrap().pipeline.source.namespace, "vms");

        let overridden = parse(&["--vmnamespace", "vms", "--vm-namespace", "override"]);
        assert_eq!(overridden.settings().unwrap().pipeline.source.namespace, "override");

        let empty_override = parse(&["--vmnamespace", "vms", "--vm-namespace", ""]);
        assert_eq!(empty_override.settings().unwrap().pipeline.source.namespace, "vms");
    }

    #[test]
    fn long_flag_names_match_aliases() {
        let cli = parse(&["--export-source-kind", "pvc", "--export-source-namespace", "data"]);
        let source = cli.settings().unwrap().pipeline.source;
        assert_eq!(source.kind, ExportSourceKind::PersistentVolumeClaim);
        assert_eq!(source.namespace, "data");
    }

    #[test]
    fn sysprep_flag_forms() {
        assert!(parse(&["--enablevirtsysprep"]).enable_virt_sysprep);
        assert!(parse(&["--enablevirtsysprep", "true"]).enable_virt_sysprep);
        assert!(!parse(&["--enablevirtsysprep=false"]).enable_virt_sysprep);
    }

    #[test]
    fn timeouts_from_flags() {
        let cli = parse(&[
            "--pushtimeout",
            "5",
            "--poll-interval-secs",
            "2",
            "--ready-timeout-secs",
            "30",
        ]);
        let p = cli.settings().unwrap().pipeline;
        assert_eq!(p.push_timeout, Duration::from_secs(300));
        assert_eq!(p.poll, PollConfig::new(Duration::from_secs(2), Duration::from_secs(30)));
    }

    #[test]
    fn oversized_durations_and_sizes_rejected() {
        let max = u64::MAX.to_string();
        let err = parse(&["--pushtimeout", max.as_str()]).settings().unwrap_err();
        assert!(err.to_string().contains("--pushtimeout"), "{}", err);

        let err = parse(&["--max-layer-size-mib", max.as_str()]).settings().unwrap_err();
        assert!(err.to_string().contains("--max-layer-size-mib"), "{}", err);

        let largest = (u64::MAX / 60).to_string();
        let p = parse(&["--pushtimeout", largest.as_str()]).settings().unwrap().pipeline;
        assert_eq!(p.push_timeout, Duration::from_secs(u64::MAX / 60 * 60));
    }

    #[test]
    fn layer_limit_from_flag() {
        let settings = parse(&["--max-layer-size-mib", "16"]).settings().unwrap();
        assert_eq!(settings.max_layer_size, 16 * 1024 * 1024);
    }

    #[test]
    fn unknown_source_kind_rejected() {
        let err = parse(&["--export-source-kind", "vmi"]).settings().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::InvalidSourceKind { kind }) if kind == "vmi"
        ));
    }

    #[test]
    fn empty_pod_name_rejected() {
        let mut cli = parse(&[]);
        cli.pod_name = Some(String::new());
        let err = cli.settings().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::Environment { variable }) if variable == POD_NAME_ENV
        ));
    }

    #[test]
    fn zero_poll_interval_rejected() {
        assert!(parse(&["--poll-interval-secs", "0"]).settings().is_err());
    }

    #[test]
    fn registry_credentials_need_both_values() {
        let mut cli = parse(&[]);
        cli.registry_username = Some("user".to_string());
        cli.registry_password = None;
        assert!(cli.settings().unwrap().credentials.is_anonymous());

        let basic = parse(&["--registry-username", "user", "--registry-password", "pass"])
            .settings()
            .unwrap();
        assert!(!basic.credentials.is_anonymous());
    }

    #[test]
    fn missing_required_flags_fail_to_parse() {
        assert!(Cli::try_parse_from(["kubevirt-disk-uploader", "--vmname", "fedora"]).is_err());
    }

    #[test]
    fn log_format_parses() {
        assert_eq!(parse(&["--log-format", "json"]).log_format, LogFormat::Json);
        let args: Vec<&str> = REQUIRED.iter().copied().chain(["--log-format", "xml"]).collect();
        assert!(Cli::try_parse_from(args).is_err());
    }
}
