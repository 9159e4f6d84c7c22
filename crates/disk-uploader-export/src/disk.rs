//! Disk materialization through external tools
//!
//! The raw disk is streamed by `nbdkit` (curl plugin, read-only) and
//! converted to qcow2 by `qemu-img` running under `nbdkit --run`. The
//! optional `virt-sysprep` pass resets machine-specific state in the result.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use disk_uploader_common::{Error, Result};

/// Format the downloaded disk is converted to
pub const OUTPUT_FORMAT: &str = "qcow2";

/// Streams an exported disk into a local file and prepares it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiskTransfer: Send + Sync {
    /// Download `url` into `output_path` as qcow2
    ///
    /// The request carries `header_name: token` and trusts `cert_path`.
    /// On success the output exists and is non-empty.
    async fn download(
        &self,
        url: &str,
        header_name: &str,
        token: &str,
        cert_path: &Path,
        output_path: &Path,
    ) -> Result<()>;

    /// Run virt-sysprep against a qcow2 disk in place
    async fn sysprep(&self, disk_path: &Path) -> Result<()>;
}

/// [`DiskTransfer`] backed by nbdkit, qemu-img and virt-sysprep
#[derive(Clone, Debug)]
pub struct NbdkitTransfer {
    nbdkit: String,
    qemu_img: String,
    virt_sysprep: String,
}

impl Default for NbdkitTransfer {
    fn default() -> Self {
        Self {
            nbdkit: "nbdkit".to_string(),
            qemu_img: "qemu-img".to_string(),
            virt_sysprep: "virt-sysprep".to_string(),
        }
    }
}

impl NbdkitTransfer {
    /// Use explicit program names or paths instead of looking them up in PATH
    pub fn with_programs(
        nbdkit: impl Into<String>,
        qemu_img: impl Into<String>,
        virt_sysprep: impl Into<String>,
    ) -> Self {
        Self {
            nbdkit: nbdkit.into(),
            qemu_img: qemu_img.into(),
            virt_sysprep: virt_sysprep.into(),
        }
    }

    /// Arguments passed to nbdkit for one download
    ///
    /// `$uri` is expanded by nbdkit to the NBD URI of the served disk.
    pub fn nbdkit_args(
        &self,
        url: &str,
        header_name: &str,
        token: &str,
        cert_path: &Path,
        output_path: &Path,
    ) -> Vec<String> {
        vec![
            "-r".to_string(),
            "curl".to_string(),
            url.to_string(),
            format!("header={}: {}", header_name, token),
            format!("cainfo={}", cert_path.display()),
            "--run".to_string(),
            format!(
                "{} convert \"$uri\" -O {} {}",
                self.qemu_img,
                OUTPUT_FORMAT,
                shell_quote(&output_path.display().to_string())
            ),
        ]
    }
}

/// Single-quote `value` for `sh -c`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Run a command to completion, mapping spawn failures and non-zero exits
async fn run_command(cmd: &mut Command, program: &str) -> Result<()> {
    let output = cmd.output().await.map_err(|e| {
        warn!(program = %program, error = %e, "Failed to spawn command");
        Error::command(program, format!("failed to execute: {}", e))
    })?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        warn!(program = %program, status = %output.status, stderr = %stderr, "Command failed");
        Err(Error::command(
            program,
            format!("{}: {}", output.status, stderr),
        ))
    }
}

/// Fail unless `path` exists and is non-empty
pub fn verify_output(path: &Path) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(Error::EmptyOutput {
            path: path.to_path_buf(),
        }),
    }
}

/// Delete a previous run's output so a failed download cannot leave it behind
fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl DiskTransfer for NbdkitTransfer {
    async fn download(
        &self,
        url: &str,
        header_name: &str,
        token: &str,
        cert_path: &Path,
        output_path: &Path,
    ) -> Result<()> {
        ensure_parent_dir(output_path)?;
        remove_stale(output_path)?;

        info!(url = %url, output = %output_path.display(), "Downloading disk image");
        let mut cmd = Command::new(&self.nbdkit);
        cmd.args(self.nbdkit_args(url, header_name, token, cert_path, output_path));

        let status = run_command(&mut cmd, &self.nbdkit).await;

        // A missing or empty image is the failure that matters, whatever the exit status
        verify_output(output_path)?;
        status?;

        info!(output = %output_path.display(), "Downloaded disk image");
        Ok(())
    }

    async fn sysprep(&self, disk_path: &Path) -> Result<()> {
        info!(disk = %disk_path.display(), "Preparing disk image with virt-sysprep");
        let mut cmd = Command::new(&self.virt_sysprep);
        cmd.env("LIBGUESTFS_BACKEND", "direct")
            .arg("--format")
            .arg(OUTPUT_FORMAT)
            .arg("-a")
            .arg(disk_path);
        run_command(&mut cmd, &self.virt_sysprep).await?;
        info!(disk = %disk_path.display(), "Disk image prepared");
        Ok(())
    }
}

/// Write the export server certificate where nbdkit's `cainfo` can read it
///
/// Creates the parent directory, truncates any previous file and sets mode
/// 0644 on unix.
pub fn write_certificate_file(path: &Path, pem: &str) -> Result<PathBuf> {
    ensure_parent_dir(path)?;
    std::fs::write(path, pem).map_err(|e| Error::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
            .map_err(|e| Error::io(path, e))?;
    }

    Ok(path.to_path_buf())
}
