//! Containerdisk image layout
//!
//! A containerdisk is a scratch image with a single layer holding the disk
//! under `disk/`. KubeVirt's virt-launcher runs qemu as uid/gid 107, so the
//! directory and file are owned by that user and read-only.
//!
//! The layer is streamed to a file next to the disk and hashed as it is
//! written, so building never holds the disk in memory.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use oci_distribution::client::Config;
use oci_distribution::manifest::IMAGE_CONFIG_MEDIA_TYPE;
use sha2::{Digest, Sha256};
use tracing::debug;

use disk_uploader_common::{Error, Result};

/// Directory inside the image holding the disk
pub const DISK_DIR: &str = "disk/";

/// Owner of the disk directory and file (qemu in virt-launcher)
pub const QEMU_UID: u64 = 107;

/// Mode of the disk directory
pub const DISK_DIR_MODE: u32 = 0o555;

/// Mode of the disk file
pub const DISK_FILE_MODE: u32 = 0o440;

/// Suffix appended to the disk file name for its layer file
pub const LAYER_FILE_SUFFIX: &str = ".layer.tar";

/// Uncompressed tar layer written to disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerFile {
    /// Where the layer was written
    pub path: PathBuf,
    /// Layer size in bytes
    pub size: u64,
    /// `sha256:<hex>` digest of the layer
    pub diff_id: String,
}

/// Layer file and the config referencing it
pub struct ContainerDisk {
    /// The single uncompressed tar layer
    pub layer: LayerFile,
    /// Image config whose rootfs is the layer
    pub config: Config,
}

/// Writer that hashes and counts everything passed through it
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_uid(QEMU_UID);
    header.set_gid(QEMU_UID);
    header.set_mtime(0);
    header.set_size(size);
    header
}

fn disk_file_name(disk_path: &Path) -> Result<&str> {
    disk_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            Error::image(
                disk_path.display().to_string(),
                "disk path has no file name",
            )
        })
}

/// Path of the layer file built for `disk_path`
pub fn layer_path(disk_path: &Path) -> Result<PathBuf> {
    let file_name = disk_file_name(disk_path)?;
    Ok(disk_path.with_file_name(format!("{}{}", file_name, LAYER_FILE_SUFFIX)))
}

/// Stream the uncompressed tar layer for `disk_path` into `layer_path`
///
/// An existing file at `layer_path` is replaced.
pub fn write_layer(disk_path: &Path, layer_path: &Path) -> Result<LayerFile> {
    let file_name = disk_file_name(disk_path)?;

    let mut disk = File::open(disk_path).map_err(|e| Error::io(disk_path, e))?;
    let size = disk
        .metadata()
        .map_err(|e| Error::io(disk_path, e))?
        .len();

    let out = File::create(layer_path).map_err(|e| Error::io(layer_path, e))?;
    let mut builder = tar::Builder::new(HashingWriter::new(BufWriter::new(out)));

    let mut dir = header(tar::EntryType::Directory, DISK_DIR_MODE, 0);
    builder
        .append_data(&mut dir, DISK_DIR, io::empty())
        .map_err(|e| Error::io(layer_path, e))?;

    let mut file = header(tar::EntryType::Regular, DISK_FILE_MODE, size);
    builder
        .append_data(&mut file, format!("{}{}", DISK_DIR, file_name), &mut disk)
        .map_err(|e| Error::io(layer_path, e))?;

    let mut writer = builder.into_inner().map_err(|e| Error::io(layer_path, e))?;
    writer.flush().map_err(|e| Error::io(layer_path, e))?;

    Ok(LayerFile {
        path: layer_path.to_path_buf(),
        size: writer.written,
        diff_id: format!("sha256:{}", hex::encode(writer.hasher.finalize())),
    })
}

/// Minimal linux/amd64 image config whose rootfs is the given layer
pub fn image_config(diff_id: &str) -> serde_json::Value {
    serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {},
        "rootfs": {
            "type": "layers",
            "diff_ids": [diff_id],
        },
    })
}

/// Package `disk_path` as a containerdisk, writing the layer beside it
pub fn build_container_disk(disk_path: &Path) -> Result<ContainerDisk> {
    let layer = write_layer(disk_path, &layer_path(disk_path)?)?;
    let config = serde_json::to_vec(&image_config(&layer.diff_id))?;

    debug!(
        disk = %disk_path.display(),
        layer = %layer.path.display(),
        layer_size = layer.size,
        diff_id = %layer.diff_id,
        "Built containerdisk layer"
    );

    Ok(ContainerDisk {
        layer,
        config: Config::new(config, IMAGE_CONFIG_MEDIA_TYPE.to_string(), None),
    })
}
