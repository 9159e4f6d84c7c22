//! kubevirt-disk-uploader
//!
//! Exports a KubeVirt disk and pushes it to a registry as a containerdisk.

use clap::Parser;
use tracing::error;

use disk_uploader_cli::Cli;
use disk_uploader_common::telemetry::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    if let Err(e) = cli.run().await {
        error!(error = %format!("{:#}", e), "Disk upload failed");
        return Err(e);
    }
    Ok(())
}
