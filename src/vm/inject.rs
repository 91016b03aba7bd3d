//! Offline configuration injection into a VHDX image.
//!
//! Before a cloned VM boots, its runner configuration is written into the
//! image at `<drive>:\runner-config.json`:
//!
//! ```text
//! Mount-VHD ─► pick largest Basic partition (assign a drive letter
//!              if needed) ─► copy host temp JSON ─► verify ─► Dismount-VHD
//! ```
//!
//! The dismount runs on every path once the mount succeeded; a VHDX left
//! mounted on the host cannot be booted by the VM.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::powershell::{PowerShell, PsError};
use super::RunnerConfig;

/// Marker line the mount script prints once a drive letter is secured.
const DRIVE_LETTER_MARKER: &str = "DRIVE_LETTER:";

/// Sentinel the copy script prints after the read-back verification passed.
const SUCCESS_SENTINEL: &str = "SUCCESS";

/// Message the mount script throws when no Basic partition exists; used to
/// tell "image has no usable partition" apart from other mount failures.
const NO_PARTITION_MARKER: &str = "No suitable partition found on disk";

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("failed to mount {vhdx_path}")]
    Mount {
        vhdx_path: String,
        #[source]
        source: PsError,
    },
    #[error("no mountable basic partition in {vhdx_path}")]
    NoPartition { vhdx_path: String },
    #[error("failed to extract drive letter from mount output: {output}")]
    DriveLetter { output: String },
    #[error("failed to serialize runner config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write temp config file {path}: {source}")]
    TempFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to copy config into image")]
    Copy(#[source] PsError),
    #[error("config copy verification failed: {output}")]
    VerifyFailed { output: String },
}

/// Write `config` to `runner-config.json` on the main partition of the
/// offline image at `vhdx_path`, then release the mount.
pub(crate) async fn inject_runner_config(
    ps: &PowerShell,
    vhdx_path: &str,
    config: &RunnerConfig,
) -> Result<(), InjectError> {
    debug!(vhdx_path, "starting config injection");

    let mount_output = ps.run(&build_mount_script(vhdx_path)).await.map_err(|source| {
        if matches!(&source, PsError::Failed { output, .. } if output.contains(NO_PARTITION_MARKER)) {
            InjectError::NoPartition {
                vhdx_path: vhdx_path.to_string(),
            }
        } else {
            InjectError::Mount {
                vhdx_path: vhdx_path.to_string(),
                source,
            }
        }
    })?;
    debug!(output = %mount_output, "mount output");

    let drive_letter = parse_drive_letter(&mount_output).ok_or_else(|| InjectError::DriveLetter {
        output: mount_output.clone(),
    })?;
    info!(drive_letter = %drive_letter, "VHDX mounted successfully");

    // The image is mounted from here on: run the fallible copy, then always
    // dismount before reporting its outcome.
    let copy_result = copy_and_verify(ps, &drive_letter, config).await;

    let dismount = format!(r#"Dismount-VHD -Path "{vhdx_path}""#);
    match ps.run(&dismount).await {
        Ok(_) => debug!(vhdx_path, "VHDX unmounted successfully"),
        Err(e) => warn!(vhdx_path, error = %e, "failed to unmount VHDX"),
    }

    copy_result?;
    info!(vhdx_path, destination = %format!(r"{drive_letter}:\runner-config.json"), "config injected and verified");
    Ok(())
}

async fn copy_and_verify(
    ps: &PowerShell,
    drive_letter: &str,
    config: &RunnerConfig,
) -> Result<(), InjectError> {
    let config_json = serde_json::to_vec(config)?;
    debug!(size_bytes = config_json.len(), "config JSON created");

    // Per-slot temp file name: parallel creations must not race on a shared
    // scratch path.
    let temp_path = std::env::temp_dir().join(format!("runner-config-{}.json", config.name));
    tokio::fs::write(&temp_path, &config_json)
        .await
        .map_err(|source| InjectError::TempFile {
            path: temp_path.clone(),
            source,
        })?;
    debug!(path = %temp_path.display(), "temp config file created");

    let dest = format!(r"{drive_letter}:\runner-config.json");
    let script = build_copy_script(&temp_path.to_string_lossy(), &dest);
    let result = ps.run(&script).await;

    let _ = tokio::fs::remove_file(&temp_path).await;

    let output = result.map_err(InjectError::Copy)?;
    debug!(output = %output, "copy operation output");

    if !output.contains(SUCCESS_SENTINEL) {
        return Err(InjectError::VerifyFailed { output });
    }
    Ok(())
}

/// Mount the image, enumerate partitions, and print `DRIVE_LETTER:<X>` for
/// the selected partition: the largest Basic partition that already has a
/// drive letter, else the largest Basic partition after assigning one.
fn build_mount_script(vhdx_path: &str) -> String {
    format!(
        r#"
$ErrorActionPreference = "Stop"
$disk = Mount-VHD -Path "{vhdx_path}" -Passthru
$diskNumber = $disk.Number
Write-Output "DiskNumber: $diskNumber"

$partitions = Get-Partition -DiskNumber $diskNumber
Write-Output "Partitions found: $($partitions.Count)"
$partitions | ForEach-Object {{
    Write-Output "  Partition $($_.PartitionNumber): Type=$($_.Type), Size=$($_.Size), DriveLetter=$($_.DriveLetter)"
}}

$partition = $partitions | Where-Object {{ $_.Type -eq 'Basic' -and $_.DriveLetter }} | Select-Object -First 1

if (-not $partition) {{
    $partition = $partitions | Where-Object {{ $_.Type -eq 'Basic' }} | Sort-Object Size -Descending | Select-Object -First 1
    if ($partition -and -not $partition.DriveLetter) {{
        Write-Output "Assigning drive letter to partition $($partition.PartitionNumber)..."
        $partition | Add-PartitionAccessPath -AssignDriveLetter
        $partition = Get-Partition -DiskNumber $diskNumber -PartitionNumber $partition.PartitionNumber
    }}
}}

if (-not $partition) {{
    throw "{NO_PARTITION_MARKER}"
}}

$driveLetter = $partition.DriveLetter
if (-not $driveLetter) {{
    throw "Failed to get drive letter for partition"
}}

Write-Output "{DRIVE_LETTER_MARKER}$driveLetter"
"#
    )
}

/// Copy the temp config onto the mounted image and read it back: existence,
/// size and a content preview, then the `SUCCESS` sentinel.
fn build_copy_script(source: &str, dest: &str) -> String {
    format!(
        r#"
$ErrorActionPreference = "Stop"
$source = "{source}"
$dest = "{dest}"

Write-Output "Copying from: $source"
Write-Output "Copying to: $dest"

if (-not (Test-Path $source)) {{
    throw "Source file not found: $source"
}}

Copy-Item -Path $source -Destination $dest -Force

if (-not (Test-Path $dest)) {{
    throw "Copy failed - destination file not found: $dest"
}}

$copiedSize = (Get-Item $dest).Length
Write-Output "File copied successfully. Size: $copiedSize bytes"

$content = Get-Content $dest -Raw
Write-Output "Content preview: $($content.Substring(0, [Math]::Min(100, $content.Length)))..."

Write-Output "{SUCCESS_SENTINEL}"
"#
    )
}

fn parse_drive_letter(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix(DRIVE_LETTER_MARKER))
        .map(|letter| letter.trim().to_string())
        .filter(|letter| !letter.is_empty())
}
