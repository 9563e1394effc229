use std::path::Path;

use crate::error::RangeError;

/// Create a qcow2 overlay backed by the given base image.
pub async fn create_overlay(base_image: &Path, overlay_path: &Path) -> Result<(), RangeError> {
    if let Some(parent) = overlay_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RangeError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let output = tokio::process::Command::new("qemu-img")
        .args(["create", "-f", "qcow2", "-b"])
        .arg(base_image)
        .args(["-F", "qcow2"])
        .arg(overlay_path)
        .output()
        .await
        .map_err(|e| RangeError::Io {
            context: "running qemu-img".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(RangeError::ExternalCommand {
            command: "qemu-img".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    tracing::info!(path = %overlay_path.display(), "created qcow2 overlay");
    Ok(())
}

/// Grows an existing qcow2 overlay up to `disk_size` (a guest's
/// `CreateGuestSpec::disk_size`) — a no-op when the overlay's backing
/// base image is already at least that size, since `qemu-img resize`
/// accepts a target equal to or above the current virtual size.
pub async fn resize_overlay(overlay_path: &Path, disk_size: &str) -> Result<(), RangeError> {
    let output = tokio::process::Command::new("qemu-img")
        .arg("resize")
        .arg(overlay_path)
        .arg(disk_size)
        .output()
        .await
        .map_err(|e| RangeError::Io {
            context: "running qemu-img resize".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(RangeError::ExternalCommand {
            command: "qemu-img resize".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    tracing::info!(path = %overlay_path.display(), disk_size, "resized qcow2 overlay");
    Ok(())
}
