use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::error::RangeError;

/// Download a response body to a file, updating the progress bar as chunks arrive.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), RangeError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| RangeError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| RangeError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| RangeError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| RangeError::Io {
        context: "flushing image file".into(),
        source: e,
    })?;

    Ok(())
}

/// Converts a freshly downloaded image to qcow2 and resizes it up to
/// `floor_size`, the same `qemu-img convert` + `qemu-img resize` sequence
/// the disk overlay builder already uses for per-guest overlays.
async fn convert_and_resize(tmp_path: &Path, dest: &Path, floor_size: &str) -> Result<(), RangeError> {
    let convert = tokio::process::Command::new("qemu-img")
        .args(["convert", "-f", "qcow2", "-O", "qcow2"])
        .arg(tmp_path)
        .arg(dest)
        .output()
        .await
        .map_err(|e| RangeError::Io {
            context: "running qemu-img convert".into(),
            source: e,
        })?;
    if !convert.status.success() {
        return Err(RangeError::ExternalCommand {
            command: "qemu-img convert".into(),
            message: String::from_utf8_lossy(&convert.stderr).into_owned(),
        });
    }

    let resize = tokio::process::Command::new("qemu-img")
        .arg("resize")
        .arg(dest)
        .arg(floor_size)
        .output()
        .await
        .map_err(|e| RangeError::Io {
            context: "running qemu-img resize".into(),
            source: e,
        })?;
    if !resize.status.success() {
        return Err(RangeError::ExternalCommand {
            command: "qemu-img resize".into(),
            message: String::from_utf8_lossy(&resize.stderr).into_owned(),
        });
    }

    tracing::info!(path = %dest.display(), floor = floor_size, "converted and resized base image");
    Ok(())
}

/// Ensure the base image is available locally, downloading if needed.
/// A freshly downloaded image is converted to qcow2 and resized up to
/// `floor_size` (spec.md §4.3 step 2) before being cached; a pre-existing
/// local path is trusted as-is. Returns the path to the cached image file.
pub async fn ensure_base_image(base: &str, cache_dir: &Path, floor_size: &str) -> Result<PathBuf, RangeError> {
    if !base.starts_with("http://") && !base.starts_with("https://") {
        let path = PathBuf::from(base);
        if !path.exists() {
            return Err(RangeError::Io {
                context: format!("base image not found: {}", path.display()),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }
        return Ok(path);
    }

    let filename = base.rsplit('/').next().unwrap_or("image.img");

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| RangeError::Io {
            context: format!("creating cache dir {}", cache_dir.display()),
            source: e,
        })?;

    let dest = cache_dir.join(filename);
    if dest.exists() {
        tracing::info!(path = %dest.display(), "using cached base image");
        return Ok(dest);
    }

    tracing::info!(url = %base, "downloading base image");

    let response = reqwest::get(base)
        .await
        .map_err(|e| RangeError::ImageDownload {
            message: format!("request to {base} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(RangeError::ImageDownload {
            message: format!("HTTP {} from {base}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let total_size = response.content_length().unwrap_or(0);

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let tmp_path = dest.with_extension("part");

    // Remove any stale .part file from a previous failed download
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        // Clean up the .part file on failure
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    if let Err(e) = convert_and_resize(&tmp_path, &dest, floor_size).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    let _ = tokio::fs::remove_file(&tmp_path).await;

    pb.finish_with_message("download complete");
    tracing::info!(path = %dest.display(), "base image cached");

    Ok(dest)
}
