//! Filesystem ACLs for `qemu:///system` overlays: the
//! libvirt-qemu user needs traverse+read access to range directories it
//! does not own. Session-scoped URIs run as the calling user and skip
//! this entirely.

use std::path::Path;

use crate::error::RangeError;

/// Grants the `libvirt-qemu` user execute-traversal on every ancestor
/// directory up to `range_dir`, and read on the overlay file itself, via
/// `setfacl`. Only called when the hypervisor URI implies system-wide
/// libvirt.
pub async fn grant_system_access(range_dir: &Path, overlay_path: &Path) -> Result<(), RangeError> {
    setfacl(&["-m", "u:libvirt-qemu:--x", &path_str(range_dir)]).await?;
    if let Some(disks_dir) = overlay_path.parent() {
        setfacl(&["-m", "u:libvirt-qemu:--x", &path_str(disks_dir)]).await?;
    }
    setfacl(&["-m", "u:libvirt-qemu:r--", &path_str(overlay_path)]).await?;
    Ok(())
}

fn path_str(p: &Path) -> String {
    p.display().to_string()
}

async fn setfacl(args: &[&str]) -> Result<(), RangeError> {
    let output = tokio::process::Command::new("setfacl")
        .args(args)
        .output()
        .await
        .map_err(|e| RangeError::Io {
            context: "running setfacl".into(),
            source: e,
        })?;

    if !output.status.success() {
        return Err(RangeError::ExternalCommand {
            command: "setfacl".into(),
            message: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Whether a libvirt URI implies system-wide (as opposed to session-scoped)
/// connections — this also gates whether the domain renderer may attach
/// guests to the default libvirt network instead of user-mode NAT.
pub fn is_system_uri(uri: &str) -> bool {
    uri.contains("qemu:///system")
}

/// Grants the `libvirt-qemu` user traversal on `dir` itself plus a default
/// ACL so files and subdirectories created under it inherit the grant —
/// the one-time setup step `grant_system_access` assumes has already run
/// for `cyber_range_dir` before any range is created under it.
pub async fn grant_directory_traversal(dir: &Path) -> Result<(), RangeError> {
    let dir_str = path_str(dir);
    setfacl(&["-m", "u:libvirt-qemu:--x", &dir_str]).await?;
    setfacl(&["-d", "-m", "u:libvirt-qemu:--x", &dir_str]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_system_uri() {
        assert!(is_system_uri("qemu:///system"));
        assert!(!is_system_uri("qemu:///session"));
        assert!(!is_system_uri("qemu+ssh://host/system"));
    }
}
