use std::path::{Path, PathBuf};

/// Base image cache directory: `~/.cache/cyris/images/`
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("cyris")
        .join("images")
}

/// `<cyber_range_dir>/<range_id>/`
pub fn range_dir(cyber_range_dir: &Path, range_id: &str) -> PathBuf {
    cyber_range_dir.join(range_id)
}

/// `<cyber_range_dir>/<range_id>/disks/`
pub fn disks_dir(cyber_range_dir: &Path, range_id: &str) -> PathBuf {
    range_dir(cyber_range_dir, range_id).join("disks")
}

/// `<cyber_range_dir>/<range_id>/disks/<domain_name>.qcow2`
pub fn overlay_path(cyber_range_dir: &Path, range_id: &str, domain_name: &str) -> PathBuf {
    disks_dir(cyber_range_dir, range_id).join(format!("{domain_name}.qcow2"))
}

/// `<cyber_range_dir>/<range_id>/logs/`
pub fn logs_dir(cyber_range_dir: &Path, range_id: &str) -> PathBuf {
    range_dir(cyber_range_dir, range_id).join("logs")
}

/// `<cyber_range_dir>/<range_id>/disks/<domain_name>-seed.iso`
pub fn seed_path(cyber_range_dir: &Path, range_id: &str, domain_name: &str) -> PathBuf {
    disks_dir(cyber_range_dir, range_id).join(format!("{domain_name}-seed.iso"))
}

/// `<cyber_range_dir>/ranges_metadata.json`
pub fn metadata_file(cyber_range_dir: &Path) -> PathBuf {
    cyber_range_dir.join("ranges_metadata.json")
}

/// `<cyber_range_dir>/ranges_resources.json`
pub fn resources_file(cyber_range_dir: &Path) -> PathBuf {
    cyber_range_dir.join("ranges_resources.json")
}

/// `<cyber_range_dir>/operator_key` — the auto-generated Ed25519 keypair
/// (+ `.pub`) seeded into every guest's cloud-init so the SSH Pool can
/// reach it without depending on a per-guest `root_passwd`.
pub fn operator_key_path(cyber_range_dir: &Path) -> PathBuf {
    cyber_range_dir.join("operator_key")
}
