//! Remove flow: drops a range's registry entry and on-disk
//! directory entirely. DESTROYED/ERROR ranges are removed unconditionally;
//! ACTIVE/CREATING/STOPPED ranges require `force`, which destroys the
//! range first.

use crate::error::RangeError;
use crate::orchestrator::flows::destroy::{self, DestroyContext};
use crate::orchestrator::state;
use crate::paths;
use crate::registry::Registry;

pub async fn run(
    destroy_ctx: &DestroyContext<'_>,
    registry: &Registry,
    cyber_range_dir: &std::path::Path,
    range_id: &str,
    force: bool,
) -> Result<(), RangeError> {
    let metadata = registry.get_metadata(range_id).ok_or_else(|| RangeError::RangeNotFound {
        range_id: range_id.to_string(),
    })?;

    if !state::remove_allowed(metadata.status, force) {
        return Err(RangeError::NotTerminal {
            range_id: range_id.to_string(),
            status: metadata.status.to_string(),
        });
    }

    if !metadata.status.is_terminal() {
        destroy::run(destroy_ctx, range_id, true).await?;
    }

    registry.remove(range_id)?;

    let range_dir = paths::range_dir(cyber_range_dir, range_id);
    if range_dir.exists() {
        tokio::fs::remove_dir_all(&range_dir).await.map_err(|e| RangeError::Io {
            context: format!("removing {}", range_dir.display()),
            source: e,
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RangeStatus;

    #[test]
    fn remove_requires_force_from_active() {
        assert!(!state::remove_allowed(RangeStatus::Active, false));
        assert!(state::remove_allowed(RangeStatus::Active, true));
    }

    #[test]
    fn remove_allowed_unconditionally_from_destroyed() {
        assert!(state::remove_allowed(RangeStatus::Destroyed, false));
    }
}
