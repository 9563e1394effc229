//! Range Orchestrator: the long-lived handle the CLI holds for one
//! process invocation. Wires the registry, KVM provider, gateway service,
//! and SSH pool together and exposes the handful of operations the CLI
//! dispatches into; the actual step sequences live in `flows/`, and the
//! pure status-transition table lives in `state.rs`.

pub mod flows;
pub mod safe;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::NetworkModeArg;
use crate::config::EnvSettings;
use crate::error::RangeError;
use crate::gateway::{GatewayService, GatewaySettings};
use crate::model::{Description, RangeMetadata, RangeStatus};
use crate::provider::kvm::KvmProvider;
use crate::provider::{Provider, ResourceStatus};
use crate::registry::Registry;
use crate::ssh::SshPool;

use flows::create::{CreateContext, CreateOutcome};
use flows::destroy::{DestroyContext, DestroyOutcome};

const SSH_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One guest's SSH reachability, as recorded in the registry after create.
pub struct GuestSshInfo {
    pub guest_id: String,
    pub host: String,
    pub port: u16,
}

pub struct RangeOrchestrator {
    registry: Registry,
    provider: KvmProvider,
    gateway: GatewayService,
    ssh_pool: Arc<SshPool>,
    settings: EnvSettings,
}

impl RangeOrchestrator {
    /// Builds the orchestrator from validated settings and runs startup
    /// crash recovery before returning.
    pub async fn new(settings: EnvSettings) -> Result<Self, RangeError> {
        settings.validate()?;
        let cyber_range_dir = PathBuf::from(&settings.cyber_range_dir);
        let registry = Registry::load(&cyber_range_dir);
        let mut provider = KvmProvider::new(settings.libvirt_uri.clone(), cyber_range_dir.clone());
        if let Some(url) = settings.default_image_url.clone() {
            provider.set_default_image_url(url);
        }
        let gateway = GatewayService::new(GatewaySettings {
            enabled: settings.gw_mode,
            account: settings.gw_account.clone(),
            mgmt_addr: settings.gw_mgmt_addr.clone(),
            inside_addr: settings.gw_inside_addr.clone(),
            port_low: settings.entry_port_low,
            port_high: settings.entry_port_high,
            password_length: settings.gw_password_length,
        })?;
        let ssh_pool = Arc::new(SshPool::new(settings.ssh_pool_max_connections, SSH_IDLE_TIMEOUT));

        let orchestrator = Self {
            registry,
            provider,
            gateway,
            ssh_pool,
            settings,
        };
        orchestrator.recover_crashed_ranges().await;
        Ok(orchestrator)
    }

    fn cyber_range_dir(&self) -> PathBuf {
        PathBuf::from(&self.settings.cyber_range_dir)
    }

    /// For every non-terminal range, probes the provider for its recorded
    /// domains and downgrades the range to ERROR if any are missing.
    /// Never auto-destroys or auto-removes.
    /// Best-effort: a probe failure here is logged and otherwise ignored,
    /// since there is no caller yet to surface it to.
    async fn recover_crashed_ranges(&self) {
        for metadata in self.registry.list(true) {
            if !matches!(metadata.status, RangeStatus::Active | RangeStatus::Creating) {
                continue;
            }
            let Some(resources) = self.registry.get_resources(&metadata.range_id) else {
                continue;
            };
            if resources.domain_names.is_empty() {
                continue;
            }

            let statuses = self.provider.status(&resources.domain_names).await;
            let missing = resources
                .domain_names
                .iter()
                .any(|d| !matches!(statuses.get(d), Some(ResourceStatus::Active) | Some(ResourceStatus::Stopped) | Some(ResourceStatus::Paused)));

            if missing {
                tracing::warn!(range_id = %metadata.range_id, "domains missing on startup, marking range ERROR");
                if let Err(e) = self.registry.update_metadata(&metadata.range_id, |m| {
                    m.status = RangeStatus::Error;
                    m.last_modified = crate::logging::utc_timestamp();
                }) {
                    tracing::error!(range_id = %metadata.range_id, error = %e, "failed to persist crash-recovery status");
                }
            }
        }
    }

    fn destroy_context(&self) -> DestroyContext<'_> {
        DestroyContext {
            registry: &self.registry,
            provider: &self.provider,
            libvirt_uri: &self.settings.libvirt_uri,
            gateway: &self.gateway,
        }
    }

    pub async fn create(
        &self,
        description: &Description,
        range_id_override: Option<String>,
        dry_run: bool,
        network_mode: NetworkModeArg,
        enable_ssh: bool,
    ) -> Result<CreateOutcome, RangeError> {
        let ctx = CreateContext {
            registry: &self.registry,
            provider: &self.provider,
            settings: &self.settings,
            gateway: &self.gateway,
            ssh_pool: &self.ssh_pool,
        };
        flows::create::run(&ctx, description, range_id_override, dry_run, network_mode, enable_ssh).await
    }

    pub async fn destroy(&self, range_id: &str, force: bool) -> Result<DestroyOutcome, RangeError> {
        let ctx = self.destroy_context();
        flows::destroy::run(&ctx, range_id, force).await
    }

    pub async fn remove(&self, range_id: &str, force: bool) -> Result<(), RangeError> {
        let ctx = self.destroy_context();
        flows::remove::run(&ctx, &self.registry, &self.cyber_range_dir(), range_id, force).await
    }

    /// All known ranges, sorted by id; `include_destroyed` mirrors `--all`.
    pub fn list(&self, include_destroyed: bool) -> Vec<RangeMetadata> {
        self.registry.list(include_destroyed)
    }

    pub fn status(&self, range_id: &str) -> Result<RangeMetadata, RangeError> {
        self.registry.get_metadata(range_id).ok_or_else(|| RangeError::RangeNotFound {
            range_id: range_id.to_string(),
        })
    }

    /// Per-guest SSH connection details for `ssh-info`, derived from the
    /// addresses the create flow recorded.
    pub fn ssh_info(&self, range_id: &str) -> Result<Vec<GuestSshInfo>, RangeError> {
        let metadata = self.status(range_id)?;
        let mut info: Vec<GuestSshInfo> = metadata
            .ip_assignments
            .iter()
            .map(|(guest_id, host)| GuestSshInfo {
                guest_id: guest_id.clone(),
                host: host.clone(),
                port: 22,
            })
            .collect();
        info.sort_by(|a, b| a.guest_id.cmp(&b.guest_id));
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_rejects_invalid_settings() {
        let settings = EnvSettings {
            entry_port_low: 60000,
            entry_port_high: 50000,
            ..EnvSettings::default()
        };
        assert!(RangeOrchestrator::new(settings).await.is_err());
    }

    #[tokio::test]
    async fn status_reports_not_found_for_unknown_range() {
        let dir = tempfile::tempdir().unwrap();
        let settings = EnvSettings {
            cyber_range_dir: dir.path().display().to_string(),
            ..EnvSettings::default()
        };
        let orchestrator = RangeOrchestrator::new(settings).await.unwrap();
        let err = orchestrator.status("101").unwrap_err();
        assert!(matches!(err, RangeError::RangeNotFound { .. }));
    }
}
