//! Gateway Service: turns a provisioned guest into a published,
//! SSH-reachable entry point — allocates a port, generates a password,
//! asks the Tunnel Manager to wire it, and renders the operator-facing
//! access notification.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::Mutex;

use rand_core::{OsRng, RngCore};

use crate::error::RangeError;
use crate::gateway::tunnel::{GatewayHop, TunnelManager, TunnelSpec};
use crate::model::EntryPoint;

const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Gateway-mode configuration, a subset of [`crate::config::EnvSettings`].
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub enabled: bool,
    pub account: String,
    pub mgmt_addr: String,
    pub inside_addr: String,
    pub port_low: u16,
    pub port_high: u16,
    pub password_length: usize,
}

impl GatewaySettings {
    /// Checks that gateway mode carries the settings the tunnel hop needs.
    /// `config::EnvSettings::validate` already checks account/mgmt_addr;
    /// this adds the inside address the reverse hop's counterpart forward
    /// needs.
    pub fn validate(&self) -> Result<(), RangeError> {
        if self.enabled && (self.account.is_empty() || self.mgmt_addr.is_empty() || self.inside_addr.is_empty()) {
            return Err(RangeError::Gateway {
                message: "gw_mode requires gw_account, gw_mgmt_addr, and gw_inside_addr".into(),
            });
        }
        if self.port_low >= self.port_high {
            return Err(RangeError::Gateway {
                message: format!("port_low ({}) must be below port_high ({})", self.port_low, self.port_high),
            });
        }
        Ok(())
    }
}

pub struct GatewayService {
    settings: GatewaySettings,
    tunnels: TunnelManager,
    allocated: Mutex<HashSet<u16>>,
}

/// The operator-facing message printed after a range finishes creating —
/// one line per published entry point with the SSH command and
/// credentials needed to reach it.
pub struct AccessNotification {
    pub lines: Vec<String>,
}

impl std::fmt::Display for AccessNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

impl GatewayService {
    pub fn new(settings: GatewaySettings) -> Result<Self, RangeError> {
        settings.validate()?;
        Ok(Self {
            settings,
            tunnels: TunnelManager::new(),
            allocated: Mutex::new(HashSet::new()),
        })
    }

    /// Picks a free port in the configured range, verifying with a
    /// transient bind that nothing else already owns it at the OS level.
    /// The check-then-use window is an accepted, documented race; the
    /// registry's own uniqueness of published ports within one process is
    /// what actually matters here.
    fn allocate_port(&self) -> Result<u16, RangeError> {
        let mut allocated = self.allocated.lock().unwrap();
        for port in self.settings.port_low..=self.settings.port_high {
            if allocated.contains(&port) {
                continue;
            }
            if TcpListener::bind(("0.0.0.0", port)).is_ok() {
                allocated.insert(port);
                return Ok(port);
            }
        }
        Err(RangeError::Gateway {
            message: format!(
                "no free port in range {}-{}",
                self.settings.port_low, self.settings.port_high
            ),
        })
    }

    fn release_port(&self, port: u16) {
        self.allocated.lock().unwrap().remove(&port);
    }

    fn generate_password(&self) -> String {
        let mut bytes = vec![0u8; self.settings.password_length];
        OsRng.fill_bytes(&mut bytes);
        bytes.iter().map(|b| ALNUM[(*b as usize) % ALNUM.len()] as char).collect()
    }

    /// Publishes one guest as an entry point: allocates a port, mints a
    /// password, and asks the Tunnel Manager to wire the chosen mode.
    pub async fn publish_entry_point(
        &self,
        range_id: &str,
        instance_id: &str,
        guest_id: &str,
        target_host: &str,
        target_port: u16,
        account: &str,
        created_at: &str,
    ) -> Result<EntryPoint, RangeError> {
        let pub_port = self.allocate_port()?;
        let password = self.generate_password();

        let gateway = if self.settings.enabled {
            Some(GatewayHop {
                gw_user: self.settings.account.clone(),
                gw_host: self.settings.mgmt_addr.clone(),
            })
        } else {
            None
        };

        let spec = TunnelSpec {
            range_id: range_id.to_string(),
            pub_port,
            target_host: target_host.to_string(),
            target_port,
            local_user: account.to_string(),
            gateway,
        };

        let tunnel = match self.tunnels.open(&spec).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                self.release_port(pub_port);
                return Err(e);
            }
        };

        Ok(EntryPoint {
            range_id: range_id.to_string(),
            instance_id: instance_id.to_string(),
            guest_id: guest_id.to_string(),
            published_port: pub_port,
            target_host: target_host.to_string(),
            target_port,
            account: account.to_string(),
            password,
            tunnel_id: tunnel.tunnel_id,
            created_at: created_at.to_string(),
        })
    }

    /// Tears down a published entry point's tunnel and frees its port.
    pub async fn unpublish(&self, entry: &EntryPoint, tunnel: &crate::model::Tunnel) -> Result<(), RangeError> {
        self.tunnels.close(tunnel).await?;
        self.release_port(entry.published_port);
        Ok(())
    }

    /// Builds the operator-facing notification for a batch of entry points.
    pub fn access_notification(&self, entries: &[EntryPoint]) -> AccessNotification {
        let host = if self.settings.enabled {
            self.settings.mgmt_addr.clone()
        } else {
            "localhost".to_string()
        };
        let lines = entries
            .iter()
            .map(|e| {
                format!(
                    "{} ({}): ssh -p {} {}@{}  [password: {}]",
                    e.guest_id, e.instance_id, e.published_port, e.account, host, e.password
                )
            })
            .collect();
        AccessNotification { lines }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enabled: bool) -> GatewaySettings {
        GatewaySettings {
            enabled,
            account: "gwuser".into(),
            mgmt_addr: "10.0.0.1".into(),
            inside_addr: "10.0.1.1".into(),
            port_low: 60000,
            port_high: 60010,
            password_length: 12,
        }
    }

    #[test]
    fn disabled_gateway_does_not_require_addrs() {
        let s = GatewaySettings {
            account: String::new(),
            mgmt_addr: String::new(),
            inside_addr: String::new(),
            ..settings(false)
        };
        s.validate().unwrap();
    }

    #[test]
    fn enabled_gateway_requires_addrs() {
        let s = GatewaySettings {
            inside_addr: String::new(),
            ..settings(true)
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn password_has_configured_length() {
        let service = GatewayService::new(settings(false)).unwrap();
        let pw = service.generate_password();
        assert_eq!(pw.len(), 12);
        assert!(pw.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn port_allocation_stays_in_range_and_does_not_repeat() {
        let service = GatewayService::new(settings(false)).unwrap();
        let a = service.allocate_port().unwrap();
        let b = service.allocate_port().unwrap();
        assert_ne!(a, b);
        assert!((60000..=60010).contains(&a));
        assert!((60000..=60010).contains(&b));
    }

    #[test]
    fn released_port_can_be_reallocated() {
        let service = GatewayService::new(settings(false)).unwrap();
        let a = service.allocate_port().unwrap();
        service.release_port(a);
        let b = service.allocate_port().unwrap();
        assert_eq!(a, b);
    }
}
