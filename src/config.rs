use facet::Facet;
use std::path::Path;

use crate::error::RangeError;

/// Validated environment settings the orchestrator receives — parsing the
/// key/value or YAML file and applying the `CYRIS_` env overlay is an
/// external concern; this module only owns the record shape and its own
/// defaults/validation.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct EnvSettings {
    #[facet(default = "/opt/cyris")]
    pub cyris_path: String,
    #[facet(default = "/var/lib/cyris/ranges")]
    pub cyber_range_dir: String,
    #[facet(default = false)]
    pub gw_mode: bool,
    #[facet(default)]
    pub gw_account: String,
    #[facet(default)]
    pub gw_mgmt_addr: String,
    #[facet(default)]
    pub gw_inside_addr: String,
    #[facet(default)]
    pub user_email: String,
    #[facet(default = "qemu:///system")]
    pub libvirt_uri: String,
    #[facet(default = "192.168.122.0/24")]
    pub default_subnet: String,
    #[facet(default = 60000)]
    pub entry_port_low: u16,
    #[facet(default = 65000)]
    pub entry_port_high: u16,
    #[facet(default = 10)]
    pub ssh_pool_max_connections: usize,
    #[facet(default = 12)]
    pub gw_password_length: usize,
    /// Overrides the provider's built-in base image URL when set
    /// (populated interactively by `config-init`, see `crate::images`).
    #[facet(default)]
    pub default_image_url: Option<String>,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self {
            cyris_path: "/opt/cyris".into(),
            cyber_range_dir: "/var/lib/cyris/ranges".into(),
            gw_mode: false,
            gw_account: String::new(),
            gw_mgmt_addr: String::new(),
            gw_inside_addr: String::new(),
            user_email: String::new(),
            libvirt_uri: "qemu:///system".into(),
            default_subnet: "192.168.122.0/24".into(),
            entry_port_low: 60000,
            entry_port_high: 65000,
            ssh_pool_max_connections: 10,
            gw_password_length: 12,
            default_image_url: None,
        }
    }
}

impl EnvSettings {
    pub fn validate(&self) -> Result<(), RangeError> {
        if self.cyber_range_dir.is_empty() {
            return Err(RangeError::Validation {
                message: "cyber_range_dir must not be empty".into(),
            });
        }
        if self.gw_mode && (self.gw_account.is_empty() || self.gw_mgmt_addr.is_empty()) {
            return Err(RangeError::Validation {
                message: "gw_mode requires gw_account and gw_mgmt_addr to be set".into(),
            });
        }
        if self.entry_port_low >= self.entry_port_high {
            return Err(RangeError::Validation {
                message: format!(
                    "entry_port_low ({}) must be below entry_port_high ({})",
                    self.entry_port_low, self.entry_port_high
                ),
            });
        }
        Ok(())
    }

    /// Overlay `CYRIS_*` environment variables onto a parsed settings
    /// record — the process-wide override named in the description file
    /// shape's external configuration section.
    pub fn apply_env_overlay(&mut self) {
        if let Ok(v) = std::env::var("CYRIS_PATH") {
            self.cyris_path = v;
        }
        if let Ok(v) = std::env::var("CYRIS_CYBER_RANGE_DIR") {
            self.cyber_range_dir = v;
        }
        if let Ok(v) = std::env::var("CYRIS_GW_MODE") {
            self.gw_mode = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("CYRIS_GW_ACCOUNT") {
            self.gw_account = v;
        }
        if let Ok(v) = std::env::var("CYRIS_GW_MGMT_ADDR") {
            self.gw_mgmt_addr = v;
        }
        if let Ok(v) = std::env::var("CYRIS_GW_INSIDE_ADDR") {
            self.gw_inside_addr = v;
        }
        if let Ok(v) = std::env::var("CYRIS_USER_EMAIL") {
            self.user_email = v;
        }
        if let Ok(v) = std::env::var("CYRIS_LIBVIRT_URI") {
            self.libvirt_uri = v;
        }
        if let Ok(v) = std::env::var("CYRIS_DEFAULT_IMAGE_URL") {
            self.default_image_url = Some(v);
        }
    }
}

/// Loads environment settings from a YAML file, applies the env overlay,
/// and validates the result. Parse failures are the caller's problem; an
/// absent file is not defaulted silently here (the CLI decides whether to
/// fall back to `config-init`).
pub fn load_env_settings(path: &Path) -> Result<EnvSettings, RangeError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RangeError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let mut settings: EnvSettings =
        facet_yaml::from_str(&contents).map_err(|e| RangeError::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    settings.apply_env_overlay();
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EnvSettings::default().validate().unwrap();
    }

    #[test]
    fn gw_mode_requires_account_and_addr() {
        let mut s = EnvSettings {
            gw_mode: true,
            ..EnvSettings::default()
        };
        assert!(s.validate().is_err());
        s.gw_account = "gwuser".into();
        s.gw_mgmt_addr = "10.0.0.1".into();
        s.validate().unwrap();
    }

    #[test]
    fn rejects_inverted_port_range() {
        let s = EnvSettings {
            entry_port_low: 65000,
            entry_port_high: 60000,
            ..EnvSettings::default()
        };
        assert!(s.validate().is_err());
    }

    #[test]
    fn env_overlay_overrides_field() {
        std::env::set_var("CYRIS_CYBER_RANGE_DIR", "/tmp/ranges-test");
        let mut s = EnvSettings::default();
        s.apply_env_overlay();
        assert_eq!(s.cyber_range_dir, "/tmp/ranges-test");
        std::env::remove_var("CYRIS_CYBER_RANGE_DIR");
    }
}
