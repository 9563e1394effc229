use std::path::Path;

use facet_value::{VArray, Value, value};

use crate::error::RangeError;
use crate::iso9660::{self, IsoFile};

/// Generate a cloud-init NoCloud seed ISO (ISO 9660, volume label
/// "CIDATA") for one guest: a `ubuntu` user, DHCP on eth0 matched by
/// MAC, and a stable `instance-id` so repeated boots don't re-run cloud-init.
pub async fn generate_seed_iso(
    seed_path: &Path,
    hostname: &str,
    mac: &str,
    root_passwd: Option<&str>,
    authorized_keys: &[String],
) -> Result<(), RangeError> {
    if let Some(parent) = seed_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RangeError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    let meta_data = format!("instance-id: {hostname}\nlocal-hostname: {hostname}\n");
    let user_data = build_user_data(hostname, root_passwd, authorized_keys);
    let network_config = build_network_config(mac);

    let iso = iso9660::build_iso(
        "CIDATA",
        &[
            IsoFile {
                name: "meta-data",
                data: meta_data.as_bytes(),
            },
            IsoFile {
                name: "user-data",
                data: user_data.as_bytes(),
            },
            IsoFile {
                name: "network-config",
                data: network_config.as_bytes(),
            },
        ],
    );

    tokio::fs::write(seed_path, &iso)
        .await
        .map_err(|e| RangeError::Io {
            context: format!("writing seed ISO to {}", seed_path.display()),
            source: e,
        })?;

    tracing::info!(path = %seed_path.display(), "generated cloud-init seed ISO");
    Ok(())
}

fn build_network_config(mac: &str) -> String {
    format!(
        "version: 2\nethernets:\n  eth0:\n    match:\n      macaddress: \"{mac}\"\n    dhcp4: true\n    set-name: eth0\n"
    )
}

fn build_user_data(hostname: &str, root_passwd: Option<&str>, authorized_keys: &[String]) -> String {
    let mut user = value!({
        "name": "ubuntu",
        "lock_passwd": root_passwd.is_none(),
        "shell": "/bin/bash",
        "sudo": "ALL=(ALL) NOPASSWD:ALL",
    });

    if let Some(passwd) = root_passwd {
        if let Some(obj) = user.as_object_mut() {
            obj.insert("plain_text_passwd", Value::from(passwd));
            obj.insert("lock_passwd", Value::from(false));
        }
    }

    if !authorized_keys.is_empty() {
        let keys: VArray = authorized_keys.iter().map(|k| Value::from(k.as_str())).collect();
        if let Some(obj) = user.as_object_mut() {
            obj.insert("ssh_authorized_keys", Value::from(keys));
        }
    }

    let config = value!({
        "hostname": (hostname),
        "users": [user],
    });

    let yaml = facet_yaml::to_string(&config).expect("valid YAML serialization");
    let yaml = yaml.strip_prefix("---\n").unwrap_or(&yaml);
    format!("#cloud-config\n{yaml}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_is_valid_cloud_config() {
        let ud = build_user_data("g1", None, &[]);
        assert!(ud.starts_with("#cloud-config\n"));
    }

    #[test]
    fn user_data_has_ubuntu_user() {
        let ud = build_user_data("g1", None, &[]);
        assert!(ud.contains("name: ubuntu"));
    }

    #[test]
    fn user_data_carries_root_password() {
        let ud = build_user_data("g1", Some("hunter2"), &[]);
        assert!(ud.contains("hunter2"));
        assert!(ud.contains("lock_passwd: false"));
    }

    #[test]
    fn user_data_carries_authorized_keys() {
        let ud = build_user_data("g1", None, &["ssh-ed25519 AAAA test@host".into()]);
        assert!(ud.contains("ssh_authorized_keys"));
        assert!(ud.contains("ssh-ed25519"));
    }

    #[test]
    fn network_config_matches_mac_on_eth0() {
        let nc = build_network_config("52:54:00:aa:bb:cc");
        assert!(nc.contains("52:54:00:aa:bb:cc"));
        assert!(nc.contains("dhcp4: true"));
        assert!(nc.contains("eth0"));
    }
}
