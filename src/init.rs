//! Interactive helpers backing the `config-init`, `validate`, and
//! `setup-permissions` CLI commands — none of these touch the registry or
//! the orchestrator, they only prepare the environment it runs in.

use std::io::IsTerminal;
use std::path::Path;

use inquire::validator::Validation;
use inquire::{Confirm, CustomType, Text};

use crate::config::EnvSettings;
use crate::disk::acl;
use crate::error::RangeError;
use crate::images;

// ── config-init ──────────────────────────────────────────

/// Writes a fresh environment settings file to `out`. Interactive when
/// stdout is a terminal; otherwise writes `EnvSettings::default()`
/// unattended, the same non-interactive fallback `images::pick` uses.
pub async fn run_config_init(out: &Path) -> Result<(), RangeError> {
    let interactive = std::io::stdout().is_terminal();

    if out.exists() {
        if interactive {
            let overwrite = Confirm::new(&format!("{} already exists. Overwrite?", out.display()))
                .with_default(false)
                .prompt()
                .map_err(map_inquire_err)?;
            if !overwrite {
                println!("Cancelled.");
                return Ok(());
            }
        } else {
            return Err(RangeError::Validation {
                message: format!("{} already exists", out.display()),
            });
        }
    }

    let settings = if interactive {
        run_wizard().await?
    } else {
        EnvSettings::default()
    };
    settings.validate()?;

    let yaml = facet_yaml::to_string(&settings).expect("valid YAML serialization");
    std::fs::write(out, yaml).map_err(|e| RangeError::ConfigWrite {
        path: out.display().to_string(),
        source: e,
    })?;

    println!("Wrote environment settings to {}", out.display());
    Ok(())
}

enum WizardStep {
    CyberRangeDir,
    LibvirtUri,
    Gateway,
    EntryPorts,
    SshPool,
    BaseImage,
    Done,
}

impl WizardStep {
    fn next(&self) -> Self {
        match self {
            Self::CyberRangeDir => Self::LibvirtUri,
            Self::LibvirtUri => Self::Gateway,
            Self::Gateway => Self::EntryPorts,
            Self::EntryPorts => Self::SshPool,
            Self::SshPool => Self::BaseImage,
            Self::BaseImage | Self::Done => Self::Done,
        }
    }

    fn prev(&self) -> Self {
        match self {
            Self::CyberRangeDir => Self::CyberRangeDir,
            Self::LibvirtUri => Self::CyberRangeDir,
            Self::Gateway => Self::LibvirtUri,
            Self::EntryPorts => Self::Gateway,
            Self::SshPool => Self::EntryPorts,
            Self::BaseImage => Self::SshPool,
            Self::Done => Self::BaseImage,
        }
    }
}

async fn run_wizard() -> Result<EnvSettings, RangeError> {
    let mut settings = EnvSettings::default();
    let mut step = WizardStep::CyberRangeDir;

    loop {
        match step {
            WizardStep::CyberRangeDir => match prompt_cyber_range_dir(&settings) {
                Ok(v) => {
                    settings.cyber_range_dir = v;
                    step = step.next();
                }
                Err(RangeError::Cancelled) => step = step.prev(),
                Err(e) => return Err(e),
            },
            WizardStep::LibvirtUri => match prompt_libvirt_uri(&settings) {
                Ok(v) => {
                    settings.libvirt_uri = v;
                    step = step.next();
                }
                Err(RangeError::Cancelled) => step = step.prev(),
                Err(e) => return Err(e),
            },
            WizardStep::Gateway => match prompt_gateway(&settings) {
                Ok((enabled, account, mgmt_addr, inside_addr)) => {
                    settings.gw_mode = enabled;
                    settings.gw_account = account;
                    settings.gw_mgmt_addr = mgmt_addr;
                    settings.gw_inside_addr = inside_addr;
                    step = step.next();
                }
                Err(RangeError::Cancelled) => step = step.prev(),
                Err(e) => return Err(e),
            },
            WizardStep::EntryPorts => match prompt_entry_ports(&settings) {
                Ok((low, high)) => {
                    settings.entry_port_low = low;
                    settings.entry_port_high = high;
                    step = step.next();
                }
                Err(RangeError::Cancelled) => step = step.prev(),
                Err(e) => return Err(e),
            },
            WizardStep::SshPool => match prompt_ssh_pool(&settings) {
                Ok(v) => {
                    settings.ssh_pool_max_connections = v;
                    step = step.next();
                }
                Err(RangeError::Cancelled) => step = step.prev(),
                Err(e) => return Err(e),
            },
            WizardStep::BaseImage => match images::pick(None).await {
                Ok(url) => {
                    settings.default_image_url = url;
                    step = step.next();
                }
                Err(RangeError::Cancelled) => step = step.prev(),
                Err(e) => return Err(e),
            },
            WizardStep::Done => break,
        }
    }

    Ok(settings)
}

fn prompt_cyber_range_dir(current: &EnvSettings) -> Result<String, RangeError> {
    Text::new("Cyber range directory:")
        .with_default(&current.cyber_range_dir)
        .with_help_message("Where per-range disks, logs, and registry files are stored")
        .with_validator(|input: &str| {
            if input.is_empty() {
                Ok(Validation::Invalid("Must not be empty".into()))
            } else {
                Ok(Validation::Valid)
            }
        })
        .prompt()
        .map_err(map_inquire_err)
}

fn prompt_libvirt_uri(current: &EnvSettings) -> Result<String, RangeError> {
    Text::new("Libvirt connection URI:")
        .with_default(&current.libvirt_uri)
        .with_help_message("e.g. qemu:///system, qemu:///session, qemu+ssh://host/system")
        .prompt()
        .map_err(map_inquire_err)
}

fn prompt_gateway(current: &EnvSettings) -> Result<(bool, String, String, String), RangeError> {
    let enabled = Confirm::new("Publish entry points through a gateway host?")
        .with_default(current.gw_mode)
        .with_help_message("No = guests are reached by direct SSH tunnel instead")
        .prompt()
        .map_err(map_inquire_err)?;

    if !enabled {
        return Ok((false, String::new(), String::new(), String::new()));
    }

    let account = Text::new("Gateway SSH account:")
        .with_default(&current.gw_account)
        .with_validator(|input: &str| {
            if input.is_empty() {
                Ok(Validation::Invalid("Required when gateway mode is enabled".into()))
            } else {
                Ok(Validation::Valid)
            }
        })
        .prompt()
        .map_err(map_inquire_err)?;

    let mgmt_addr = Text::new("Gateway management address:")
        .with_default(&current.gw_mgmt_addr)
        .with_help_message("Address the orchestrator SSHes into to open tunnels")
        .with_validator(|input: &str| {
            if input.is_empty() {
                Ok(Validation::Invalid("Required when gateway mode is enabled".into()))
            } else {
                Ok(Validation::Valid)
            }
        })
        .prompt()
        .map_err(map_inquire_err)?;

    let inside_addr = Text::new("Gateway inside-facing address:")
        .with_default(&current.gw_inside_addr)
        .with_help_message("Address the reverse tunnel binds on the gateway's inside interface")
        .prompt()
        .map_err(map_inquire_err)?;

    Ok((true, account, mgmt_addr, inside_addr))
}

fn prompt_entry_ports(current: &EnvSettings) -> Result<(u16, u16), RangeError> {
    let low: u16 = CustomType::new("Entry point port range, low:")
        .with_default(current.entry_port_low)
        .with_error_message("Please enter a valid port number")
        .prompt()
        .map_err(map_inquire_err)?;

    let high: u16 = CustomType::new("Entry point port range, high:")
        .with_default(current.entry_port_high)
        .with_error_message("Please enter a valid port number")
        .with_validator(move |val: &u16| {
            if *val > low {
                Ok(Validation::Valid)
            } else {
                Ok(Validation::Invalid("Must be greater than the low end".into()))
            }
        })
        .prompt()
        .map_err(map_inquire_err)?;

    Ok((low, high))
}

fn prompt_ssh_pool(current: &EnvSettings) -> Result<usize, RangeError> {
    CustomType::new("Max pooled SSH connections:")
        .with_default(current.ssh_pool_max_connections)
        .with_error_message("Please enter a valid number")
        .with_validator(|val: &usize| {
            if *val >= 1 {
                Ok(Validation::Valid)
            } else {
                Ok(Validation::Invalid("Must be at least 1".into()))
            }
        })
        .prompt()
        .map_err(map_inquire_err)
}

fn map_inquire_err(e: inquire::InquireError) -> RangeError {
    match e {
        inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted => {
            RangeError::Cancelled
        }
        other => RangeError::Validation {
            message: format!("prompt error: {other}"),
        },
    }
}

// ── setup-permissions ────────────────────────────────────

/// Grants the `libvirt-qemu` user traversal on `cyber_range_dir`, plus a
/// default ACL so ranges created later inherit it automatically. Only
/// meaningful for `qemu:///system`; a session URI runs as the calling
/// user and needs nothing extra.
pub async fn run_setup_permissions(settings: &EnvSettings) -> Result<(), RangeError> {
    if !acl::is_system_uri(&settings.libvirt_uri) {
        println!(
            "libvirt_uri '{}' is not a system URI; no ACLs needed.",
            settings.libvirt_uri
        );
        return Ok(());
    }

    let dir = Path::new(&settings.cyber_range_dir);
    std::fs::create_dir_all(dir).map_err(|e| RangeError::Io {
        context: format!("creating {}", dir.display()),
        source: e,
    })?;

    acl::grant_directory_traversal(dir).await?;
    println!("Granted libvirt-qemu traversal access on {}", dir.display());
    Ok(())
}

// ── validate ─────────────────────────────────────────────

/// Checks that the external tools and services the orchestrator shells
/// out to are reachable, without creating or touching any range.
pub async fn run_validate(settings: &EnvSettings) -> Result<(), RangeError> {
    let mut failures = Vec::new();

    if command_exists("qemu-img").await {
        println!("  ok: qemu-img");
    } else {
        println!("  missing: qemu-img");
        failures.push("qemu-img");
    }

    if command_exists("ssh").await {
        println!("  ok: ssh");
    } else {
        println!("  missing: ssh");
        failures.push("ssh");
    }

    if acl::is_system_uri(&settings.libvirt_uri) {
        if command_exists("setfacl").await {
            println!("  ok: setfacl");
        } else {
            println!("  missing: setfacl");
            failures.push("setfacl");
        }
    }

    match libvirt_reachable(&settings.libvirt_uri) {
        true => println!("  ok: libvirt ({})", settings.libvirt_uri),
        false => {
            println!("  unreachable: libvirt ({})", settings.libvirt_uri);
            failures.push("libvirt");
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(RangeError::Validation {
            message: format!("environment checks failed: {}", failures.join(", ")),
        })
    }
}

async fn command_exists(name: &str) -> bool {
    tokio::process::Command::new(name)
        .arg("--version")
        .output()
        .await
        .is_ok()
}

fn libvirt_reachable(uri: &str) -> bool {
    virt::error::clear_error_callback();
    virt::connect::Connect::open(Some(uri))
        .map(|mut c| {
            let _ = c.close();
        })
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wizard_step_sequence_reaches_done() {
        let mut step = WizardStep::CyberRangeDir;
        let mut hops = 0;
        while !matches!(step, WizardStep::Done) {
            step = step.next();
            hops += 1;
            assert!(hops < 10, "wizard step sequence did not terminate");
        }
    }

    #[test]
    fn wizard_step_prev_is_inverse_of_next_along_happy_path() {
        let start = WizardStep::LibvirtUri;
        let forward = start.next();
        let back = forward.prev();
        assert!(matches!(back, WizardStep::LibvirtUri));
    }
}
