//! Base-image preset registry for `config-init`'s interactive wizard: a
//! short list of well-known cloud images plus a live Fedora feed, so an
//! operator can pick a `default_image_url` without hand-typing one.

use std::fmt;
use std::io::IsTerminal;

use indicatif::ProgressBar;
use inquire::Select;

use crate::error::RangeError;

// ── Built-in presets ─────────────────────────────────────

struct Preset {
    label: &'static str,
    url: &'static str,
}

const PRESETS: &[Preset] = &[
    Preset {
        label: "Ubuntu 24.04 LTS (Noble)",
        url: "https://cloud-images.ubuntu.com/noble/current/noble-server-cloudimg-amd64.img",
    },
    Preset {
        label: "Ubuntu 22.04 LTS (Jammy)",
        url: "https://cloud-images.ubuntu.com/jammy/current/jammy-server-cloudimg-amd64.img",
    },
    Preset {
        label: "Fedora Cloud 43",
        url: "https://download.fedoraproject.org/pub/fedora/linux/releases/43/Cloud/x86_64/images/Fedora-Cloud-Base-Generic-43-1.6.x86_64.qcow2",
    },
    Preset {
        label: "Debian 12 (Bookworm)",
        url: "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-generic-amd64.qcow2",
    },
    Preset {
        label: "Arch Linux",
        url: "https://geo.mirror.pkgbuild.com/images/latest/Arch-Linux-x86_64-cloudimg.qcow2",
    },
    Preset {
        label: "Alpine Linux 3.21",
        url: "https://dl-cdn.alpinelinux.org/alpine/v3.21/releases/cloud/nocloud_alpine-3.21.3-x86_64-bios-cloudinit-r0.qcow2",
    },
    Preset {
        label: "Rocky Linux 9",
        url: "https://dl.rockylinux.org/pub/rocky/9/images/x86_64/Rocky-9-GenericCloud-Base.latest.x86_64.qcow2",
    },
    Preset {
        label: "AlmaLinux 9",
        url: "https://repo.almalinux.org/almalinux/9/cloud/x86_64/images/AlmaLinux-9-GenericCloud-latest.x86_64.qcow2",
    },
    Preset {
        label: "openSUSE Leap 15.6",
        url: "https://download.opensuse.org/distribution/leap/15.6/appliances/openSUSE-Leap-15.6-Minimal-VM.x86_64-Cloud.qcow2",
    },
    Preset {
        label: "CentOS Stream 9",
        url: "https://cloud.centos.org/centos/9-stream/x86_64/images/CentOS-Stream-GenericCloud-9-latest.x86_64.qcow2",
    },
];

/// Returns `(label, url)` pairs for callers that want the static list
/// without paying for the live Fedora lookup.
pub fn preset_labels_and_urls() -> Vec<(&'static str, &'static str)> {
    PRESETS.iter().map(|p| (p.label, p.url)).collect()
}

// ── Cloud image type ─────────────────────────────────────

pub struct CloudImage {
    pub label: String,
    pub url: String,
}

impl fmt::Display for CloudImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

// ── Fedora API ───────────────────────────────────────────

#[derive(Debug, Default, facet::Facet)]
#[facet(default)]
struct FedoraRelease {
    #[facet(default)]
    version: String,
    #[facet(default)]
    arch: String,
    #[facet(default)]
    variant: String,
    #[facet(default)]
    subvariant: String,
    #[facet(default)]
    link: String,
}

async fn fetch_fedora_images() -> Vec<CloudImage> {
    let Ok(client) = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
    else {
        return Vec::new();
    };

    let resp = client
        .get("https://www.fedoraproject.org/releases.json")
        .send()
        .await;

    let body = match resp {
        Ok(r) => match r.text().await {
            Ok(t) => t,
            Err(_) => return Vec::new(),
        },
        Err(_) => return Vec::new(),
    };

    let releases: Vec<FedoraRelease> = match facet_json::from_str(&body) {
        Ok(r) => r,
        Err(_) => return Vec::new(),
    };

    releases
        .into_iter()
        .filter(|r| {
            r.variant == "Cloud"
                && r.subvariant == "Cloud_Base"
                && r.arch == "x86_64"
                && r.link.contains("Generic")
                && r.link.ends_with(".qcow2")
        })
        .map(|r| CloudImage {
            label: format!("Fedora Cloud {} (live)", r.version),
            url: r.link,
        })
        .collect()
}

// ── Registry assembly ────────────────────────────────────

async fn all_images() -> Vec<CloudImage> {
    let use_spinner = std::io::stderr().is_terminal();

    let spinner = if use_spinner {
        let s = ProgressBar::new_spinner();
        s.set_message("Fetching cloud image registry...");
        s.enable_steady_tick(std::time::Duration::from_millis(80));
        Some(s)
    } else {
        None
    };

    let fedora_images = fetch_fedora_images().await;

    if let Some(s) = spinner {
        s.finish_and_clear();
    }

    let mut images: Vec<CloudImage> = PRESETS
        .iter()
        .filter(|p| !p.label.starts_with("Fedora"))
        .map(|p| CloudImage {
            label: p.label.to_string(),
            url: p.url.to_string(),
        })
        .collect();

    if fedora_images.is_empty() {
        // Fall back to the built-in Fedora entry
        for p in PRESETS.iter().filter(|p| p.label.starts_with("Fedora")) {
            images.push(CloudImage {
                label: p.label.to_string(),
                url: p.url.to_string(),
            });
        }
    } else {
        images.extend(fedora_images);
    }

    // Sort: Ubuntu first, then alphabetical
    images.sort_by(|a, b| {
        let a_ubuntu = a.label.starts_with("Ubuntu");
        let b_ubuntu = b.label.starts_with("Ubuntu");
        match (a_ubuntu, b_ubuntu) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => a.label.cmp(&b.label),
        }
    });

    images
}

// ── Filtering ────────────────────────────────────────────

pub fn filter_images<'a>(images: &'a [CloudImage], query: Option<&str>) -> Vec<&'a CloudImage> {
    match query {
        None | Some("") => images.iter().collect(),
        Some(q) => {
            let q_lower = q.to_lowercase();
            images
                .iter()
                .filter(|img| img.label.to_lowercase().contains(&q_lower))
                .collect()
        }
    }
}

// ── Main entry point ─────────────────────────────────────

/// Picks a base image URL: interactively via a selector when stdout is a
/// terminal, or by printing the candidate list and returning the first
/// match otherwise. Returns `None` if the operator declines to pick one
/// (the caller then falls back to the provider's built-in default).
pub async fn pick(query: Option<&str>) -> Result<Option<String>, RangeError> {
    let images = all_images().await;
    let filtered = filter_images(&images, query);

    if filtered.is_empty() {
        let msg = match query {
            Some(q) => format!("no base images matching '{q}'"),
            None => "no base images available".to_string(),
        };
        return Err(RangeError::Validation { message: msg });
    }

    if !std::io::stdout().is_terminal() {
        for img in &filtered {
            println!("{}\t{}", img.label, img.url);
        }
        return Ok(filtered.first().map(|img| img.url.clone()));
    }

    let mut labels: Vec<String> = filtered.iter().map(|img| img.label.clone()).collect();
    labels.push("Keep the provider default".to_string());

    let choice = Select::new("Default base image:", labels)
        .with_help_message("Use ↑↓ to navigate, type to filter")
        .prompt()
        .map_err(map_inquire_err)?;

    if choice == "Keep the provider default" {
        return Ok(None);
    }

    let selected = filtered.iter().find(|img| img.label == choice).unwrap();
    Ok(Some(selected.url.clone()))
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

// ── Tests ────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_presets_not_empty() {
        let presets = preset_labels_and_urls();
        assert!(!presets.is_empty());
        for (label, url) in &presets {
            assert!(!label.is_empty());
            assert!(url.starts_with("https://"));
        }
    }

    #[test]
    fn filter_images_case_insensitive() {
        let images = vec![
            CloudImage {
                label: "Ubuntu 24.04".into(),
                url: "https://example.com/ubuntu".into(),
            },
            CloudImage {
                label: "Fedora Cloud 43".into(),
                url: "https://example.com/fedora".into(),
            },
        ];
        let result = filter_images(&images, Some("ubuntu"));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].label, "Ubuntu 24.04");

        let result = filter_images(&images, Some("FEDORA"));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].label, "Fedora Cloud 43");
    }

    #[test]
    fn filter_images_no_query_returns_all() {
        let images = vec![
            CloudImage {
                label: "Ubuntu".into(),
                url: "https://a".into(),
            },
            CloudImage {
                label: "Fedora".into(),
                url: "https://b".into(),
            },
        ];
        assert_eq!(filter_images(&images, None).len(), 2);
        assert_eq!(filter_images(&images, Some("")).len(), 2);
    }

    #[test]
    fn filter_images_no_match_returns_empty() {
        let images = vec![CloudImage {
            label: "Ubuntu".into(),
            url: "https://a".into(),
        }];
        assert!(filter_images(&images, Some("nixos")).is_empty());
    }
}
