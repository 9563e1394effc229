//! Tunnel Manager: direct and gateway-mediated SSH port forwards,
//! each launched as a detached `ssh -f` subprocess carrying a recognisable
//! marker in its argv so teardown can `pkill -f` it without tracking PIDs
//! across orchestrator restarts.
//!
//! Gateway mode composes two hops: a reverse forward (`-R`) that makes the
//! gateway host listen on `pub_port` and relay back to our own `pub_port`,
//! and a local forward (`-L`) from our `pub_port` on to the guest — the
//! same shape the direct mode uses for its single hop. The reverse hop is
//! what makes the gateway's public port reachable without running the
//! orchestrator from the gateway host itself.

use tokio::process::Command;

use crate::error::RangeError;
use crate::model::{Tunnel, TunnelKind};

fn marker(range_id: &str, pub_port: u16) -> String {
    format!("ct{range_id}_{pub_port}")
}

fn gw_marker(range_id: &str, pub_port: u16) -> String {
    format!("ct{range_id}_{pub_port}_gw")
}

/// Everything the manager needs to open one tunnel. `gateway` is `None`
/// for direct mode.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub range_id: String,
    pub pub_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub local_user: String,
    pub gateway: Option<GatewayHop>,
}

#[derive(Debug, Clone)]
pub struct GatewayHop {
    pub gw_user: String,
    pub gw_host: String,
}

pub struct TunnelManager;

impl TunnelManager {
    pub fn new() -> Self {
        Self
    }

    /// Opens the tunnel described by `spec`. For gateway mode, the reverse
    /// hop is established first; if the local forward then fails, the
    /// reverse hop is torn down before the error surfaces — setup is
    /// transactional, never leaving one hop live without the other.
    pub async fn open(&self, spec: &TunnelSpec) -> Result<Tunnel, RangeError> {
        let local_marker = marker(&spec.range_id, spec.pub_port);

        if let Some(gw) = &spec.gateway {
            let gw_mark = gw_marker(&spec.range_id, spec.pub_port);
            spawn_reverse_forward(gw, spec.pub_port, &gw_mark).await?;

            match spawn_local_forward(&spec.local_user, &spec.target_host, spec.target_port, spec.pub_port, &local_marker)
                .await
            {
                Ok(()) => Ok(Tunnel {
                    tunnel_id: local_marker.clone(),
                    kind: TunnelKind::GatewayMediated,
                    markers: vec![local_marker, gw_mark],
                }),
                Err(e) => {
                    kill_marker(&gw_mark).await;
                    Err(e)
                }
            }
        } else {
            spawn_local_forward(&spec.local_user, &spec.target_host, spec.target_port, spec.pub_port, &local_marker).await?;
            Ok(Tunnel {
                tunnel_id: local_marker.clone(),
                kind: TunnelKind::Direct,
                markers: vec![local_marker],
            })
        }
    }

    /// Tears down every process marker recorded for `tunnel`. Best-effort:
    /// a marker with no matching process is not an error — teardown is
    /// idempotent.
    pub async fn close(&self, tunnel: &Tunnel) -> Result<(), RangeError> {
        for marker in &tunnel.markers {
            kill_marker(marker).await;
        }
        Ok(())
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn spawn_local_forward(
    local_user: &str,
    target_host: &str,
    target_port: u16,
    pub_port: u16,
    marker: &str,
) -> Result<(), RangeError> {
    run_ssh(&[
        "-f".into(),
        "-N".into(),
        "-L".into(),
        format!("0.0.0.0:{pub_port}:{target_host}:{target_port}"),
        format!("{local_user}@localhost"),
        "-o".into(),
        "StrictHostKeyChecking=accept-new".into(),
        "-o".into(),
        format!("ControlPath=/tmp/{marker}.sock"),
    ])
    .await
}

async fn spawn_reverse_forward(gw: &GatewayHop, pub_port: u16, marker: &str) -> Result<(), RangeError> {
    run_ssh(&[
        "-f".into(),
        "-N".into(),
        "-R".into(),
        format!("0.0.0.0:{pub_port}:localhost:{pub_port}"),
        format!("{}@{}", gw.gw_user, gw.gw_host),
        "-o".into(),
        "StrictHostKeyChecking=accept-new".into(),
        "-o".into(),
        format!("ControlPath=/tmp/{marker}.sock"),
    ])
    .await
}

async fn run_ssh(args: &[String]) -> Result<(), RangeError> {
    let status = Command::new("ssh")
        .args(args)
        .status()
        .await
        .map_err(|e| RangeError::Tunnel {
            message: format!("failed to spawn ssh: {e}"),
        })?;
    if !status.success() {
        return Err(RangeError::Tunnel {
            message: format!("ssh tunnel setup exited with {status}"),
        });
    }
    Ok(())
}

async fn kill_marker(marker: &str) {
    let _ = Command::new("pkill").args(["-f", marker]).status().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_marker_has_no_gw_suffix() {
        let m = marker("101", 60001);
        assert_eq!(m, "ct101_60001");
        assert!(!m.ends_with("_gw"));
    }

    #[test]
    fn gateway_marker_carries_suffix() {
        let m = gw_marker("101", 60001);
        assert_eq!(m, "ct101_60001_gw");
    }
}
