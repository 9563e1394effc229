//! Destroy flow: ACTIVE|STOPPED → STOPPING → DESTROYED|ERROR.
//! Teardown order is the reverse of creation: tunnels, then guests, then
//! disks (removed with the range directory), then networks, then hosts.

use crate::error::RangeError;
use crate::gateway::GatewayService;
use crate::logging::utc_timestamp;
use crate::model::{RangeMetadata, RangeResources, RangeStatus, Tunnel, TunnelKind};
use crate::orchestrator::state;
use crate::provider::kvm::{self, KvmProvider};
use crate::provider::Provider;
use crate::registry::Registry;

pub struct DestroyContext<'a> {
    pub registry: &'a Registry,
    pub provider: &'a KvmProvider,
    pub libvirt_uri: &'a str,
    pub gateway: &'a GatewayService,
}

pub struct DestroyOutcome {
    pub metadata: RangeMetadata,
    pub already_destroyed: bool,
}

/// Runs the destroy flow for `range_id`. A range already DESTROYED is a
/// no-op success. A range in a non-destroyable status (CREATING/ERROR)
/// requires `force`.
pub async fn run(ctx: &DestroyContext<'_>, range_id: &str, force: bool) -> Result<DestroyOutcome, RangeError> {
    let metadata = ctx.registry.get_metadata(range_id).ok_or_else(|| RangeError::RangeNotFound {
        range_id: range_id.to_string(),
    })?;

    if state::destroy_is_noop(metadata.status) {
        return Ok(DestroyOutcome {
            metadata,
            already_destroyed: true,
        });
    }

    if !state::destroy_allowed(metadata.status, force) {
        return Err(RangeError::NotTerminal {
            range_id: range_id.to_string(),
            status: metadata.status.to_string(),
        });
    }

    ctx.registry.update_metadata(range_id, |m| {
        m.status = RangeStatus::Stopping;
        m.last_modified = utc_timestamp();
    })?;

    let resources = ctx.registry.get_resources(range_id).unwrap_or_default();

    match teardown(ctx, range_id, &resources).await {
        Ok(()) => {
            ctx.registry.update_metadata(range_id, |m| {
                m.status = RangeStatus::Destroyed;
                m.last_modified = utc_timestamp();
            })?;
            ctx.registry.update_resources(range_id, |r| *r = RangeResources::default())?;
            Ok(DestroyOutcome {
                metadata: ctx.registry.get_metadata(range_id).expect("range just updated"),
                already_destroyed: false,
            })
        }
        Err(error) => {
            ctx.registry.update_metadata(range_id, |m| {
                m.status = RangeStatus::Error;
                m.last_modified = utc_timestamp();
            })?;
            Err(error)
        }
    }
}

/// Tears down every resource the registry recorded for this range, in
/// teardown order. Each step is allowed to fail outright — unlike create's
/// best-effort cleanup, a failed destroy step leaves the range in ERROR so
/// the operator can retry rather than silently losing track of a stuck
/// resource.
async fn teardown(ctx: &DestroyContext<'_>, range_id: &str, resources: &RangeResources) -> Result<(), RangeError> {
    for tunnel_id in &resources.tunnel_ids {
        crate::orchestrator::safe::safe_execute(
            "close_tunnel",
            range_id,
            close_tunnel(ctx, tunnel_id),
        )
        .await?;
    }

    if !resources.domain_names.is_empty() {
        crate::orchestrator::safe::safe_execute(
            "destroy_guests",
            range_id,
            ctx.provider.destroy_guests(&resources.domain_names),
        )
        .await?;
    }

    for network_name in &resources.network_names {
        crate::orchestrator::safe::safe_execute(
            "destroy_network",
            range_id,
            kvm::destroy_network(ctx.libvirt_uri, network_name),
        )
        .await?;
    }

    Ok(())
}

/// Rebuilds a [`Tunnel`] from its stored id to close it — the registry
/// persists only the tunnel id string (as `resources.tunnel_ids`), so
/// teardown reconstructs the marker list the way it was minted: a gateway
/// tunnel's id carries no `_gw` suffix itself, but its reverse-hop marker
/// does, so both are attempted and a missing one is a no-op.
async fn close_tunnel(ctx: &DestroyContext<'_>, tunnel_id: &str) -> Result<(), RangeError> {
    let tunnel = Tunnel {
        tunnel_id: tunnel_id.to_string(),
        kind: TunnelKind::Direct,
        markers: vec![tunnel_id.to_string(), format!("{tunnel_id}_gw")],
    };
    ctx.gateway.unpublish(
        &crate::model::EntryPoint {
            range_id: String::new(),
            instance_id: String::new(),
            guest_id: String::new(),
            published_port: 0,
            target_host: String::new(),
            target_port: 0,
            account: String::new(),
            password: String::new(),
            tunnel_id: tunnel_id.to_string(),
            created_at: String::new(),
        },
        &tunnel,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_is_noop_on_destroyed() {
        assert!(state::destroy_is_noop(RangeStatus::Destroyed));
    }

    #[test]
    fn destroy_blocked_without_force_from_creating() {
        assert!(!state::destroy_allowed(RangeStatus::Creating, false));
        assert!(state::destroy_allowed(RangeStatus::Creating, true));
    }
}
