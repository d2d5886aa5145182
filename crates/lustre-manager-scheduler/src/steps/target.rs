use std::time::Duration;

use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use lustre_manager_store::{
    ConfParamScope, Entity, Host, Target, TargetMount, TargetRole, VolumeNode,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::StepContext;
use crate::error::{AgentError, StepError};
use crate::jobs::{expected_label, mgs_nid_spec};
use crate::object_cache::ObjectCache;

/// Time between `check_ha_resource` polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct FormatResult {
    uuid: String,
    inode_size: Option<u32>,
    filesystem_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceStatus {
    location: Option<String>,
    #[serde(default)]
    transitioning: bool,
}

fn load_target(ctx: &StepContext<'_>, target_id: EntityId) -> Result<Target, StepError> {
    ctx.cache()
        .target(target_id)
        .ok_or(StepError::EntityVanished(EntityRef::new(ClassTag::Target, target_id)))
}

fn load_mount(ctx: &StepContext<'_>, mount_id: EntityId) -> Result<TargetMount, StepError> {
    ctx.cache()
        .target_mount(mount_id)
        .ok_or(StepError::EntityVanished(EntityRef::new(ClassTag::TargetMount, mount_id)))
}

fn volume_node(ctx: &StepContext<'_>, mount: &TargetMount) -> Result<VolumeNode, StepError> {
    ctx.cache().volume_node(mount.volume_node_id).ok_or(StepError::EntityVanished(
        EntityRef::new(ClassTag::VolumeNode, mount.volume_node_id),
    ))
}

fn primary_mount(ctx: &StepContext<'_>, target: &Target) -> Result<TargetMount, StepError> {
    ctx.cache()
        .target_mounts(target.header.id)
        .into_iter()
        .find(|m| m.primary)
        .ok_or_else(|| {
            StepError::PreconditionFailure(format!("{} has no primary server", target.name))
        })
}

fn host_nids(cache: &ObjectCache, host_id: EntityId) -> Vec<String> {
    cache
        .host_config(host_id, ClassTag::LnetConfiguration)
        .and_then(|lnet| cache.get(lnet))
        .and_then(|e| e.as_lnet().map(|l| l.nids.clone()))
        .unwrap_or_default()
}

fn fs_name(cache: &ObjectCache, target: &Target) -> Option<String> {
    target
        .role
        .filesystem_id()
        .and_then(|id| cache.filesystem(id))
        .map(|f| f.name)
}

// =============================================================================
// Format and registration
// =============================================================================

pub(super) async fn format(ctx: &StepContext<'_>, target_id: EntityId) -> Result<Value, StepError> {
    let mut target = load_target(ctx, target_id)?;
    let cache = ctx.cache();
    let primary = primary_mount(ctx, &target)?;
    let node = volume_node(ctx, &primary)?;

    let failnode: Vec<String> = cache
        .target_mounts(target_id)
        .iter()
        .filter(|m| !m.primary)
        .map(|m| host_nids(cache, m.host_id).join(","))
        .filter(|nids| !nids.is_empty())
        .collect();
    let (mgsnode, index) = match target.role {
        TargetRole::Mgs { .. } => (None, None),
        TargetRole::Mdt {
            filesystem_id,
            index,
        }
        | TargetRole::Ost {
            filesystem_id,
            index,
        } => {
            let mgs_id = cache
                .filesystem(filesystem_id)
                .map(|f| f.mgs_id)
                .ok_or(StepError::EntityVanished(EntityRef::new(
                    ClassTag::Filesystem,
                    filesystem_id,
                )))?;
            (Some(mgs_nid_spec(cache, mgs_id)), Some(index))
        }
    };
    let kind = target.role.kind();
    let args = json!({
        "target_types": [kind],
        "device": node.path,
        "fsname": fs_name(cache, &target),
        "mgsnode": mgsnode,
        "failnode": failnode,
        "reformat": target.reformat,
        "mkfsoptions": ctx.config().mkfs_options(kind),
        "journal_size": ctx.config().journal_size,
        "index": index,
    });

    let raw = ctx.invoke_agent(primary.host_id, "format_target", args).await?;
    let result: FormatResult = serde_json::from_value(raw.clone())
        .map_err(|e| StepError::BadResult(format!("format_target: {e}")))?;

    target.uuid = Some(result.uuid);
    target.inode_size = result.inode_size;
    let mut writes = vec![Entity::from(target)];
    if let Some(mut volume) = cache.volume(node.volume_id) {
        volume.filesystem_type = result.filesystem_type;
        writes.push(volume.into());
    }
    ctx.save(writes)?;
    Ok(raw)
}

pub(super) async fn register(ctx: &StepContext<'_>, target_id: EntityId) -> Result<Value, StepError> {
    let mut target = load_target(ctx, target_id)?;
    let label = expected_label(ctx.cache(), &target);

    if !matches!(target.role, TargetRole::Mgs { .. }) {
        let primary = primary_mount(ctx, &target)?;
        let node = volume_node(ctx, &primary)?;
        let result = ctx
            .invoke_agent(
                primary.host_id,
                "register_target",
                json!({
                    "device": node.path,
                    "mount_point": primary.mount_point,
                    "target_name": label,
                }),
            )
            .await?;
        if let Some(reported) = result["label"].as_str() {
            if reported != label {
                return Err(StepError::BadResult(format!(
                    "registration labelled {reported}, expected {label}"
                )));
            }
        }
    }

    target.name.clone_from(&label);
    ctx.save([Entity::from(target)])?;
    Ok(json!({ "label": label }))
}

// =============================================================================
// HA resources
// =============================================================================

fn ha_args(ctx: &StepContext<'_>, mount_id: EntityId) -> Result<(EntityId, Value), StepError> {
    let mount = load_mount(ctx, mount_id)?;
    let target = load_target(ctx, mount.target_id)?;
    let node = volume_node(ctx, &mount)?;
    Ok((
        mount.host_id,
        json!({
            "device": node.path,
            "ha_label": target.ha_label,
            "uuid": target.uuid,
            "primary": mount.primary,
            "mount_point": mount.mount_point,
        }),
    ))
}

pub(super) async fn configure_ha(ctx: &StepContext<'_>, mount_id: EntityId) -> Result<Value, StepError> {
    let (host_id, args) = ha_args(ctx, mount_id)?;
    ctx.invoke_agent(host_id, "configure_target_ha", args).await
}

pub(super) async fn unconfigure_ha(ctx: &StepContext<'_>, mount_id: EntityId) -> Result<Value, StepError> {
    let (host_id, args) = ha_args(ctx, mount_id)?;
    ctx.invoke_agent(host_id, "unconfigure_target_ha", args).await
}

/// Hosts that may start a target: the one running it first, then its
/// mounts with the primary first.
fn start_candidates(cache: &ObjectCache, target_id: EntityId) -> Vec<Host> {
    let mut hosts: Vec<Host> = cache.target_active_host(target_id).into_iter().collect();
    for mount in cache.target_mounts(target_id) {
        if hosts.iter().any(|h| h.header.id == mount.host_id) {
            continue;
        }
        if let Some(host) = cache.host(mount.host_id) {
            hosts.push(host);
        }
    }
    hosts
}

pub(super) async fn start(ctx: &StepContext<'_>, target_id: EntityId) -> Result<Value, StepError> {
    let target = load_target(ctx, target_id)?;
    let args = json!({ "ha_label": target.ha_label });

    let mut started_on = None;
    let mut last_error = None;
    for host in start_candidates(ctx.cache(), target_id) {
        match ctx
            .invoke_agent(host.header.id, "start_target", args.clone())
            .await
        {
            Ok(_) => {
                started_on = Some(host);
                break;
            }
            Err(StepError::Agent(
                err @ (AgentError::NoSession { .. } | AgentError::SessionTerminated { .. }),
            )) => {
                ctx.log(&format!("{}: {err}, trying next server", host.fqdn));
                last_error = Some(StepError::Agent(err));
            }
            Err(err) => return Err(err),
        }
    }
    let Some(host) = started_on else {
        return Err(last_error.unwrap_or_else(|| {
            StepError::PreconditionFailure(format!("{} has no servers", target.name))
        }));
    };

    let location = wait_target(ctx, host.header.id, &target, None).await?;
    set_active_mount(ctx, target_id, &location)?;
    Ok(json!({ "location": location }))
}

pub(super) async fn stop(ctx: &StepContext<'_>, target_id: EntityId) -> Result<Value, StepError> {
    let mut target = load_target(ctx, target_id)?;
    let host = ctx
        .cache()
        .target_active_host(target_id)
        .or_else(|| ctx.cache().target_primary_host(target_id))
        .ok_or_else(|| StepError::PreconditionFailure(format!("{} has no servers", target.name)))?;
    ctx.invoke_agent(
        host.header.id,
        "stop_target",
        json!({ "ha_label": target.ha_label }),
    )
    .await?;
    target.active_mount_id = None;
    ctx.save([Entity::from(target)])?;
    Ok(Value::Null)
}

pub(super) async fn move_to(
    ctx: &StepContext<'_>,
    target_id: EntityId,
    mount_id: EntityId,
    failback: bool,
) -> Result<Value, StepError> {
    let target = load_target(ctx, target_id)?;
    let destination = load_mount(ctx, mount_id)?;
    let dest_host = ctx.host(destination.host_id)?;
    let via = ctx
        .cache()
        .target_active_host(target_id)
        .map_or(destination.host_id, |h| h.header.id);

    ctx.invoke_agent(
        via,
        "move_target",
        json!({
            "ha_label": target.ha_label,
            "destination": dest_host.fqdn,
            "failback": failback,
        }),
    )
    .await?;
    let location = wait_target(ctx, via, &target, Some(&dest_host.fqdn)).await?;
    set_active_mount(ctx, target_id, &location)?;
    Ok(json!({ "location": location }))
}

fn set_active_mount(ctx: &StepContext<'_>, target_id: EntityId, fqdn: &str) -> Result<(), StepError> {
    let cache = ctx.cache();
    let mut target = load_target(ctx, target_id)?;
    let mount = cache
        .target_mounts(target_id)
        .into_iter()
        .find(|m| cache.host(m.host_id).is_some_and(|h| h.fqdn == fqdn))
        .ok_or_else(|| {
            StepError::PreconditionFailure(format!(
                "{} is running on {fqdn}, which has no mount for it",
                target.name
            ))
        })?;
    target.active_mount_id = Some(mount.id);
    ctx.save([Entity::from(target)])
}

/// Poll the HA resource until it settles, optionally on `expected`.
///
/// The overall wait is bounded by the target wait timeout. A resource that
/// reports no progress for the activity timeout fails sooner; while the
/// cluster reports it transitioning the activity deadline keeps moving.
async fn wait_target(
    ctx: &StepContext<'_>,
    host_id: EntityId,
    target: &Target,
    expected: Option<&str>,
) -> Result<String, StepError> {
    let config = ctx.config();
    let deadline = Instant::now() + config.target_wait_timeout();
    let mut activity_deadline = Instant::now() + config.target_activity_timeout();
    let args = json!({ "ha_label": target.ha_label });

    loop {
        let raw = ctx
            .invoke_agent(host_id, "check_ha_resource", args.clone())
            .await?;
        let status: ResourceStatus = serde_json::from_value(raw)
            .map_err(|e| StepError::BadResult(format!("check_ha_resource: {e}")))?;

        if !status.transitioning {
            if let Some(location) = status.location {
                if expected.map_or(true, |want| want == location) {
                    return Ok(location);
                }
            }
        }

        let now = Instant::now();
        if status.transitioning {
            activity_deadline = now + config.target_activity_timeout();
        }
        if now >= deadline {
            return Err(StepError::Timeout(format!(
                "{} did not settle within {}s",
                target.name, config.target_wait_timeout_seconds
            )));
        }
        if now >= activity_deadline {
            return Err(StepError::Timeout(format!(
                "{} showed no activity for {}s",
                target.name, config.target_activity_timeout_seconds
            )));
        }

        tokio::select! {
            () = ctx.cancel().cancelled() => return Err(AgentError::Cancelled.into()),
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

// =============================================================================
// MGS maintenance
// =============================================================================

pub(super) async fn purge_filesystem(
    ctx: &StepContext<'_>,
    filesystem_id: EntityId,
) -> Result<Value, StepError> {
    let cache = ctx.cache();
    let filesystem = cache.filesystem(filesystem_id).ok_or(StepError::EntityVanished(
        EntityRef::new(ClassTag::Filesystem, filesystem_id),
    ))?;
    let mgs = load_target(ctx, filesystem.mgs_id)?;
    let host = cache
        .target_active_host(mgs.header.id)
        .ok_or_else(|| StepError::PreconditionFailure("the MGS is not running".to_string()))?;
    let mount = cache
        .target_mounts(mgs.header.id)
        .into_iter()
        .find(|m| m.host_id == host.header.id)
        .ok_or(StepError::EntityVanished(EntityRef::new(ClassTag::Target, mgs.header.id)))?;
    let node = volume_node(ctx, &mount)?;
    ctx.invoke_agent(
        host.header.id,
        "purge_configuration",
        json!({ "device": node.path, "filesystem_name": filesystem.name }),
    )
    .await
}

/// Lustre parameter path for a conf param key.
fn conf_param_path(cache: &ObjectCache, scope: &ConfParamScope, key: &str) -> Option<String> {
    let path = match scope {
        ConfParamScope::Filesystem { filesystem_id } => {
            format!("{}.{key}", cache.filesystem(*filesystem_id)?.name)
        }
        ConfParamScope::FilesystemClient { filesystem_id } => {
            format!("{}-client.{key}", cache.filesystem(*filesystem_id)?.name)
        }
        ConfParamScope::Mdt { target_id } | ConfParamScope::Ost { target_id } => {
            format!("{}.{key}", cache.target(*target_id)?.name)
        }
    };
    Some(path)
}

pub(super) async fn apply_conf_params(ctx: &StepContext<'_>, mgs_id: EntityId) -> Result<Value, StepError> {
    let mut mgs = load_target(ctx, mgs_id)?;
    let TargetRole::Mgs {
        conf_param_version_applied,
        ..
    } = mgs.role
    else {
        return Err(StepError::PreconditionFailure(format!(
            "{} is not an MGS",
            mgs.name
        )));
    };
    let cache = ctx.cache();
    let host = cache
        .target_active_host(mgs_id)
        .ok_or_else(|| StepError::PreconditionFailure("the MGS is not running".to_string()))?;

    let params = ObjectCache::conf_params_after(
        ctx.scheduler().store(),
        mgs_id,
        conf_param_version_applied,
    )
    .map_err(StepError::from)?;

    let mut applied = conf_param_version_applied;
    for param in &params {
        let Some(path) = conf_param_path(cache, &param.scope, &param.key) else {
            ctx.log(&format!("skipping {}: its scope no longer exists", param.key));
            applied = applied.max(param.version);
            continue;
        };
        ctx.invoke_agent(
            host.header.id,
            "set_conf_param",
            json!({ "key": path, "value": param.value }),
        )
        .await?;
        applied = applied.max(param.version);
    }

    if let TargetRole::Mgs {
        conf_param_version_applied,
        ..
    } = &mut mgs.role
    {
        *conf_param_version_applied = applied;
    }
    ctx.save([Entity::from(mgs)])?;
    Ok(json!({ "applied": params.len(), "version": applied }))
}
