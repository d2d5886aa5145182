use std::time::Duration;

use chrono::Utc;
use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use serde_json::{json, Value};

use super::StepContext;
use crate::error::StepError;
use crate::jobs::removal_cascade;

pub(super) async fn deploy_agent(ctx: &StepContext<'_>, host_id: EntityId) -> Result<Value, StepError> {
    let host = ctx.host(host_id)?;
    ctx.invoke_local(
        "deploy_agent",
        json!({ "address": host.address, "fqdn": host.fqdn }),
    )
    .await
}

pub(super) async fn await_session(
    ctx: &StepContext<'_>,
    host_id: EntityId,
    timeout_seconds: u64,
) -> Result<Value, StepError> {
    let host = ctx.host(host_id)?;
    ctx.log(&format!("waiting for {} to connect", host.fqdn));
    let session = ctx
        .scheduler()
        .messenger()
        .await_session(&host.fqdn, Duration::from_secs(timeout_seconds), ctx.cancel())
        .await?;
    Ok(json!({ "session_id": session.to_string() }))
}

pub(super) async fn install_packages(
    ctx: &StepContext<'_>,
    host_id: EntityId,
    packages: &[String],
) -> Result<Value, StepError> {
    let result = ctx
        .invoke_agent(host_id, "install_packages", json!({ "packages": packages }))
        .await?;
    Ok(json!({
        "reboot_required": result["reboot_required"].as_bool().unwrap_or(false),
    }))
}

/// Reboot and wait for the agent to come back with a new session.
pub(super) async fn reboot(
    ctx: &StepContext<'_>,
    host_id: EntityId,
    timeout_seconds: u64,
) -> Result<Value, StepError> {
    let host = ctx.host(host_id)?;
    let messenger = ctx.scheduler().messenger();
    let old = messenger.current_session(&host.fqdn);
    ctx.invoke_agent(host_id, "reboot_server", json!({})).await?;
    ctx.log(&format!("waiting for {} to restart", host.fqdn));
    let session = messenger
        .await_restart(
            &host.fqdn,
            old,
            Duration::from_secs(timeout_seconds),
            ctx.cancel(),
        )
        .await?;
    Ok(json!({ "session_id": session.to_string() }))
}

pub(super) async fn learn_nids(ctx: &StepContext<'_>, lnet_id: EntityId) -> Result<Value, StepError> {
    let item = EntityRef::new(ClassTag::LnetConfiguration, lnet_id);
    let mut entity = ctx.entity(item)?;
    let host_id = entity
        .as_lnet()
        .map(|l| l.host_id)
        .ok_or(StepError::EntityVanished(item))?;

    let result = ctx.invoke_agent(host_id, "get_nids", json!({})).await?;
    let nids: Vec<String> = serde_json::from_value(result["nids"].clone())
        .map_err(|e| StepError::BadResult(format!("get_nids: {e}")))?;
    if nids.is_empty() {
        return Err(StepError::BadResult("get_nids returned no NIDs".to_string()));
    }

    if let Some(lnet) = entity.as_lnet_mut() {
        lnet.nids.clone_from(&nids);
    }
    ctx.save([entity])?;
    Ok(json!({ "nids": nids }))
}

pub(super) fn force_remove(ctx: &StepContext<'_>, host_id: EntityId) -> Result<Value, StepError> {
    let host = ctx.host(host_id)?;
    let retired = removal_cascade(ctx.cache(), host_id, Utc::now(), true);
    let count = retired.len();
    ctx.save(retired)?;
    ctx.scheduler().messenger().remove_host(&host.fqdn);
    tracing::warn!(fqdn = %host.fqdn, records = count, "Host force removed");
    Ok(json!({ "retired": count }))
}
