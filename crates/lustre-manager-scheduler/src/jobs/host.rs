use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use lustre_manager_store::{Entity, ServerProfile, STATE_REMOVED};
use serde_json::json;

use super::{client, Job, JobClass, LockSpec};
use crate::config::SchedulerConfig;
use crate::deps::{DependOn, Dependency};
use crate::error::StepError;
use crate::object_cache::ObjectCache;
use crate::steps::Step;

pub(super) fn description(job: Job, subject: &Entity) -> String {
    let fqdn = subject.label();
    match job.class {
        JobClass::DeployHost => format!("Deploy agent to host {fqdn}"),
        JobClass::InstallHostPackages => format!("Install packages on server {fqdn}"),
        JobClass::SetupHost => format!("Set up server {fqdn}"),
        JobClass::SetupMonitoredHost => format!("Set up monitored server {fqdn}"),
        JobClass::SetupWorker => format!("Set up worker node {fqdn}"),
        JobClass::RemoveHost => format!("Remove host {fqdn} from configuration"),
        JobClass::RemoveUnconfiguredHost => format!("Remove unconfigured server {fqdn}"),
        JobClass::ForceRemoveHost => format!("Force remove host {fqdn} from configuration"),
        JobClass::RebootHost => format!("Initiate a reboot on host {fqdn}"),
        JobClass::ShutdownHost => format!("Initiate an orderly shutdown on host {fqdn}"),
        JobClass::MountClient => format!("Mount all Lustre filesystems on client {fqdn}"),
        JobClass::UnmountClient => format!("Unmount all Lustre filesystems on client {fqdn}"),
        other => format!("{other} on {fqdn}"),
    }
}

fn config_leaf(
    cache: &ObjectCache,
    host_id: EntityId,
    class: ClassTag,
    preferred: &'static str,
) -> Option<DependOn> {
    cache
        .host_config(host_id, class)
        .map(|item| DependOn::except(item, preferred, &["unconfigured"]))
}

pub(super) fn deps(job: Job, cache: &ObjectCache, subject: &Entity) -> Dependency {
    let host_id = subject.id();
    let mut leaves = Vec::new();
    match job.class {
        JobClass::SetupHost => {
            leaves.extend(
                cache
                    .host_config(host_id, ClassTag::NtpConfiguration)
                    .map(|ntp| DependOn::new(ntp, "configured")),
            );
            leaves.extend(config_leaf(cache, host_id, ClassTag::CorosyncConfiguration, "stopped"));
            leaves.extend(config_leaf(cache, host_id, ClassTag::PacemakerConfiguration, "stopped"));
            leaves.extend(config_leaf(cache, host_id, ClassTag::LnetConfiguration, "lnet_unloaded"));
        }
        JobClass::SetupMonitoredHost | JobClass::SetupWorker => {
            leaves.extend(
                cache
                    .host_config(host_id, ClassTag::NtpConfiguration)
                    .map(|ntp| DependOn::new(ntp, "configured")),
            );
            leaves.extend(config_leaf(cache, host_id, ClassTag::LnetConfiguration, "lnet_unloaded"));
        }
        JobClass::RemoveHost => {
            // Pacemaker before Corosync: its stopped state needs Corosync configured.
            for class in [
                ClassTag::PacemakerConfiguration,
                ClassTag::CorosyncConfiguration,
                ClassTag::LnetConfiguration,
                ClassTag::NtpConfiguration,
            ] {
                leaves.extend(
                    cache
                        .host_config(host_id, class)
                        .map(|item| DependOn::new(item, "unconfigured")),
                );
            }
        }
        JobClass::MountClient => {
            for mount in cache
                .host_client_mounts(host_id)
                .into_iter()
                .filter(|m| m.header.state == "unmounted")
            {
                leaves.push(DependOn::new(
                    EntityRef::new(ClassTag::Filesystem, mount.filesystem_id),
                    "available",
                ));
            }
            leaves.extend(
                cache
                    .host_config(host_id, ClassTag::LnetConfiguration)
                    .map(|lnet| DependOn::new(lnet, "lnet_up")),
            );
        }
        _ => {}
    }
    Dependency::all(leaves)
}

pub(super) fn create_locks(job: Job, cache: &ObjectCache) -> Vec<LockSpec> {
    let host = job.subject();
    match job.class {
        JobClass::ForceRemoveHost | JobClass::RebootHost | JobClass::ShutdownHost => {
            vec![LockSpec::exclusive(host)]
        }
        JobClass::MountClient => client_mount_locks(cache, job.id, "unmounted", "mounted"),
        JobClass::UnmountClient => client_mount_locks(cache, job.id, "mounted", "unmounted"),
        _ => Vec::new(),
    }
}

fn client_mount_locks(
    cache: &ObjectCache,
    host_id: EntityId,
    from: &'static str,
    to: &'static str,
) -> Vec<LockSpec> {
    cache
        .host_client_mounts(host_id)
        .into_iter()
        .filter(|m| m.header.state == from)
        .map(|m| LockSpec {
            item: EntityRef::new(ClassTag::ClientMount, m.header.id),
            write: true,
            begin: Some(from),
            end: Some(to),
        })
        .collect()
}

pub(super) fn steps(
    job: Job,
    cache: &ObjectCache,
    config: &SchedulerConfig,
    subject: &Entity,
) -> Result<Vec<Step>, StepError> {
    let host = subject
        .as_host()
        .ok_or_else(|| StepError::PreconditionFailure(format!("{} is not a host", job.subject())))?;
    let host_id = host.header.id;
    let agent = |action: &str, args: serde_json::Value| Step::AgentAction {
        host_id,
        action: action.to_string(),
        args,
    };

    let steps = match job.class {
        JobClass::DeployHost => vec![
            Step::DeployAgent { host_id },
            Step::AwaitSession {
                host_id,
                timeout_seconds: config.agent_restart_timeout_seconds,
            },
        ],
        JobClass::InstallHostPackages => vec![
            Step::InstallPackages {
                host_id,
                packages: host
                    .server_profile
                    .packages()
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            },
            Step::RebootIfRequired {
                host_id,
                timeout_seconds: config.installation_reboot_timeout_seconds,
            },
        ],
        JobClass::SetupHost | JobClass::SetupMonitoredHost | JobClass::SetupWorker => {
            vec![agent(
                "setup_server",
                json!({ "profile": profile_name(host.server_profile) }),
            )]
        }
        JobClass::RemoveHost => vec![agent("deregister_server", json!({}))],
        JobClass::RemoveUnconfiguredHost => Vec::new(),
        JobClass::ForceRemoveHost => vec![Step::ForceRemoveHost { host_id }],
        JobClass::RebootHost => vec![Step::Reboot {
            host_id,
            timeout_seconds: config.agent_restart_timeout_seconds,
        }],
        JobClass::ShutdownHost => vec![agent("shutdown_server", json!({}))],
        JobClass::MountClient => {
            let filesystems: Vec<_> = cache
                .host_client_mounts(host_id)
                .into_iter()
                .filter(|m| m.header.state == "unmounted")
                .map(|m| {
                    json!({
                        "mountspec": client::mountspec(cache, m.filesystem_id),
                        "mountpoint": m.mountpoint,
                    })
                })
                .collect();
            vec![agent("mount_lustre_filesystems", json!({ "filesystems": filesystems }))]
        }
        JobClass::UnmountClient => {
            let mountpoints: Vec<_> = cache
                .host_client_mounts(host_id)
                .into_iter()
                .filter(|m| m.header.state == "mounted")
                .map(|m| m.mountpoint)
                .collect();
            vec![agent("unmount_lustre_filesystems", json!({ "mountpoints": mountpoints }))]
        }
        other => {
            return Err(StepError::PreconditionFailure(format!(
                "{other} does not run on hosts"
            )))
        }
    };
    Ok(steps)
}

const fn profile_name(profile: ServerProfile) -> &'static str {
    match profile {
        ServerProfile::Managed => "managed",
        ServerProfile::Monitored => "monitored",
        ServerProfile::Worker => "worker",
    }
}

pub(super) fn on_success(job: Job, cache: &ObjectCache, now: DateTime<Utc>) -> Vec<Entity> {
    match job.class {
        JobClass::RemoveHost | JobClass::RemoveUnconfiguredHost => {
            removal_cascade(cache, job.id, now, false)
        }
        _ => Vec::new(),
    }
}

/// Entities whose jobs a forced removal of `host_id` cancels.
pub(super) fn force_remove_scope(host_id: EntityId, cache: &ObjectCache) -> Vec<EntityRef> {
    let mut scope = vec![EntityRef::new(ClassTag::Host, host_id)];
    scope.extend(cache.host_configs(host_id));
    scope.extend(crate::classes::dependents_of_host(cache, host_id));
    scope
}

/// Records to write when `host_id` leaves the manager.
///
/// An orderly removal has already torn down targets and configuration, so
/// it only retires the host's own records. A forced removal also takes
/// down everything that can no longer exist without the host: targets with
/// no other server, the filesystems of a lost MGS, and the host's clients.
pub(crate) fn removal_cascade(
    cache: &ObjectCache,
    host_id: EntityId,
    now: DateTime<Utc>,
    force: bool,
) -> Vec<Entity> {
    let mut out: BTreeMap<EntityRef, Entity> = BTreeMap::new();
    let mut retire = |mut entity: Entity, state: Option<&str>| {
        match (state, entity.header_mut()) {
            (Some(state), Some(header)) => header.set_state(state, now),
            _ => entity.mark_deleted(),
        }
        out.insert(entity.entity_ref(), entity);
    };

    if force {
        if let Some(host) = cache.host(host_id) {
            retire(host.into(), Some(STATE_REMOVED));
        }
    }
    for config in cache.host_configs(host_id) {
        if let Some(entity) = cache.get(config) {
            retire(entity, None);
        }
    }
    for mount in cache.host_target_mounts(host_id) {
        retire(mount.into(), None);
    }
    for node in cache.host_volume_nodes(host_id) {
        let volume_id = node.volume_id;
        retire(node.into(), None);
        let others_remain = cache
            .volume_nodes(volume_id)
            .iter()
            .any(|n| n.host_id != host_id);
        if !others_remain {
            if let Some(volume) = cache.volume(volume_id) {
                retire(volume.into(), None);
            }
        }
    }

    if force {
        for target in cache.host_targets(host_id) {
            let stranded = cache
                .target_mounts(target.header.id)
                .iter()
                .all(|m| m.host_id == host_id);
            if !stranded {
                continue;
            }
            if matches!(target.role, lustre_manager_store::TargetRole::Mgs { .. }) {
                for filesystem in cache.mgs_filesystems(target.header.id) {
                    for member in cache.fs_targets(filesystem.header.id) {
                        for mount in cache.target_mounts(member.header.id) {
                            retire(mount.into(), None);
                        }
                        retire(member.into(), Some(STATE_REMOVED));
                    }
                    for client in cache.fs_client_mounts(filesystem.header.id) {
                        retire(client.into(), Some(STATE_REMOVED));
                    }
                    retire(filesystem.into(), Some(STATE_REMOVED));
                }
            }
            for mount in cache.target_mounts(target.header.id) {
                retire(mount.into(), None);
            }
            retire(target.into(), Some(STATE_REMOVED));
        }
        for client in cache.host_client_mounts(host_id) {
            retire(client.into(), Some(STATE_REMOVED));
        }
        for copytool in cache.host_copytools(host_id) {
            retire(copytool.into(), Some(STATE_REMOVED));
        }
    }

    out.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::fixtures;

    #[test]
    fn setup_host_needs_every_service() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let job = Job::new(JobClass::SetupHost, layout.host_id);
        let deps = job.deps(&cache);
        let items: Vec<_> = deps.leaves().iter().map(|d| d.item.class).collect();
        assert_eq!(
            items,
            [
                ClassTag::NtpConfiguration,
                ClassTag::CorosyncConfiguration,
                ClassTag::PacemakerConfiguration,
                ClassTag::LnetConfiguration,
            ]
        );
    }

    #[test]
    fn install_packages_then_reboot_if_required() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let steps = Job::new(JobClass::InstallHostPackages, layout.host_id)
            .steps(&cache, &SchedulerConfig::default())
            .unwrap();
        assert!(matches!(steps[0], Step::InstallPackages { .. }));
        assert!(matches!(steps[1], Step::RebootIfRequired { timeout_seconds, .. }
            if timeout_seconds == SchedulerConfig::default().installation_reboot_timeout_seconds));
    }

    #[test]
    fn forced_removal_strands_single_server_filesystem() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let writes = removal_cascade(&cache, layout.host_id, Utc::now(), true);

        let state_of = |item: EntityRef| {
            writes
                .iter()
                .find(|e| e.entity_ref() == item)
                .and_then(|e| e.state().map(str::to_string))
        };
        assert_eq!(
            state_of(EntityRef::new(ClassTag::Host, layout.host_id)).as_deref(),
            Some("removed")
        );
        assert_eq!(
            state_of(EntityRef::new(ClassTag::Target, layout.ost_id)).as_deref(),
            Some("removed")
        );
        assert_eq!(
            state_of(EntityRef::new(ClassTag::Filesystem, layout.filesystem_id)).as_deref(),
            Some("removed")
        );
        assert!(writes.iter().all(|e| !e.not_deleted()));
    }

    #[test]
    fn orderly_removal_keeps_host_state_to_scheduler() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let writes = removal_cascade(&cache, layout.host_id, Utc::now(), false);
        assert!(!writes.iter().any(|e| e.class() == ClassTag::Host));
        assert!(writes.iter().any(|e| e.class() == ClassTag::LnetConfiguration));
    }
}
