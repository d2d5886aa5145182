use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use lustre_manager_store::Entity;
use serde_json::json;

use super::{Job, JobClass};
use crate::deps::{DependOn, Dependency};
use crate::object_cache::ObjectCache;
use crate::steps::Step;

pub(super) fn description(job: Job, subject: &Entity) -> String {
    let label = subject.label();
    match job.class {
        JobClass::MountLustreClient => format!("Mount Lustre client at {label}"),
        JobClass::UnmountLustreClient => format!("Unmount Lustre client at {label}"),
        JobClass::RemoveLustreClient => format!("Remove Lustre client mount {label}"),
        JobClass::StartCopytool => format!("Start copytool {label}"),
        JobClass::StopCopytool => format!("Stop copytool {label}"),
        JobClass::RemoveCopytool => format!("Remove copytool {label}"),
        other => format!("{other} on {label}"),
    }
}

pub(super) fn deps(job: Job, cache: &ObjectCache, subject: &Entity) -> Dependency {
    match (job.class, subject) {
        (JobClass::MountLustreClient, Entity::ClientMount(mount)) => {
            let mut leaves = vec![DependOn::new(
                EntityRef::new(ClassTag::Filesystem, mount.filesystem_id),
                "available",
            )];
            leaves.extend(
                cache
                    .host_config(mount.host_id, ClassTag::LnetConfiguration)
                    .map(|lnet| DependOn::new(lnet, "lnet_up")),
            );
            Dependency::all(leaves)
        }
        (JobClass::StartCopytool, Entity::Copytool(copytool)) => Dependency::all(
            copytool
                .client_mount_id
                .map(|id| DependOn::new(EntityRef::new(ClassTag::ClientMount, id), "mounted")),
        ),
        _ => Dependency::none(),
    }
}

pub(super) fn steps(job: Job, cache: &ObjectCache, subject: &Entity) -> Vec<Step> {
    let agent = |host_id: EntityId, action: &str, args: serde_json::Value| Step::AgentAction {
        host_id,
        action: action.to_string(),
        args,
    };
    match (job.class, subject) {
        (JobClass::MountLustreClient, Entity::ClientMount(m)) => vec![agent(
            m.host_id,
            "mount_lustre_filesystem",
            json!({
                "mountspec": mountspec(cache, m.filesystem_id),
                "mountpoint": m.mountpoint,
            }),
        )],
        (JobClass::UnmountLustreClient, Entity::ClientMount(m)) => vec![agent(
            m.host_id,
            "unmount_lustre_filesystem",
            json!({ "mountpoint": m.mountpoint }),
        )],
        (JobClass::StartCopytool, Entity::Copytool(c)) => {
            let mountpoint = c
                .client_mount_id
                .and_then(|id| cache.client_mount(id))
                .map(|m| m.mountpoint);
            vec![agent(
                c.host_id,
                "start_copytool",
                json!({
                    "id": c.header.id.get(),
                    "bin_path": c.bin_path,
                    "archive": c.archive,
                    "mountpoint": mountpoint,
                }),
            )]
        }
        (JobClass::StopCopytool, Entity::Copytool(c)) => vec![agent(
            c.host_id,
            "stop_copytool",
            json!({ "id": c.header.id.get() }),
        )],
        (JobClass::RemoveCopytool, Entity::Copytool(c)) => vec![agent(
            c.host_id,
            "unconfigure_copytool",
            json!({ "id": c.header.id.get() }),
        )],
        _ => Vec::new(),
    }
}

/// NIDs of every server that can run the MGS, in `nid,nid:nid` form.
///
/// Servers are separated by `:` with the primary first; a server's own
/// NIDs are separated by `,`.
pub(crate) fn mgs_nid_spec(cache: &ObjectCache, mgs_id: EntityId) -> String {
    cache
        .target_mounts(mgs_id)
        .iter()
        .filter_map(|m| cache.host_config(m.host_id, ClassTag::LnetConfiguration))
        .filter_map(|lnet| cache.get(lnet))
        .filter_map(|e| e.as_lnet().map(|l| l.nids.join(",")))
        .filter(|nids| !nids.is_empty())
        .collect::<Vec<_>>()
        .join(":")
}

/// Client mount source for a filesystem: `<mgs nids>:/<fsname>`.
pub(crate) fn mountspec(cache: &ObjectCache, filesystem_id: EntityId) -> String {
    let Some(filesystem) = cache.filesystem(filesystem_id) else {
        return String::new();
    };
    format!("{}:/{}", mgs_nid_spec(cache, filesystem.mgs_id), filesystem.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::fixtures;
    use lustre_manager_store::LnetConfiguration;

    #[test]
    fn mountspec_uses_mgs_nids() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let mut lnet: LnetConfiguration = cache
            .get(EntityRef::new(ClassTag::LnetConfiguration, layout.lnet_id))
            .and_then(|e| e.as_lnet().cloned())
            .unwrap();
        lnet.nids = vec!["10.0.0.1@tcp0".into(), "192.168.0.1@o2ib0".into()];
        cache.update(lnet.into());

        assert_eq!(
            mountspec(&cache, layout.filesystem_id),
            "10.0.0.1@tcp0,192.168.0.1@o2ib0:/testfs"
        );
    }

    #[test]
    fn copytool_start_needs_mounted_client() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let (mount_id, copytool_id) = fixtures::client_with_copytool(&cache, &layout);
        let deps = Job::new(JobClass::StartCopytool, copytool_id).deps(&cache);
        assert_eq!(
            deps.leaves()[0].item,
            EntityRef::new(ClassTag::ClientMount, mount_id)
        );
    }
}
