use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use lustre_manager_store::{Entity, Target, TargetMount, TargetRole};

use super::{Job, JobClass, LockSpec};
use crate::deps::{DependOn, Dependency};
use crate::error::StepError;
use crate::object_cache::ObjectCache;
use crate::steps::Step;

pub(super) fn description(job: Job, subject: &Entity) -> String {
    let label = subject.label();
    match job.class {
        JobClass::FormatTarget => format!("Format {label}"),
        JobClass::RegisterTarget => format!("Register {label}"),
        JobClass::ConfigureTarget => format!("Configure {label} mount points"),
        JobClass::StartTarget => format!("Start target {label}"),
        JobClass::StopTarget => format!("Stop target {label}"),
        JobClass::RemoveConfiguredTarget | JobClass::RemoveTarget => {
            format!("Remove target {label} from configuration")
        }
        JobClass::ForgetTarget => format!("Forget target {label}"),
        JobClass::FailoverTarget => format!("Failover target {label}"),
        JobClass::FailbackTarget => format!("Failback target {label}"),
        other => format!("{other} on {label}"),
    }
}

fn lnet_of(cache: &ObjectCache, host_id: EntityId) -> Option<EntityRef> {
    cache.host_config(host_id, ClassTag::LnetConfiguration)
}

fn mgs_of(cache: &ObjectCache, target: &Target) -> Option<EntityRef> {
    let filesystem = cache.filesystem(target.role.filesystem_id()?)?;
    Some(EntityRef::new(ClassTag::Target, filesystem.mgs_id))
}

fn primary_mount(cache: &ObjectCache, target_id: EntityId) -> Option<TargetMount> {
    cache
        .target_mounts(target_id)
        .into_iter()
        .find(|m| m.primary)
}

fn first_secondary(cache: &ObjectCache, target_id: EntityId) -> Option<TargetMount> {
    cache
        .target_mounts(target_id)
        .into_iter()
        .find(|m| !m.primary)
}

pub(super) fn deps(job: Job, cache: &ObjectCache, subject: &Entity) -> Dependency {
    let Some(target) = subject.as_target() else {
        return Dependency::none();
    };
    let primary_lnet = cache
        .target_primary_host(target.header.id)
        .and_then(|h| lnet_of(cache, h.header.id));

    match job.class {
        JobClass::FormatTarget => Dependency::all(
            primary_lnet.map(|lnet| DependOn::any_of(lnet, "lnet_down", &["lnet_up"])),
        ),
        JobClass::RegisterTarget => {
            let mut leaves: Vec<_> = primary_lnet
                .map(|lnet| DependOn::new(lnet, "lnet_up"))
                .into_iter()
                .collect();
            leaves.extend(mgs_of(cache, target).map(|mgs| DependOn::new(mgs, "mounted")));
            Dependency::all(leaves)
        }
        JobClass::ConfigureTarget => Dependency::all(
            cache
                .target_mounts(target.header.id)
                .iter()
                .filter_map(|m| cache.host_config(m.host_id, ClassTag::PacemakerConfiguration))
                .map(|pacemaker| DependOn::new(pacemaker, "started")),
        ),
        JobClass::StartTarget => Dependency::any(
            cache
                .target_mounts(target.header.id)
                .iter()
                .filter_map(|m| lnet_of(cache, m.host_id))
                .map(|lnet| DependOn::new(lnet, "lnet_up")),
        ),
        JobClass::FailoverTarget => Dependency::all(
            first_secondary(cache, target.header.id)
                .and_then(|m| lnet_of(cache, m.host_id))
                .map(|lnet| DependOn::new(lnet, "lnet_up")),
        ),
        JobClass::FailbackTarget => Dependency::all(
            primary_lnet.map(|lnet| DependOn::new(lnet, "lnet_up")),
        ),
        _ => Dependency::none(),
    }
}

pub(super) fn create_locks(job: Job, _cache: &ObjectCache) -> Vec<LockSpec> {
    match job.class {
        JobClass::FailoverTarget | JobClass::FailbackTarget => {
            vec![LockSpec::hold(job.subject(), "mounted")]
        }
        _ => Vec::new(),
    }
}

pub(super) fn steps(job: Job, cache: &ObjectCache, subject: &Entity) -> Result<Vec<Step>, StepError> {
    let target = subject
        .as_target()
        .ok_or_else(|| StepError::PreconditionFailure(format!("{} is not a target", job.subject())))?;
    let target_id = target.header.id;
    let mut mounts = cache.target_mounts(target_id);

    let steps = match job.class {
        JobClass::FormatTarget => vec![Step::FormatTarget { target_id }],
        JobClass::RegisterTarget => vec![Step::RegisterTarget { target_id }],
        JobClass::ConfigureTarget => mounts
            .iter()
            .map(|m| Step::ConfigureTargetHa {
                target_mount_id: m.id,
            })
            .collect(),
        JobClass::StartTarget => vec![Step::StartTarget { target_id }],
        JobClass::StopTarget => vec![Step::StopTarget { target_id }],
        JobClass::RemoveConfiguredTarget => {
            mounts.reverse();
            mounts
                .iter()
                .map(|m| Step::UnconfigureTargetHa {
                    target_mount_id: m.id,
                })
                .collect()
        }
        JobClass::RemoveTarget | JobClass::ForgetTarget => Vec::new(),
        JobClass::FailoverTarget => {
            let destination = first_secondary(cache, target_id).ok_or_else(|| {
                StepError::PreconditionFailure(format!("{} has no secondary server", subject.label()))
            })?;
            vec![Step::MoveTarget {
                target_id,
                target_mount_id: destination.id,
                failback: false,
            }]
        }
        JobClass::FailbackTarget => {
            let destination = primary_mount(cache, target_id).ok_or_else(|| {
                StepError::PreconditionFailure(format!("{} has no primary server", subject.label()))
            })?;
            vec![Step::MoveTarget {
                target_id,
                target_mount_id: destination.id,
                failback: true,
            }]
        }
        other => {
            return Err(StepError::PreconditionFailure(format!(
                "{other} does not run on targets"
            )))
        }
    };
    Ok(steps)
}

pub(super) fn on_success(job: Job, cache: &ObjectCache) -> Vec<Entity> {
    match job.class {
        JobClass::RemoveConfiguredTarget | JobClass::RemoveTarget | JobClass::ForgetTarget => cache
            .target_mounts(job.id)
            .into_iter()
            .map(|mut m| {
                m.not_deleted = false;
                Entity::from(m)
            })
            .collect(),
        JobClass::StopTarget => cache
            .target(job.id)
            .map(|mut t| {
                t.active_mount_id = None;
                Entity::from(t)
            })
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

/// Label Lustre gives a target once it is registered with its MGS.
pub(crate) fn expected_label(cache: &ObjectCache, target: &Target) -> String {
    match target.role {
        TargetRole::Mgs { .. } => "MGS".to_string(),
        TargetRole::Mdt {
            filesystem_id,
            index,
        } => {
            let fsname = cache.filesystem(filesystem_id).map(|f| f.name).unwrap_or_default();
            format!("{fsname}-MDT{index:04x}")
        }
        TargetRole::Ost {
            filesystem_id,
            index,
        } => {
            let fsname = cache.filesystem(filesystem_id).map(|f| f.name).unwrap_or_default();
            format!("{fsname}-OST{index:04x}")
        }
    }
}
