use lustre_manager_core::{ClassTag, EntityRef};
use lustre_manager_store::{Entity, Target, TargetRole};

use crate::deps::{DependOn, Dependency};
use crate::jobs::JobClass;
use crate::object_cache::ObjectCache;
use crate::registry::{transition, AdvertisedJob, StateMachine};

pub static MACHINE: StateMachine = StateMachine {
    class: ClassTag::Target,
    states: &[
        "unformatted",
        "formatted",
        "registered",
        "unmounted",
        "mounted",
        "removed",
        "forgotten",
    ],
    initial_state: "unformatted",
    transitions: &[
        transition("unformatted", "formatted", JobClass::FormatTarget, None),
        transition("formatted", "registered", JobClass::RegisterTarget, None),
        transition("registered", "unmounted", JobClass::ConfigureTarget, None),
        transition("unmounted", "mounted", JobClass::StartTarget, Some("Start")),
        transition("mounted", "unmounted", JobClass::StopTarget, Some("Stop")),
        transition("unmounted", "removed", JobClass::RemoveConfiguredTarget, Some("Remove")),
        transition("unformatted", "removed", JobClass::RemoveTarget, Some("Remove")),
        transition("formatted", "removed", JobClass::RemoveTarget, Some("Remove")),
        transition("registered", "removed", JobClass::RemoveTarget, Some("Remove")),
        transition("unformatted", "forgotten", JobClass::ForgetTarget, Some("Forget")),
        transition("formatted", "forgotten", JobClass::ForgetTarget, Some("Forget")),
        transition("registered", "forgotten", JobClass::ForgetTarget, Some("Forget")),
        transition("unmounted", "forgotten", JobClass::ForgetTarget, Some("Forget")),
        transition("mounted", "forgotten", JobClass::ForgetTarget, Some("Forget")),
    ],
};

pub static ADVERTISED: &[AdvertisedJob] = &[
    AdvertisedJob {
        job: JobClass::FailoverTarget,
        verb: "Failover",
        long_description: "Move the target to its secondary server.",
        can_run: can_failover,
    },
    AdvertisedJob {
        job: JobClass::FailbackTarget,
        verb: "Failback",
        long_description: "Move the target back to its primary server.",
        can_run: can_failback,
    },
];

fn active_is_primary(cache: &ObjectCache, target: &Target) -> Option<bool> {
    let active = cache.target_mount(target.active_mount_id?)?;
    Some(active.primary)
}

fn can_failover(cache: &ObjectCache, entity: &Entity) -> bool {
    let Some(target) = entity.as_target() else {
        return false;
    };
    target.header.state == "mounted"
        && active_is_primary(cache, target) == Some(true)
        && cache
            .target_mounts(target.header.id)
            .iter()
            .any(|m| !m.primary)
}

fn can_failback(cache: &ObjectCache, entity: &Entity) -> bool {
    let Some(target) = entity.as_target() else {
        return false;
    };
    target.header.state == "mounted" && active_is_primary(cache, target) == Some(false)
}

/// The state a target follows a vanished owner into.
const fn decommission_state(target: &Target) -> &'static str {
    if target.header.immutable_state {
        "forgotten"
    } else {
        "removed"
    }
}

pub fn state_deps(cache: &ObjectCache, target: &Target, state: &str) -> Dependency {
    let fix = decommission_state(target);
    let mut deps = Vec::new();

    if state == "mounted" && !target.header.immutable_state {
        let host = cache
            .target_active_host(target.header.id)
            .or_else(|| cache.target_primary_host(target.header.id));
        if let Some(lnet) =
            host.and_then(|h| cache.host_config(h.header.id, ClassTag::LnetConfiguration))
        {
            deps.push(DependOn::new(lnet, "lnet_up").fix("unmounted"));
        }
    }

    if let Some(filesystem_id) = target.role.filesystem_id() {
        let filesystem = EntityRef::new(ClassTag::Filesystem, filesystem_id);
        deps.push(DependOn::except(filesystem, "available", &["removed", "forgotten"]).fix(fix));
    }

    for mount in cache.target_mounts(target.header.id) {
        let host = EntityRef::new(ClassTag::Host, mount.host_id);
        deps.push(DependOn::except(host, "managed", &["removed"]).fix(fix));
    }

    Dependency::all(deps)
}

pub fn dependents(cache: &ObjectCache, target: &Target) -> Vec<EntityRef> {
    match target.role {
        TargetRole::Mgs { .. } => cache
            .mgs_filesystems(target.header.id)
            .into_iter()
            .map(|f| EntityRef::new(ClassTag::Filesystem, f.header.id))
            .collect(),
        TargetRole::Mdt { .. } | TargetRole::Ost { .. } => Vec::new(),
    }
}
