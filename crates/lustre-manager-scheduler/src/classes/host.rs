use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use lustre_manager_store::{Entity, Host};

use crate::jobs::JobClass;
use crate::object_cache::ObjectCache;
use crate::registry::{transition, AdvertisedJob, StateMachine, TransitionSpec};

pub static MACHINE: StateMachine = StateMachine {
    class: ClassTag::Host,
    states: &[
        "undeployed",
        "unconfigured",
        "packages_installed",
        "managed",
        "monitored",
        "working",
        "removed",
    ],
    initial_state: "undeployed",
    transitions: &[
        transition("undeployed", "unconfigured", JobClass::DeployHost, Some("Deploy agent")),
        transition(
            "unconfigured",
            "packages_installed",
            JobClass::InstallHostPackages,
            Some("Install packages"),
        ),
        transition("packages_installed", "managed", JobClass::SetupHost, Some("Set up server")),
        transition(
            "packages_installed",
            "monitored",
            JobClass::SetupMonitoredHost,
            Some("Set up monitored server"),
        ),
        transition("packages_installed", "working", JobClass::SetupWorker, Some("Set up worker")),
        transition("undeployed", "removed", JobClass::RemoveUnconfiguredHost, Some("Remove")),
        transition("unconfigured", "removed", JobClass::RemoveHost, Some("Remove")),
        transition("packages_installed", "removed", JobClass::RemoveHost, Some("Remove")),
        transition("managed", "removed", JobClass::RemoveHost, Some("Remove")),
        transition("monitored", "removed", JobClass::RemoveHost, Some("Remove")),
        transition("working", "removed", JobClass::RemoveHost, Some("Remove")),
    ],
};

/// States in which a host has its agent and packages in place.
pub const CONFIGURED_STATES: [&str; 4] = ["packages_installed", "managed", "monitored", "working"];

const SET_UP_STATES: [&str; 3] = ["managed", "monitored", "working"];

pub static ADVERTISED: &[AdvertisedJob] = &[
    AdvertisedJob {
        job: JobClass::ForceRemoveHost,
        verb: "Force remove",
        long_description: "Remove the server from the manager without contacting it. Use only \
                           when the server is permanently unreachable.",
        can_run: always,
    },
    AdvertisedJob {
        job: JobClass::RebootHost,
        verb: "Reboot",
        long_description: "Reboot the server.",
        can_run: is_set_up,
    },
    AdvertisedJob {
        job: JobClass::ShutdownHost,
        verb: "Shutdown",
        long_description: "Shut the server down.",
        can_run: is_set_up,
    },
    AdvertisedJob {
        job: JobClass::MountClient,
        verb: "Mount Lustre filesystems",
        long_description: "Mount every Lustre filesystem configured on this client.",
        can_run: has_unmounted_clients,
    },
    AdvertisedJob {
        job: JobClass::UnmountClient,
        verb: "Unmount Lustre filesystems",
        long_description: "Unmount every Lustre filesystem mounted on this client.",
        can_run: has_mounted_clients,
    },
];

fn always(_: &ObjectCache, _: &Entity) -> bool {
    true
}

fn is_set_up(_: &ObjectCache, entity: &Entity) -> bool {
    entity.state().is_some_and(|s| SET_UP_STATES.contains(&s))
}

fn has_unmounted_clients(cache: &ObjectCache, entity: &Entity) -> bool {
    entity.state() == Some("working")
        && cache
            .host_client_mounts(entity.id())
            .iter()
            .any(|c| c.header.state == "unmounted")
}

fn has_mounted_clients(cache: &ObjectCache, entity: &Entity) -> bool {
    cache
        .host_client_mounts(entity.id())
        .iter()
        .any(|c| c.header.state == "mounted")
}

/// Setup transitions other than the host's own profile are hidden.
pub fn transition_visible(host: &Host, t: &TransitionSpec) -> bool {
    match t.job {
        JobClass::SetupHost | JobClass::SetupMonitoredHost | JobClass::SetupWorker => {
            t.to == host.server_profile.setup_state()
        }
        _ => true,
    }
}

pub fn dependents(cache: &ObjectCache, host_id: EntityId) -> Vec<EntityRef> {
    let targets = cache
        .host_targets(host_id)
        .into_iter()
        .map(|t| EntityRef::new(ClassTag::Target, t.header.id));
    let clients = cache
        .host_client_mounts(host_id)
        .into_iter()
        .map(|c| EntityRef::new(ClassTag::ClientMount, c.header.id));
    let copytools = cache
        .host_copytools(host_id)
        .into_iter()
        .map(|c| EntityRef::new(ClassTag::Copytool, c.header.id));
    targets.chain(clients).chain(copytools).collect()
}
