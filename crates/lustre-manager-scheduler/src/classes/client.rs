//! Client-side classes: Lustre client mounts and HSM copytools.

use lustre_manager_core::{ClassTag, EntityRef};
use lustre_manager_store::{ClientMount, Copytool};

use crate::deps::{DependOn, Dependency};
use crate::jobs::JobClass;
use crate::object_cache::ObjectCache;
use crate::registry::{transition, StateMachine};

pub static CLIENT_MOUNT_MACHINE: StateMachine = StateMachine {
    class: ClassTag::ClientMount,
    states: &["unmounted", "mounted", "removed"],
    initial_state: "unmounted",
    transitions: &[
        transition("unmounted", "mounted", JobClass::MountLustreClient, Some("Mount")),
        transition("mounted", "unmounted", JobClass::UnmountLustreClient, Some("Unmount")),
        transition("unmounted", "removed", JobClass::RemoveLustreClient, Some("Remove")),
    ],
};

pub static COPYTOOL_MACHINE: StateMachine = StateMachine {
    class: ClassTag::Copytool,
    states: &["stopped", "started", "removed"],
    initial_state: "stopped",
    transitions: &[
        transition("stopped", "started", JobClass::StartCopytool, Some("Start")),
        transition("started", "stopped", JobClass::StopCopytool, Some("Stop")),
        transition("stopped", "removed", JobClass::RemoveCopytool, Some("Remove")),
    ],
};

pub fn client_mount_state_deps(cache: &ObjectCache, mount: &ClientMount, state: &str) -> Dependency {
    let host = EntityRef::new(ClassTag::Host, mount.host_id);
    let filesystem = EntityRef::new(ClassTag::Filesystem, mount.filesystem_id);
    let mut deps = vec![
        DependOn::except(host, "working", &["removed"]).fix("removed"),
        DependOn::except(filesystem, "available", &["removed", "forgotten"]).fix("removed"),
    ];
    if state == "mounted" {
        deps.push(DependOn::new(filesystem, "available").fix("unmounted"));
        if let Some(lnet) = cache.host_config(mount.host_id, ClassTag::LnetConfiguration) {
            deps.push(DependOn::new(lnet, "lnet_up").fix("unmounted"));
        }
    }
    Dependency::all(deps)
}

pub fn copytool_state_deps(copytool: &Copytool, state: &str) -> Dependency {
    let host = EntityRef::new(ClassTag::Host, copytool.host_id);
    let mut deps = vec![DependOn::except(host, "working", &["removed"]).fix("removed")];
    if let (Some(mount_id), "started") = (copytool.client_mount_id, state) {
        let mount = EntityRef::new(ClassTag::ClientMount, mount_id);
        deps.push(DependOn::new(mount, "mounted").fix("stopped"));
    }
    Dependency::all(deps)
}

pub fn client_mount_dependents(cache: &ObjectCache, mount: &ClientMount) -> Vec<EntityRef> {
    cache
        .client_mount_copytools(mount.header.id)
        .into_iter()
        .map(|c| EntityRef::new(ClassTag::Copytool, c.header.id))
        .collect()
}
