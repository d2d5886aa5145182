use lustre_manager_core::{ClassTag, EntityRef};
use lustre_manager_store::Filesystem;

use crate::deps::{DependOn, Dependency};
use crate::jobs::JobClass;
use crate::object_cache::ObjectCache;
use crate::registry::{transition, StateMachine};

pub static MACHINE: StateMachine = StateMachine {
    class: ClassTag::Filesystem,
    states: &["unavailable", "stopped", "available", "removed", "forgotten"],
    initial_state: "unavailable",
    transitions: &[
        transition("unavailable", "available", JobClass::StartUnavailableFilesystem, Some("Start")),
        transition("stopped", "available", JobClass::StartFilesystem, Some("Start")),
        transition("available", "stopped", JobClass::StopFilesystem, Some("Stop")),
        transition("unavailable", "stopped", JobClass::StopUnavailableFilesystem, Some("Stop")),
        transition("available", "unavailable", JobClass::MakeAvailableFilesystemUnavailable, None),
        transition(
            "stopped",
            "unavailable",
            JobClass::MakeStoppedFilesystemUnavailable,
            Some("Mark unavailable"),
        ),
        transition("stopped", "removed", JobClass::RemoveFilesystem, Some("Remove")),
        transition("unavailable", "forgotten", JobClass::ForgetFilesystem, Some("Forget")),
        transition("stopped", "forgotten", JobClass::ForgetFilesystem, Some("Forget")),
        transition("available", "forgotten", JobClass::ForgetFilesystem, Some("Forget")),
    ],
};

/// A filesystem follows its MGS out of existence.
pub fn state_deps(filesystem: &Filesystem) -> Dependency {
    let mgs = EntityRef::new(ClassTag::Target, filesystem.mgs_id);
    let fix = if filesystem.header.immutable_state {
        "forgotten"
    } else {
        "removed"
    };
    DependOn::except(mgs, "mounted", &["removed", "forgotten"])
        .fix(fix)
        .into()
}

pub fn dependents(cache: &ObjectCache, filesystem: &Filesystem) -> Vec<EntityRef> {
    let targets = cache
        .fs_targets(filesystem.header.id)
        .into_iter()
        .map(|t| EntityRef::new(ClassTag::Target, t.header.id));
    let clients = cache
        .fs_client_mounts(filesystem.header.id)
        .into_iter()
        .map(|c| EntityRef::new(ClassTag::ClientMount, c.header.id));
    targets.chain(clients).collect()
}
