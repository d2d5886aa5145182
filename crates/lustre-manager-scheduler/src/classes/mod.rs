//! Stateful entity classes.
//!
//! Each class declares its state machine, the static dependencies of each
//! of its states, the entities whose static dependencies point at it (its
//! dependents), and the non-transition jobs it advertises.

mod client;
mod filesystem;
mod ha;
mod host;
mod target;

use lustre_manager_core::{ClassTag, EntityRef};
use lustre_manager_store::Entity;

use crate::deps::Dependency;
use crate::object_cache::ObjectCache;
use crate::registry::{AdvertisedJob, StateMachine, TransitionSpec};

pub use host::CONFIGURED_STATES;

/// State machine of a stateful class.
#[must_use]
pub fn machine(class: ClassTag) -> Option<&'static StateMachine> {
    match class {
        ClassTag::Host => Some(&host::MACHINE),
        ClassTag::NtpConfiguration => Some(&ha::NTP_MACHINE),
        ClassTag::CorosyncConfiguration => Some(&ha::COROSYNC_MACHINE),
        ClassTag::PacemakerConfiguration => Some(&ha::PACEMAKER_MACHINE),
        ClassTag::LnetConfiguration => Some(&ha::LNET_MACHINE),
        ClassTag::Target => Some(&target::MACHINE),
        ClassTag::Filesystem => Some(&filesystem::MACHINE),
        ClassTag::ClientMount => Some(&client::CLIENT_MOUNT_MACHINE),
        ClassTag::Copytool => Some(&client::COPYTOOL_MACHINE),
        ClassTag::TargetMount | ClassTag::Volume | ClassTag::VolumeNode | ClassTag::ConfParam => {
            None
        }
    }
}

/// What `entity` requires of other entities while it is in `state`.
///
/// Terminal states have no dependencies.
#[must_use]
pub fn state_deps(cache: &ObjectCache, entity: &Entity, state: &str) -> Dependency {
    if lustre_manager_store::is_terminal_state(state) {
        return Dependency::none();
    }
    match entity {
        Entity::PacemakerConfiguration(p) => ha::pacemaker_state_deps(cache, p, state),
        Entity::Target(t) => target::state_deps(cache, t, state),
        Entity::Filesystem(f) => filesystem::state_deps(f),
        Entity::ClientMount(c) => client::client_mount_state_deps(cache, c, state),
        Entity::Copytool(c) => client::copytool_state_deps(c, state),
        _ => Dependency::none(),
    }
}

/// Entities whose static dependencies may refer to `entity`.
#[must_use]
pub fn dependents(cache: &ObjectCache, entity: &Entity) -> Vec<EntityRef> {
    match entity {
        Entity::Host(h) => host::dependents(cache, h.header.id),
        Entity::CorosyncConfiguration(c) => ha::corosync_dependents(cache, c),
        Entity::LnetConfiguration(l) => ha::lnet_dependents(cache, l),
        Entity::Target(t) => target::dependents(cache, t),
        Entity::Filesystem(f) => filesystem::dependents(cache, f),
        Entity::ClientMount(c) => client::client_mount_dependents(cache, c),
        _ => Vec::new(),
    }
}

/// Entities that stop making sense without the host.
#[must_use]
pub fn dependents_of_host(cache: &ObjectCache, host_id: lustre_manager_core::EntityId) -> Vec<EntityRef> {
    host::dependents(cache, host_id)
}

/// Class-specific filtering of advertised transitions.
#[must_use]
pub fn transition_visible(_cache: &ObjectCache, entity: &Entity, t: &TransitionSpec) -> bool {
    match entity {
        Entity::Host(h) => host::transition_visible(h, t),
        _ => true,
    }
}

/// Non-transition jobs a class advertises.
#[must_use]
pub fn advertised_jobs(class: ClassTag) -> &'static [AdvertisedJob] {
    match class {
        ClassTag::Host => host::ADVERTISED,
        ClassTag::Target => target::ADVERTISED,
        _ => &[],
    }
}

/// State newly created entities of `class` start in.
#[must_use]
pub fn initial_state(class: ClassTag) -> &'static str {
    machine(class).map_or("", |m| m.initial_state)
}
