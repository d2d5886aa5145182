//! Per-class state machines and the user-facing listings derived from them.
//!
//! Each stateful class declares its states and the jobs that move between
//! them. Routes between two states are found by breadth-first search over
//! the declared transitions, taking transitions in declaration order, so the
//! shortest route is chosen and ties are broken deterministically.

use std::collections::{HashMap, VecDeque};

use lustre_manager_core::ClassTag;
use lustre_manager_store::{Entity, STATE_FORGOTTEN};
use serde::Serialize;
use serde_json::Value;

use crate::classes;
use crate::jobs::{Job, JobClass};
use crate::lock_cache::LockCache;
use crate::object_cache::ObjectCache;

/// One declared transition: running `job` moves an entity from `from` to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionSpec {
    /// Begin state.
    pub from: &'static str,
    /// End state.
    pub to: &'static str,
    /// Job performing the transition.
    pub job: JobClass,
    /// User-visible verb; `None` hides the transition from listings.
    pub verb: Option<&'static str>,
}

/// Shorthand for declaring a [`TransitionSpec`].
#[must_use]
pub const fn transition(
    from: &'static str,
    to: &'static str,
    job: JobClass,
    verb: Option<&'static str>,
) -> TransitionSpec {
    TransitionSpec {
        from,
        to,
        job,
        verb,
    }
}

/// The declared states and transitions of a stateful class.
#[derive(Debug)]
pub struct StateMachine {
    /// Class the machine belongs to.
    pub class: ClassTag,
    /// Declared states.
    pub states: &'static [&'static str],
    /// State of newly created entities.
    pub initial_state: &'static str,
    /// Declared transitions, in preference order.
    pub transitions: &'static [TransitionSpec],
}

impl StateMachine {
    /// The declared spelling of `state`, if it is declared.
    #[must_use]
    pub fn canonical(&self, state: &str) -> Option<&'static str> {
        self.states.iter().copied().find(|s| *s == state)
    }

    /// Transitions leaving `state`, in declaration order.
    pub fn transitions_from<'a>(
        &'a self,
        state: &'a str,
    ) -> impl Iterator<Item = &'static TransitionSpec> + 'a {
        self.transitions.iter().filter(move |t| t.from == state)
    }

    /// Shortest route from `from` to `to`.
    ///
    /// Returns an empty route when the states are equal and `None` when `to`
    /// is unreachable.
    #[must_use]
    pub fn route(&self, from: &str, to: &str) -> Option<Vec<&'static TransitionSpec>> {
        if from == to {
            return Some(Vec::new());
        }
        let start = self.canonical(from)?;
        let mut came_from: HashMap<&'static str, &'static TransitionSpec> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(state) = queue.pop_front() {
            for t in self.transitions_from(state) {
                if t.to == start || came_from.contains_key(t.to) {
                    continue;
                }
                came_from.insert(t.to, t);
                if t.to == to {
                    let mut route = vec![t];
                    let mut at = t.from;
                    while at != start {
                        let Some(&prev) = came_from.get(at) else { break };
                        route.push(prev);
                        at = prev.from;
                    }
                    route.reverse();
                    return Some(route);
                }
                queue.push_back(t.to);
            }
        }
        None
    }
}

/// State machine of a class, if the class is stateful.
#[must_use]
pub fn machine(class: ClassTag) -> Option<&'static StateMachine> {
    classes::machine(class)
}

/// A job that can be run on an entity outside of state transitions.
#[derive(Debug)]
pub struct AdvertisedJob {
    /// Job class.
    pub job: JobClass,
    /// User-visible verb.
    pub verb: &'static str,
    /// Longer explanation shown next to the verb.
    pub long_description: &'static str,
    /// Whether the job can run on this entity now.
    pub can_run: fn(&ObjectCache, &Entity) -> bool,
}

/// An entry of [`available_transitions`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailableTransition {
    /// State the transition ends in.
    pub state: String,
    /// User-visible verb.
    pub verb: String,
}

/// An entry of [`available_jobs`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableJob {
    /// User-visible verb.
    pub verb: String,
    /// Longer explanation.
    pub long_description: String,
    /// Class name to pass to `run_jobs`.
    pub class_name: String,
    /// Arguments to pass to `run_jobs`.
    pub args: Value,
    /// Prompt to show before running, for destructive jobs.
    pub confirmation: Option<String>,
}

/// States an entity can be moved to by one advertised transition.
///
/// Entities locked by an incomplete job advertise nothing.
#[must_use]
pub fn available_transitions(
    cache: &ObjectCache,
    locks: &LockCache,
    entity: &Entity,
) -> Vec<AvailableTransition> {
    let (Some(machine), Some(state)) = (machine(entity.class()), entity.state()) else {
        return Vec::new();
    };
    if locks.get_latest_write(entity.entity_ref(), None).is_some() {
        return Vec::new();
    }

    let mut out: Vec<AvailableTransition> = Vec::new();
    for t in machine.transitions_from(state) {
        let Some(verb) = t.verb else { continue };
        if !transition_visible(cache, entity, t) || out.iter().any(|a| a.state == t.to) {
            continue;
        }
        out.push(AvailableTransition {
            state: t.to.to_string(),
            verb: verb.to_string(),
        });
    }
    out
}

fn transition_visible(cache: &ObjectCache, entity: &Entity, t: &TransitionSpec) -> bool {
    let immutable = entity.header().is_some_and(|h| h.immutable_state);
    if immutable != (t.to == STATE_FORGOTTEN) {
        return false;
    }
    classes::transition_visible(cache, entity, t)
}

/// Non-transition jobs that can run on an entity now.
#[must_use]
pub fn available_jobs(cache: &ObjectCache, locks: &LockCache, entity: &Entity) -> Vec<AvailableJob> {
    if locks.get_latest_write(entity.entity_ref(), None).is_some() {
        return Vec::new();
    }
    classes::advertised_jobs(entity.class())
        .iter()
        .filter(|a| (a.can_run)(cache, entity))
        .map(|a| {
            let job = Job::new(a.job, entity.id());
            AvailableJob {
                verb: a.verb.to_string(),
                long_description: a.long_description.to_string(),
                class_name: a.job.name().to_string(),
                args: job.args(),
                confirmation: job.confirmation_prompt(cache),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::fixtures;

    #[test]
    fn host_route_to_managed() {
        let host = machine(ClassTag::Host).unwrap();
        let route = host.route("undeployed", "managed").unwrap();
        let jobs: Vec<&str> = route.iter().map(|t| t.job.name()).collect();
        assert_eq!(jobs, ["DeployHost", "InstallHostPackages", "SetupHost"]);
    }

    #[test]
    fn route_prefers_declaration_order_on_ties() {
        let fs = machine(ClassTag::Filesystem).unwrap();
        let route = fs.route("available", "removed").unwrap();
        let jobs: Vec<&str> = route.iter().map(|t| t.job.name()).collect();
        assert_eq!(jobs, ["StopFilesystem", "RemoveFilesystem"]);
    }

    #[test]
    fn stopped_filesystem_can_be_marked_unavailable() {
        let fs = machine(ClassTag::Filesystem).unwrap();
        let route = fs.route("stopped", "unavailable").unwrap();
        let jobs: Vec<&str> = route.iter().map(|t| t.job.name()).collect();
        assert_eq!(jobs, ["MakeStoppedFilesystemUnavailable"]);
        let back = fs.route("unavailable", "stopped").unwrap();
        assert_eq!(back[0].job.name(), "StopUnavailableFilesystem");

        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let mut filesystem = cache.filesystem(layout.filesystem_id).unwrap();
        filesystem.header.state = "stopped".to_string();
        let listed = available_transitions(&cache, &LockCache::new(), &filesystem.into());
        let unavailable = listed.iter().find(|t| t.state == "unavailable").unwrap();
        assert_eq!(unavailable.verb, "Mark unavailable");
    }

    #[test]
    fn unreachable_and_identity_routes() {
        let lnet = machine(ClassTag::LnetConfiguration).unwrap();
        assert!(lnet.route("lnet_up", "lnet_up").unwrap().is_empty());
        assert!(lnet.route("lnet_up", "bogus").is_none());
        assert_eq!(lnet.route("unconfigured", "lnet_up").unwrap().len(), 3);
    }

    #[test]
    fn every_transition_uses_declared_states() {
        for class in ClassTag::ALL {
            let Some(m) = machine(class) else { continue };
            assert!(m.canonical(m.initial_state).is_some(), "{class:?}");
            for t in m.transitions {
                assert!(m.canonical(t.from).is_some(), "{class:?} {}", t.from);
                assert!(m.canonical(t.to).is_some(), "{class:?} {}", t.to);
                assert_eq!(t.job.subject_class(), class, "{}", t.job.name());
            }
        }
    }

    #[test]
    fn host_transitions_follow_profile() {
        let cache = ObjectCache::new();
        let host = fixtures::host(1, "h1.example.com", "packages_installed");
        cache.add(host.clone().into());
        let listed = available_transitions(&cache, &LockCache::new(), &host.into());
        let states: Vec<&str> = listed.iter().map(|t| t.state.as_str()).collect();
        assert_eq!(states, ["managed", "removed"]);
    }

    #[test]
    fn locked_entities_advertise_nothing() {
        let cache = ObjectCache::new();
        let host = fixtures::host(1, "h1.example.com", "managed");
        cache.add(host.clone().into());
        let locks = LockCache::new();
        let entity: Entity = host.into();
        assert!(!available_transitions(&cache, &locks, &entity).is_empty());

        locks.add(lustre_manager_store::StateLock::write(
            lustre_manager_core::JobId::new(1),
            entity.entity_ref(),
            "managed",
            "removed",
        ));
        assert!(available_transitions(&cache, &locks, &entity).is_empty());
        assert!(available_jobs(&cache, &locks, &entity).is_empty());
    }

    #[test]
    fn immutable_entities_can_only_be_forgotten() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let mut target = cache.target(layout.ost_id).unwrap();
        target.header.immutable_state = true;
        let listed = available_transitions(&cache, &LockCache::new(), &target.into());
        let states: Vec<&str> = listed.iter().map(|t| t.state.as_str()).collect();
        assert_eq!(states, ["forgotten"]);
    }
}
