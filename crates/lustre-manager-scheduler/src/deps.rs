//! Dependency expressions between entity states.
//!
//! A job or an entity state declares what it needs from other entities as a
//! [`Dependency`] tree. Leaves are [`DependOn`]: "entity X must be in one of
//! these states". The planner satisfies unsatisfied leaves by routing X to
//! `preferred_state`; when X itself moves, dependents whose leaves would be
//! broken are moved to their `fix_state`.

use std::collections::HashMap;

use lustre_manager_core::EntityRef;

use crate::jobs::Job;
use crate::object_cache::ObjectCache;
use crate::registry;

/// "Entity `item` must be in one of `acceptable_states`."
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependOn {
    /// The entity depended upon.
    pub item: EntityRef,
    /// State the planner drives `item` to when the dependency is unmet.
    pub preferred_state: &'static str,
    /// States that satisfy the dependency.
    pub acceptable_states: Vec<&'static str>,
    /// State the dependent moves to if `item` leaves the acceptable set.
    pub fix_state: Option<&'static str>,
}

impl DependOn {
    /// Require exactly `state`.
    #[must_use]
    pub fn new(item: EntityRef, state: &'static str) -> Self {
        Self {
            item,
            preferred_state: state,
            acceptable_states: vec![state],
            fix_state: None,
        }
    }

    /// Accept any of `acceptable`, preferring `preferred`.
    #[must_use]
    pub fn any_of(item: EntityRef, preferred: &'static str, acceptable: &[&'static str]) -> Self {
        let mut acceptable_states = acceptable.to_vec();
        if !acceptable_states.contains(&preferred) {
            acceptable_states.push(preferred);
        }
        Self {
            item,
            preferred_state: preferred,
            acceptable_states,
            fix_state: None,
        }
    }

    /// Accept every declared state of `item`'s class except `unacceptable`.
    #[must_use]
    pub fn except(item: EntityRef, preferred: &'static str, unacceptable: &[&str]) -> Self {
        let acceptable = registry::machine(item.class)
            .map(|m| {
                m.states
                    .iter()
                    .copied()
                    .filter(|s| !unacceptable.contains(s))
                    .collect()
            })
            .unwrap_or_else(|| vec![preferred]);
        Self {
            item,
            preferred_state: preferred,
            acceptable_states: acceptable,
            fix_state: None,
        }
    }

    /// Set the dependent's fix state.
    #[must_use]
    pub fn fix(mut self, fix_state: &'static str) -> Self {
        self.fix_state = Some(fix_state);
        self
    }

    /// Whether `state` satisfies the dependency.
    #[must_use]
    pub fn accepts(&self, state: &str) -> bool {
        self.acceptable_states.iter().any(|s| *s == state)
    }
}

/// A tree of [`DependOn`] leaves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dependency {
    /// A single leaf.
    On(DependOn),
    /// Every child must hold.
    All(Vec<Dependency>),
    /// At least one child must hold.
    Any(Vec<Dependency>),
}

impl Default for Dependency {
    fn default() -> Self {
        Self::none()
    }
}

impl From<DependOn> for Dependency {
    fn from(dep: DependOn) -> Self {
        Self::On(dep)
    }
}

impl Dependency {
    /// The empty dependency, always satisfied.
    #[must_use]
    pub const fn none() -> Self {
        Self::All(Vec::new())
    }

    /// Conjunction of leaves.
    #[must_use]
    pub fn all(deps: impl IntoIterator<Item = DependOn>) -> Self {
        Self::All(deps.into_iter().map(Self::On).collect())
    }

    /// Disjunction of leaves.
    #[must_use]
    pub fn any(deps: impl IntoIterator<Item = DependOn>) -> Self {
        Self::Any(deps.into_iter().map(Self::On).collect())
    }

    /// Evaluate with `state_of` supplying each entity's state. Entities with
    /// no known state fail the leaf.
    pub fn satisfied(&self, state_of: &impl Fn(EntityRef) -> Option<String>) -> bool {
        match self {
            Self::On(dep) => state_of(dep.item).is_some_and(|s| dep.accepts(&s)),
            Self::All(children) => children.iter().all(|c| c.satisfied(state_of)),
            Self::Any(children) => {
                children.is_empty() || children.iter().any(|c| c.satisfied(state_of))
            }
        }
    }

    /// Evaluate against the committed states in the cache.
    #[must_use]
    pub fn satisfied_now(&self, cache: &ObjectCache) -> bool {
        self.satisfied(&|item| cache.state(item))
    }

    /// Every leaf, depth first.
    #[must_use]
    pub fn leaves(&self) -> Vec<&DependOn> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a DependOn>) {
        match self {
            Self::On(dep) => out.push(dep),
            Self::All(children) | Self::Any(children) => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }

    /// Whether there is nothing to satisfy.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::On(_) => false,
            Self::All(children) | Self::Any(children) => children.iter().all(Self::is_empty),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DepKey {
    State(EntityRef, String),
    Job(Job),
}

/// Memo of dependency evaluations for the lifetime of one planning pass.
#[derive(Debug, Default)]
pub struct DepCache {
    memo: HashMap<DepKey, Dependency>,
}

impl DepCache {
    /// Create an empty memo.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Static dependencies of `item` when in `state`.
    pub fn state_deps(&mut self, cache: &ObjectCache, item: EntityRef, state: &str) -> Dependency {
        self.memo
            .entry(DepKey::State(item, state.to_string()))
            .or_insert_with(|| {
                cache
                    .get(item)
                    .map(|entity| crate::classes::state_deps(cache, &entity, state))
                    .unwrap_or_default()
            })
            .clone()
    }

    /// Dependencies of running `job`.
    pub fn job_deps(&mut self, cache: &ObjectCache, job: Job) -> Dependency {
        self.memo
            .entry(DepKey::Job(job))
            .or_insert_with(|| job.deps(cache))
            .clone()
    }
}
