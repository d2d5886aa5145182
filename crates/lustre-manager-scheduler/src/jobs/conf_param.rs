use lustre_manager_store::Entity;

use super::Job;
use crate::deps::{DependOn, Dependency};
use crate::object_cache::ObjectCache;
use crate::steps::Step;

pub(super) fn description(_job: Job, subject: &Entity) -> String {
    format!("Update conf params on {}", subject.label())
}

/// Parameters are written through a running MGS.
pub(super) fn deps(job: Job, _cache: &ObjectCache, _subject: &Entity) -> Dependency {
    DependOn::new(job.subject(), "mounted").into()
}

pub(super) fn steps(job: Job) -> Vec<Step> {
    vec![Step::ApplyConfParams { mgs_id: job.id }]
}
