use lustre_manager_core::{ClassTag, EntityRef};
use lustre_manager_store::Entity;

use super::{Job, JobClass, LockSpec};
use crate::deps::{DependOn, Dependency};
use crate::object_cache::ObjectCache;
use crate::steps::Step;

pub(super) fn description(job: Job, subject: &Entity) -> String {
    let name = subject.label();
    match job.class {
        JobClass::StartFilesystem | JobClass::StartUnavailableFilesystem => {
            format!("Start filesystem {name}")
        }
        JobClass::StopFilesystem | JobClass::StopUnavailableFilesystem => {
            format!("Stop filesystem {name}")
        }
        JobClass::MakeAvailableFilesystemUnavailable
        | JobClass::MakeStoppedFilesystemUnavailable => {
            format!("Make filesystem {name} unavailable")
        }
        JobClass::RemoveFilesystem => format!("Remove filesystem {name} from configuration"),
        JobClass::ForgetFilesystem => format!("Forget filesystem {name}"),
        other => format!("{other} on {name}"),
    }
}

pub(super) fn deps(job: Job, cache: &ObjectCache, subject: &Entity) -> Dependency {
    let Some(filesystem) = subject.as_filesystem() else {
        return Dependency::none();
    };
    let mgs = EntityRef::new(ClassTag::Target, filesystem.mgs_id);
    let members = || {
        cache
            .fs_targets(filesystem.header.id)
            .into_iter()
            .map(|t| EntityRef::new(ClassTag::Target, t.header.id))
    };

    match job.class {
        JobClass::StartFilesystem | JobClass::StartUnavailableFilesystem => Dependency::all(
            std::iter::once(mgs)
                .chain(members())
                .map(|t| DependOn::new(t, "mounted")),
        ),
        JobClass::StopFilesystem | JobClass::StopUnavailableFilesystem => Dependency::all(
            members().map(|t| DependOn::except(t, "unmounted", &["mounted"])),
        ),
        JobClass::RemoveFilesystem => DependOn::new(mgs, "mounted").into(),
        _ => Dependency::none(),
    }
}

pub(super) fn create_locks(job: Job, cache: &ObjectCache) -> Vec<LockSpec> {
    match job.class {
        JobClass::RemoveFilesystem => cache
            .filesystem(job.id)
            .map(|f| LockSpec::hold(EntityRef::new(ClassTag::Target, f.mgs_id), "mounted"))
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

pub(super) fn steps(job: Job) -> Vec<Step> {
    match job.class {
        JobClass::RemoveFilesystem => vec![Step::PurgeFilesystem {
            filesystem_id: job.id,
        }],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::fixtures;

    #[test]
    fn start_needs_every_target_mounted() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let deps = Job::new(JobClass::StartUnavailableFilesystem, layout.filesystem_id).deps(&cache);
        let mut items: Vec<_> = deps.leaves().iter().map(|d| d.item.id).collect();
        items.sort();
        let mut expected = vec![layout.mgs_id, layout.mdt_id, layout.ost_id];
        expected.sort();
        assert_eq!(items, expected);
    }

    #[test]
    fn stop_leaves_mgs_alone() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let deps = Job::new(JobClass::StopFilesystem, layout.filesystem_id).deps(&cache);
        assert!(!deps.leaves().iter().any(|d| d.item.id == layout.mgs_id));
        assert!(deps.leaves().iter().all(|d| !d.accepts("mounted")));
    }

    #[test]
    fn removal_purges_and_holds_mgs() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);
        let job = Job::new(JobClass::RemoveFilesystem, layout.filesystem_id);
        assert_eq!(
            job.create_locks(&cache),
            [LockSpec::hold(EntityRef::new(ClassTag::Target, layout.mgs_id), "mounted")]
        );
        assert_eq!(
            steps(job),
            [Step::PurgeFilesystem {
                filesystem_id: layout.filesystem_id
            }]
        );
    }
}
