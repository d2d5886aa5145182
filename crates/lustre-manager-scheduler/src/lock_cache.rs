//! In-memory record of the locks held by incomplete jobs.
//!
//! The persisted jobs are authoritative; this cache is rebuilt from their
//! `locks` at startup and kept in step as jobs are created and completed.

use std::collections::HashMap;

use lustre_manager_core::{EntityRef, JobId};
use lustre_manager_store::{JobRecord, StateLock};
use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Locks {
    by_item: HashMap<EntityRef, Vec<StateLock>>,
    by_job: HashMap<JobId, Vec<StateLock>>,
}

/// Read and write locks of not-yet-complete jobs.
#[derive(Debug, Default)]
pub struct LockCache {
    locks: RwLock<Locks>,
}

impl LockCache {
    /// Create a new empty lock cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted jobs, skipping completed ones.
    #[must_use]
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let cache = Self::new();
        for job in jobs {
            if !job.is_complete() {
                for lock in &job.locks {
                    cache.add(lock.clone());
                }
            }
        }
        cache
    }

    /// Record a lock.
    pub fn add(&self, lock: StateLock) {
        let mut locks = self.locks.write();
        locks
            .by_job
            .entry(lock.job_id)
            .or_default()
            .push(lock.clone());
        let item_locks = locks.by_item.entry(lock.locked_item).or_default();
        let at = item_locks.partition_point(|l| l.job_id <= lock.job_id);
        item_locks.insert(at, lock);
    }

    /// Release every lock held by `job_id`.
    pub fn remove_job(&self, job_id: JobId) -> Vec<StateLock> {
        let mut locks = self.locks.write();
        let removed = locks.by_job.remove(&job_id).unwrap_or_default();
        for lock in &removed {
            if let Some(item_locks) = locks.by_item.get_mut(&lock.locked_item) {
                item_locks.retain(|l| l.job_id != job_id);
                if item_locks.is_empty() {
                    locks.by_item.remove(&lock.locked_item);
                }
            }
        }
        removed
    }

    /// The highest-id write lock on `item`, excluding `not_job`.
    #[must_use]
    pub fn get_latest_write(&self, item: EntityRef, not_job: Option<JobId>) -> Option<StateLock> {
        self.locks.read().by_item.get(&item).and_then(|locks| {
            locks
                .iter()
                .rev()
                .find(|l| l.write && Some(l.job_id) != not_job)
                .cloned()
        })
    }

    /// Read locks on `item` held by jobs with id at least `after_job_id`.
    #[must_use]
    pub fn get_read_locks(
        &self,
        item: EntityRef,
        after_job_id: JobId,
        not_job: Option<JobId>,
    ) -> Vec<StateLock> {
        self.locks
            .read()
            .by_item
            .get(&item)
            .map(|locks| {
                locks
                    .iter()
                    .filter(|l| !l.write && l.job_id >= after_job_id && Some(l.job_id) != not_job)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All locks held by a job.
    #[must_use]
    pub fn get_by_job(&self, job_id: JobId) -> Vec<StateLock> {
        self.locks
            .read()
            .by_job
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// All locks on an item, in job id order.
    #[must_use]
    pub fn get_by_locked_item(&self, item: EntityRef) -> Vec<StateLock> {
        self.locks
            .read()
            .by_item
            .get(&item)
            .cloned()
            .unwrap_or_default()
    }

    /// The end state of the latest state-changing write lock on `item`.
    ///
    /// This is the state the item will be in once every queued job has run,
    /// and is where planning starts from.
    #[must_use]
    pub fn expected_state(&self, item: EntityRef) -> Option<String> {
        self.locks.read().by_item.get(&item).and_then(|locks| {
            locks
                .iter()
                .rev()
                .find(|l| l.write && l.end_state.is_some())
                .and_then(|l| l.end_state.clone())
        })
    }

    /// Whether any incomplete job holds a write lock on `item`.
    #[must_use]
    pub fn is_write_locked(&self, item: EntityRef) -> bool {
        self.locks
            .read()
            .by_item
            .get(&item)
            .is_some_and(|locks| locks.iter().any(|l| l.write))
    }

    /// Number of jobs holding locks.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.locks.read().by_job.len()
    }
}
