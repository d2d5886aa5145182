//! Shared state threaded through the planner, the runner and the steps.

use std::sync::Arc;

use lustre_manager_store::{IdSpace, Store, WriteSet};
use parking_lot::{Mutex, MutexGuard};

use crate::agent_rpc::AgentMessenger;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::local::LocalActions;
use crate::lock_cache::LockCache;
use crate::object_cache::ObjectCache;

/// Everything a scheduler instance owns.
///
/// Tests build a fresh context per case; nothing here is global.
pub struct SchedulerContext {
    store: Arc<dyn Store>,
    cache: ObjectCache,
    locks: LockCache,
    config: SchedulerConfig,
    messenger: Arc<AgentMessenger>,
    local: Arc<dyn LocalActions>,
    writer: Mutex<()>,
    alerts: Mutex<()>,
}

impl SchedulerContext {
    /// Build a context, seeding the object cache and lock cache from the
    /// store.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the store fails.
    pub fn new(
        store: Arc<dyn Store>,
        config: SchedulerConfig,
        messenger: Arc<AgentMessenger>,
        local: Arc<dyn LocalActions>,
    ) -> Result<Self> {
        let cache = ObjectCache::seed(store.as_ref())?;
        let jobs = store.list_incomplete_jobs()?;
        let locks = LockCache::from_jobs(&jobs);
        tracing::info!(
            jobs = jobs.len(),
            locked_jobs = locks.job_count(),
            "Scheduler context loaded"
        );
        Ok(Self {
            store,
            cache,
            locks,
            config,
            messenger,
            local,
            writer: Mutex::new(()),
            alerts: Mutex::new(()),
        })
    }

    /// The durable store.
    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    /// Live entities.
    #[must_use]
    pub const fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// Locks of incomplete jobs.
    #[must_use]
    pub const fn locks(&self) -> &LockCache {
        &self.locks
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Agent messenger.
    #[must_use]
    pub const fn messenger(&self) -> &Arc<AgentMessenger> {
        &self.messenger
    }

    /// Manager-side helpers.
    #[must_use]
    pub fn local(&self) -> &dyn LocalActions {
        self.local.as_ref()
    }

    /// Allocate an id.
    ///
    /// # Errors
    ///
    /// Returns an error if the counter cannot be advanced.
    pub fn next_id(&self, space: IdSpace) -> Result<u64> {
        Ok(self.store.next_id(space)?)
    }

    /// Serializes alert read-modify-write cycles so at most one alert per
    /// variant and subject is ever active.
    pub(crate) fn alert_guard(&self) -> MutexGuard<'_, ()> {
        self.alerts.lock()
    }

    /// Commit `writes` and apply their entities to the cache.
    ///
    /// All scheduler writes go through here, one at a time, so the cache
    /// only ever reflects committed data.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; the cache is untouched then.
    pub fn write(&self, writes: WriteSet) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let _guard = self.writer.lock();
        let entities: Vec<_> = writes.entities().cloned().collect();
        self.store.commit(writes)?;
        for entity in entities {
            self.cache.update(entity);
        }
        Ok(())
    }
}
