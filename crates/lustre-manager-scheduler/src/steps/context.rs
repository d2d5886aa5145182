use lustre_manager_core::{ClassTag, EntityId, EntityRef, JobId};
use lustre_manager_store::{Entity, Host, WriteSet};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::context::SchedulerContext;
use crate::error::{AgentError, StepError};
use crate::object_cache::ObjectCache;

/// What a running step can reach.
pub struct StepContext<'a> {
    sched: &'a SchedulerContext,
    job_id: JobId,
    cancel: &'a CancellationToken,
    prev_result: Value,
    log: Mutex<String>,
    console: Mutex<String>,
}

impl<'a> StepContext<'a> {
    /// Context for one step of `job_id`.
    ///
    /// `prev_result` is the result of the job's previous step, or null.
    #[must_use]
    pub fn new(
        sched: &'a SchedulerContext,
        job_id: JobId,
        cancel: &'a CancellationToken,
        prev_result: Value,
    ) -> Self {
        Self {
            sched,
            job_id,
            cancel,
            prev_result,
            log: Mutex::new(String::new()),
            console: Mutex::new(String::new()),
        }
    }

    /// Job being run.
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Live entities.
    #[must_use]
    pub const fn cache(&self) -> &ObjectCache {
        self.sched.cache()
    }

    /// Configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        self.sched.config()
    }

    /// Scheduler context.
    #[must_use]
    pub const fn scheduler(&self) -> &SchedulerContext {
        self.sched
    }

    /// Cancellation of the job.
    #[must_use]
    pub const fn cancel(&self) -> &CancellationToken {
        self.cancel
    }

    /// Result of the previous step.
    #[must_use]
    pub const fn prev_result(&self) -> &Value {
        &self.prev_result
    }

    /// A live host.
    ///
    /// # Errors
    ///
    /// Returns `EntityVanished` if the host is gone.
    pub fn host(&self, host_id: EntityId) -> Result<Host, StepError> {
        self.cache()
            .host(host_id)
            .ok_or(StepError::EntityVanished(EntityRef::new(ClassTag::Host, host_id)))
    }

    /// A live entity.
    ///
    /// # Errors
    ///
    /// Returns `EntityVanished` if the entity is gone.
    pub fn entity(&self, item: EntityRef) -> Result<Entity, StepError> {
        self.cache().get(item).ok_or(StepError::EntityVanished(item))
    }

    /// Run an action on a host's agent.
    ///
    /// # Errors
    ///
    /// Returns the messenger's error; an agent exception's subprocess output
    /// is kept for the step's console.
    pub async fn invoke_agent(
        &self,
        host_id: EntityId,
        action: &str,
        args: Value,
    ) -> Result<Value, StepError> {
        let host = self.host(host_id)?;
        self.log(&format!("{action} on {}", host.fqdn));
        match self
            .sched
            .messenger()
            .call(&host.fqdn, action, args, self.cancel)
            .await
        {
            Ok(result) => Ok(result),
            Err(err) => {
                if let AgentError::AgentException { subprocesses, .. } = &err {
                    self.console.lock().push_str(subprocesses);
                }
                Err(err.into())
            }
        }
    }

    /// Run a manager-side helper.
    ///
    /// # Errors
    ///
    /// Returns `StepError::Local` if the helper fails.
    pub async fn invoke_local(&self, action: &str, args: Value) -> Result<Value, StepError> {
        self.log(&format!("{action} (local)"));
        self.sched.local().run(action, &args).await
    }

    /// Commit entity writes.
    ///
    /// # Errors
    ///
    /// Returns a store error if the commit fails.
    pub fn save(&self, entities: impl IntoIterator<Item = Entity>) -> Result<(), StepError> {
        let mut writes = WriteSet::new();
        for entity in entities {
            writes.put_entity(entity);
        }
        self.sched.write(writes).map_err(StepError::from)
    }

    /// Append a line to the step log.
    pub fn log(&self, line: &str) {
        let mut log = self.log.lock();
        log.push_str(line);
        log.push('\n');
    }

    /// The step log and console output gathered so far.
    #[must_use]
    pub fn take_output(&self) -> (String, String) {
        (
            std::mem::take(&mut *self.log.lock()),
            std::mem::take(&mut *self.console.lock()),
        )
    }
}
