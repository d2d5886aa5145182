//! The job scheduler.
//!
//! [`JobScheduler`] is the single owner of job lifecycle. Planning, job
//! completion, dispatch and notification intake all run under one core
//! lock, so they observe and update the lock cache, object cache and store
//! in a total order. Step execution runs outside the lock on spawned
//! tasks; a finished task re-enters through [`JobScheduler::job_finished`].
//!
//! # Lifecycle
//!
//! ```text
//! pending ──dispatch──▶ tasked ──run_job──▶ complete
//!    │                                        ▲
//!    └──────── cancelled (dependency failed) ─┘
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::Utc;
use lustre_manager_core::{ClassTag, CommandId, EntityRef, JobId};
use lustre_manager_store::{
    AlertRecord, ClientMount, CommandRecord, ConfParam, Copytool, Entity, Filesystem, Host,
    JobRecord, JobState, StateLock, StepResultRecord, StepState, TargetRole, WriteSet,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::agent_rpc::SessionEvent;
use crate::alerts;
use crate::classes;
use crate::command_plan::{
    self, CommandPlanner, JobRequest, PlannedCommand, StateRequest, TransitionConsequences,
};
use crate::context::SchedulerContext;
use crate::create::{
    self, ConfParamUpdate, CreateClientMount, CreateCopytool, CreateFilesystem, CreateHost,
};
use crate::error::{Result, SchedulerError};
use crate::jobs::{Job, JobClass};
use crate::notify::{Notification, NotifyIntake, NotifyOutcome};
use crate::registry::{self, AvailableJob, AvailableTransition};
use crate::runner::{run_job, JobOutcome};

/// Parameters written by [`JobScheduler::set_conf_params`] and the commands
/// started to apply them.
#[derive(Debug, Clone, Serialize)]
pub struct ConfParamsSet {
    /// New parameter records.
    pub params: Vec<ConfParam>,
    /// One command per MGS that can apply them now.
    pub commands: Vec<CommandRecord>,
}

#[derive(Debug, Default)]
struct Core {
    running: HashMap<JobId, CancellationToken>,
}

/// Plans commands and runs their jobs.
pub struct JobScheduler {
    ctx: SchedulerContext,
    intake: NotifyIntake,
    core: Mutex<Core>,
    this: Weak<Self>,
    shutdown: CancellationToken,
}

impl JobScheduler {
    /// Create a scheduler over `ctx`. Nothing runs until [`Self::start`].
    #[must_use]
    pub fn new(ctx: SchedulerContext) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            ctx,
            intake: NotifyIntake::new(),
            core: Mutex::new(Core::default()),
            this: this.clone(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Scheduler context.
    #[must_use]
    pub const fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    /// Recover jobs left by a previous run, then start dispatching.
    ///
    /// Pending jobs are cancelled. A tasked job resumes after its last
    /// successful step, or at its interrupted step when that step is
    /// idempotent; otherwise it is errored.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub async fn start(&self) -> Result<()> {
        if let Err(e) = self.ctx.messenger().terminate_all().await {
            tracing::warn!(error = %e, "Could not terminate agent sessions");
        }
        self.spawn_session_watch();

        let mut core = self.core.lock();
        self.recover(&mut core)?;
        self.dispatch(&mut core)?;
        tracing::info!(
            running = core.running.len(),
            max_parallel_jobs = self.ctx.config().max_parallel_jobs,
            "Job scheduler started"
        );
        Ok(())
    }

    /// Stop dispatching and cancel running jobs.
    ///
    /// Cancelled runs are left tasked so the next start recovers them.
    pub fn shutdown(&self) {
        tracing::info!("Job scheduler shutting down");
        self.shutdown.cancel();
        self.ctx.messenger().shutdown();
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Plan and start the jobs moving each item to its requested state.
    ///
    /// A request that cannot be planned still yields a command, recorded
    /// as complete and errored.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed requests or store failures.
    pub fn set_state(&self, requests: &[StateRequest], message: &str) -> Result<CommandRecord> {
        let mut core = self.core.lock();
        self.plan_set_state(&mut core, requests, message)
    }

    /// Run explicitly requested jobs.
    ///
    /// Incomplete jobs holding locks on anything a requested job preempts
    /// are cancelled first.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown classes, bad arguments or store
    /// failures.
    pub fn run_jobs(&self, requests: &[JobRequest], message: &str) -> Result<CommandRecord> {
        let mut core = self.core.lock();

        let mut finished = Vec::new();
        for request in requests {
            let job = Job::parse(&request.class_name, &request.args)?;
            for item in job.preempts(self.ctx.cache()) {
                for lock in self.ctx.locks().get_by_locked_item(item) {
                    tracing::info!(job_id = %lock.job_id, preempted_by = %job, "Preempting job");
                    self.cancel_one(&mut core, lock.job_id, &mut finished)?;
                    self.ctx.locks().remove_job(lock.job_id);
                }
            }
        }
        if !finished.is_empty() {
            self.finalize_commands(&finished)?;
        }

        let planned = match CommandPlanner::new(&self.ctx).run_jobs(requests, message) {
            Ok(planned) => planned,
            Err(e) if e.is_validation() => return self.rejected(message, &e),
            Err(e) => return Err(e),
        };
        self.started(&mut core, planned)
    }

    /// Cancel one job.
    ///
    /// A running job stops at its next cancellation point; a pending job
    /// is cancelled at once, together with the jobs waiting on it.
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if the job does not exist.
    pub fn cancel_job(&self, job_id: JobId) -> Result<JobRecord> {
        let mut core = self.core.lock();
        let mut finished = Vec::new();
        self.cancel_one(&mut core, job_id, &mut finished)?;
        if !finished.is_empty() {
            self.finalize_commands(&finished)?;
            self.dispatch(&mut core)?;
        }
        self.get_job(job_id)
    }

    /// Cancel every incomplete job of a command.
    ///
    /// # Errors
    ///
    /// Returns `CommandNotFound` if the command does not exist.
    pub fn cancel_command(&self, command_id: CommandId) -> Result<CommandRecord> {
        let mut core = self.core.lock();
        let command = self.get_command(command_id)?;
        let mut finished = Vec::new();
        for job_id in &command.jobs {
            self.cancel_one(&mut core, *job_id, &mut finished)?;
        }
        if !finished.is_empty() {
            self.finalize_commands(&finished)?;
            self.dispatch(&mut core)?;
        }
        tracing::info!(command_id = %command_id, cancelled = finished.len(), "Command cancelled");
        self.get_command(command_id)
    }

    /// What moving `item` to `state` would run.
    ///
    /// # Errors
    ///
    /// Returns the planning error the same request would be rejected with.
    pub fn transition_consequences(&self, item: EntityRef, state: &str) -> Result<TransitionConsequences> {
        let _core = self.core.lock();
        CommandPlanner::new(&self.ctx).transition_consequences(item, state)
    }

    /// Locks currently held or awaited on `item`.
    #[must_use]
    pub fn get_locks(&self, item: EntityRef) -> Vec<StateLock> {
        self.ctx.locks().get_by_locked_item(item)
    }

    /// Take an observation of an entity's state or attributes.
    ///
    /// An applied update may make pending jobs startable, so dispatch runs
    /// again afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn notify(&self, notification: Notification) -> Result<NotifyOutcome> {
        let mut core = self.core.lock();
        let outcome = self.intake.notify(&self.ctx, notification)?;
        if outcome == NotifyOutcome::Applied {
            self.apply_conf_params(&mut core)?;
            self.dispatch(&mut core)?;
        }
        Ok(outcome)
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Register a server in its initial state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the FQDN is taken.
    pub fn create_host(&self, request: &CreateHost) -> Result<Host> {
        let _core = self.core.lock();
        let (host, writes) = create::host_records(&self.ctx, request)?;
        self.ctx.write(writes)?;
        tracing::info!(host_id = %host.header.id, fqdn = %host.fqdn, "Host created");
        Ok(host)
    }

    /// Create a filesystem and start the command bringing it up.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the request does not validate.
    pub fn create_filesystem(&self, request: &CreateFilesystem) -> Result<(Filesystem, CommandRecord)> {
        let mut core = self.core.lock();
        let (filesystem, writes) = create::filesystem_records(&self.ctx, request)?;
        self.ctx.write(writes)?;
        tracing::info!(
            filesystem_id = %filesystem.header.id,
            name = %filesystem.name,
            "Filesystem created"
        );

        let item = EntityRef::new(ClassTag::Filesystem, filesystem.header.id);
        let message = format!("Creating filesystem {}", filesystem.name);
        let command = self.plan_set_state(&mut core, &[StateRequest::new(item, "available")], &message)?;
        Ok((filesystem, command))
    }

    /// Register a client mount, unmounted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the request does not validate.
    pub fn create_client_mount(&self, request: &CreateClientMount) -> Result<ClientMount> {
        let _core = self.core.lock();
        let mount = create::client_mount_record(&self.ctx, request)?;
        let mut writes = WriteSet::new();
        writes.put_entity(mount.clone().into());
        self.ctx.write(writes)?;
        tracing::info!(client_mount_id = %mount.header.id, "Client mount created");
        Ok(mount)
    }

    /// Register a copytool, stopped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if the request does not validate.
    pub fn create_copytool(&self, request: &CreateCopytool) -> Result<Copytool> {
        let _core = self.core.lock();
        let copytool = create::copytool_record(&self.ctx, request)?;
        let mut writes = WriteSet::new();
        writes.put_entity(copytool.clone().into());
        self.ctx.write(writes)?;
        tracing::info!(copytool_id = %copytool.header.id, "Copytool created");
        Ok(copytool)
    }

    /// Record configuration parameters and apply them where the MGS is up.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` if any update does not validate; nothing is
    /// written then.
    pub fn set_conf_params(&self, updates: &[ConfParamUpdate]) -> Result<ConfParamsSet> {
        let mut core = self.core.lock();
        let (params, writes) = create::conf_param_records(&self.ctx, updates)?;
        self.ctx.write(writes)?;
        tracing::info!(count = params.len(), "Conf params recorded");

        let commands = self.apply_conf_params(&mut core)?;
        self.dispatch(&mut core)?;
        Ok(ConfParamsSet { params, commands })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Load a command.
    ///
    /// # Errors
    ///
    /// Returns `CommandNotFound` if it does not exist.
    pub fn get_command(&self, command_id: CommandId) -> Result<CommandRecord> {
        self.ctx
            .store()
            .get_command(command_id)?
            .ok_or(SchedulerError::CommandNotFound(command_id))
    }

    /// Load a job.
    ///
    /// # Errors
    ///
    /// Returns `JobNotFound` if it does not exist.
    pub fn get_job(&self, job_id: JobId) -> Result<JobRecord> {
        self.ctx
            .store()
            .get_job(job_id)?
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    /// Step results of a job, in step order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn step_results(&self, job_id: JobId) -> Result<Vec<StepResultRecord>> {
        Ok(self.ctx.store().list_step_results(job_id)?)
    }

    /// State changes `item` offers now; empty for unknown entities.
    #[must_use]
    pub fn available_transitions(&self, item: EntityRef) -> Vec<AvailableTransition> {
        self.ctx.cache().get(item).map_or_else(Vec::new, |entity| {
            registry::available_transitions(self.ctx.cache(), self.ctx.locks(), &entity)
        })
    }

    /// Jobs `item` offers now; empty for unknown entities.
    #[must_use]
    pub fn available_jobs(&self, item: EntityRef) -> Vec<AvailableJob> {
        self.ctx.cache().get(item).map_or_else(Vec::new, |entity| {
            registry::available_jobs(self.ctx.cache(), self.ctx.locks(), &entity)
        })
    }

    /// Alerts, optionally only the active ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn alerts(&self, active_only: bool) -> Result<Vec<AlertRecord>> {
        let store = self.ctx.store();
        Ok(if active_only {
            store.list_active_alerts()?
        } else {
            store.list_alerts()?
        })
    }

    // ========================================================================
    // Planning
    // ========================================================================

    fn plan_set_state(&self, core: &mut Core, requests: &[StateRequest], message: &str) -> Result<CommandRecord> {
        let planned = match CommandPlanner::new(&self.ctx).set_state(requests, message) {
            Ok(planned) => planned,
            Err(e) if e.is_validation() => return self.rejected(message, &e),
            Err(e) => return Err(e),
        };
        self.started(core, planned)
    }

    fn rejected(&self, message: &str, reason: &SchedulerError) -> Result<CommandRecord> {
        let command = command_plan::reject(&self.ctx, message, reason)?;
        alerts::command_finished(&self.ctx, &command)?;
        Ok(command)
    }

    fn started(&self, core: &mut Core, planned: PlannedCommand) -> Result<CommandRecord> {
        let PlannedCommand { command, jobs } = planned;
        if command.complete {
            alerts::command_finished(&self.ctx, &command)?;
        }
        if !jobs.is_empty() {
            self.dispatch(core)?;
        }
        Ok(command)
    }

    /// Start `ApplyConfParams` on every mounted MGS with unapplied
    /// parameters and no such job already queued.
    fn apply_conf_params(&self, core: &mut Core) -> Result<Vec<CommandRecord>> {
        let queued: HashSet<Job> = self
            .ctx
            .store()
            .list_incomplete_jobs()?
            .iter()
            .filter_map(|record| Job::from_record(record).ok())
            .filter(|job| job.class == JobClass::ApplyConfParams)
            .collect();

        let mut commands = Vec::new();
        for entity in self.ctx.cache().list(ClassTag::Target) {
            let Some(target) = entity.as_target() else {
                continue;
            };
            let TargetRole::Mgs {
                conf_param_version,
                conf_param_version_applied,
            } = target.role
            else {
                continue;
            };
            let job = Job::new(JobClass::ApplyConfParams, target.header.id);
            if conf_param_version <= conf_param_version_applied
                || target.header.state != "mounted"
                || queued.contains(&job)
            {
                continue;
            }

            let request = JobRequest {
                class_name: job.class.name().to_string(),
                args: job.args(),
                depends_on_job_range: Vec::new(),
            };
            let message = format!("Updating configuration parameters on {}", entity.label());
            match CommandPlanner::new(&self.ctx).run_jobs(&[request], &message) {
                Ok(planned) => commands.push(self.started(core, planned)?),
                Err(e) => tracing::warn!(mgs_id = %target.header.id, error = %e, "Could not plan conf param update"),
            }
        }
        Ok(commands)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Start every ready pending job, in creation order, up to the
    /// parallelism limit.
    fn dispatch(&self, core: &mut Core) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        let limit = self.ctx.config().max_parallel_jobs.max(1);
        let incomplete = self.ctx.store().list_incomplete_jobs()?;
        let open: HashSet<JobId> = incomplete.iter().map(|j| j.id).collect();
        let mut finished = Vec::new();

        for mut record in incomplete {
            if core.running.len() >= limit {
                break;
            }
            if record.state != JobState::Pending || finished.contains(&record.id) {
                continue;
            }

            let mut blocked = false;
            let mut failed_dep = None;
            for wait_id in &record.wait_for {
                if open.contains(wait_id) && !finished.contains(wait_id) {
                    blocked = true;
                    break;
                }
                if let Some(waited) = self.ctx.store().get_job(*wait_id)? {
                    if !waited.succeeded() {
                        failed_dep = Some(*wait_id);
                    }
                }
            }
            if blocked {
                continue;
            }

            let job_id = record.id;
            let refusal = match failed_dep {
                Some(dep) => Some(format!("job {dep} did not succeed")),
                None => self.start_refusal(&record),
            };
            if let Some(reason) = refusal {
                tracing::warn!(job_id = %job_id, class = %record.class_name, reason, "Cancelling job");
                self.finish(record, JobOutcome::Cancelled)?;
                finished.push(job_id);
                self.cancel_waiters(job_id, &mut finished)?;
                continue;
            }

            let job = match Job::from_record(&record) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Unreadable job");
                    self.finish(record, JobOutcome::Errored)?;
                    finished.push(job_id);
                    self.cancel_waiters(job_id, &mut finished)?;
                    continue;
                }
            };

            record.state = JobState::Tasked;
            record.modified_at = Utc::now();
            let mut writes = WriteSet::new();
            writes.put_job(record.clone());
            self.ctx.write(writes)?;
            self.spawn(core, record, job, 0);
        }

        if !finished.is_empty() {
            self.finalize_commands(&finished)?;
        }
        Ok(())
    }

    /// Why a ready job can no longer start, if it cannot.
    fn start_refusal(&self, record: &JobRecord) -> Option<String> {
        let cache = self.ctx.cache();
        let job = match Job::from_record(record) {
            Ok(job) => job,
            Err(e) => return Some(e.to_string()),
        };
        let subject = job.subject();
        let Some(entity) = cache.get(subject) else {
            return Some(format!("{subject} no longer exists"));
        };
        if !job.deps(cache).satisfied_now(cache) {
            return Some(format!("dependencies of {job} are not satisfied"));
        }

        let lock = record.transition_lock(subject)?;
        let (Some(begin), Some(end)) = (lock.begin_state.as_deref(), lock.end_state.as_deref()) else {
            return None;
        };
        let current = entity.state().unwrap_or_default();
        if current != begin {
            return Some(format!("{subject} is {current}, expected {begin}"));
        }
        if !classes::state_deps(cache, &entity, end).satisfied_now(cache) {
            return Some(format!("{subject} cannot be {end} in the current state"));
        }
        for dependent in classes::dependents(cache, &entity) {
            let Some(other) = cache.get(dependent) else {
                continue;
            };
            let Some(state) = other.state() else {
                continue;
            };
            let deps = classes::state_deps(cache, &other, state);
            if deps
                .leaves()
                .iter()
                .any(|leaf| leaf.item == subject && !leaf.accepts(end))
            {
                return Some(format!("{dependent} requires {subject} not to be {end}"));
            }
        }
        None
    }

    fn spawn(&self, core: &mut Core, record: JobRecord, job: Job, start_at: usize) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let cancel = self.shutdown.child_token();
        core.running.insert(record.id, cancel.clone());
        tracing::info!(job_id = %record.id, job = %job, start_at, "Job started");

        tokio::spawn(async move {
            let outcome = run_job(&this.ctx, &record, job, start_at, &cancel).await;
            if this.shutdown.is_cancelled() {
                tracing::info!(job_id = %record.id, "Job interrupted by shutdown");
                return;
            }
            this.job_finished(record.id, outcome);
        });
    }

    fn job_finished(&self, job_id: JobId, outcome: JobOutcome) {
        let mut core = self.core.lock();
        core.running.remove(&job_id);
        if let Err(e) = self.complete(&mut core, job_id, outcome) {
            tracing::error!(job_id = %job_id, error = %e, "Could not complete job");
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    fn complete(&self, core: &mut Core, job_id: JobId, outcome: JobOutcome) -> Result<()> {
        let record = self.get_job(job_id)?;
        if record.is_complete() {
            return Ok(());
        }
        let class_name = record.class_name.clone();

        let mut finished = vec![job_id];
        let touched = self.finish(record, outcome)?;
        if outcome != JobOutcome::Succeeded {
            self.cancel_waiters(job_id, &mut finished)?;
        }
        for entity in &touched {
            alerts::evaluate(&self.ctx, entity, true)?;
        }
        self.finalize_commands(&finished)?;

        if class_name != JobClass::ApplyConfParams.name() {
            self.apply_conf_params(core)?;
        }
        self.dispatch(core)
    }

    /// Mark a job complete, applying its state changes on success.
    ///
    /// Returns the entities written.
    fn finish(&self, mut record: JobRecord, outcome: JobOutcome) -> Result<Vec<Entity>> {
        let now = Utc::now();
        let cache = self.ctx.cache();
        let mut staged: BTreeMap<EntityRef, Entity> = BTreeMap::new();

        if outcome == JobOutcome::Succeeded {
            match Job::from_record(&record) {
                Ok(job) => {
                    for entity in job.on_success(cache, now) {
                        staged.insert(entity.entity_ref(), entity);
                    }
                }
                Err(e) => tracing::error!(job_id = %record.id, error = %e, "Unreadable job"),
            }
            for lock in record.locks.iter().filter(|l| l.write) {
                let Some(end) = lock.end_state.as_deref() else {
                    continue;
                };
                let entity = staged
                    .get(&lock.locked_item)
                    .cloned()
                    .or_else(|| cache.get(lock.locked_item));
                let Some(mut entity) = entity else {
                    continue;
                };
                if entity.state() == Some(end) {
                    continue;
                }
                if let Some(header) = entity.header_mut() {
                    header.set_state(end, now);
                }
                staged.insert(lock.locked_item, entity);
            }
        }

        record.state = JobState::Complete;
        record.errored = outcome == JobOutcome::Errored;
        record.cancelled = outcome == JobOutcome::Cancelled;
        record.modified_at = now;

        let mut writes = WriteSet::new();
        writes.put_job(record.clone());
        for entity in staged.values() {
            writes.put_entity(entity.clone());
        }
        self.ctx.write(writes)?;
        self.ctx.locks().remove_job(record.id);
        tracing::info!(
            job_id = %record.id,
            class = %record.class_name,
            outcome = ?outcome,
            "Job complete"
        );

        let mut released: HashSet<EntityRef> = HashSet::new();
        for lock in &record.locks {
            if released.insert(lock.locked_item) {
                self.intake.release(&self.ctx, lock.locked_item)?;
            }
        }
        Ok(staged.into_values().collect())
    }

    /// Cancel, transitively, pending jobs waiting on `job_id`.
    fn cancel_waiters(&self, job_id: JobId, finished: &mut Vec<JobId>) -> Result<()> {
        let mut queue = vec![job_id];
        while let Some(failed) = queue.pop() {
            for record in self.ctx.store().list_incomplete_jobs()? {
                if record.state != JobState::Pending || !record.wait_for.contains(&failed) {
                    continue;
                }
                let id = record.id;
                tracing::info!(job_id = %id, waited_on = %failed, "Cancelling dependent job");
                self.finish(record, JobOutcome::Cancelled)?;
                finished.push(id);
                queue.push(id);
            }
        }
        Ok(())
    }

    fn cancel_one(&self, core: &mut Core, job_id: JobId, finished: &mut Vec<JobId>) -> Result<()> {
        let record = self.get_job(job_id)?;
        if record.is_complete() {
            return Ok(());
        }
        if let Some(token) = core.running.get(&job_id) {
            tracing::info!(job_id = %job_id, "Cancelling running job");
            token.cancel();
            return Ok(());
        }
        self.finish(record, JobOutcome::Cancelled)?;
        finished.push(job_id);
        self.cancel_waiters(job_id, finished)
    }

    /// Complete the commands owning any of `finished` whose jobs are done.
    fn finalize_commands(&self, finished: &[JobId]) -> Result<()> {
        for command in self.ctx.store().list_incomplete_commands()? {
            if command.jobs.iter().any(|id| finished.contains(id)) {
                self.try_finalize(command)?;
            }
        }
        Ok(())
    }

    fn try_finalize(&self, mut command: CommandRecord) -> Result<bool> {
        let mut errored = false;
        let mut cancelled = false;
        for job_id in &command.jobs {
            let Some(job) = self.ctx.store().get_job(*job_id)? else {
                continue;
            };
            if !job.is_complete() {
                return Ok(false);
            }
            errored |= job.errored;
            cancelled |= job.cancelled;
        }

        command.complete = true;
        command.errored = errored;
        command.cancelled = cancelled && !errored;
        let mut writes = WriteSet::new();
        writes.put_command(command.clone());
        self.ctx.write(writes)?;
        tracing::info!(
            command_id = %command.id,
            errored = command.errored,
            cancelled = command.cancelled,
            "Command complete"
        );
        alerts::command_finished(&self.ctx, &command)?;
        Ok(true)
    }

    // ========================================================================
    // Recovery
    // ========================================================================

    fn recover(&self, core: &mut Core) -> Result<()> {
        let mut finished = Vec::new();
        for record in self.ctx.store().list_incomplete_jobs()? {
            let job_id = record.id;
            match record.state {
                JobState::Pending => {
                    tracing::info!(job_id = %job_id, "Cancelling job pending at restart");
                    self.finish(record, JobOutcome::Cancelled)?;
                    finished.push(job_id);
                }
                JobState::Tasked => match self.resume_point(&record) {
                    Some((job, start_at)) => {
                        tracing::info!(job_id = %job_id, start_at, "Resuming job");
                        self.spawn(core, record, job, start_at);
                    }
                    None => {
                        tracing::warn!(job_id = %job_id, "Job interrupted in a step that cannot be retried");
                        self.finish(record, JobOutcome::Errored)?;
                        finished.push(job_id);
                    }
                },
                JobState::Complete => {}
            }
        }

        for command in self.ctx.store().list_incomplete_commands()? {
            self.try_finalize(command)?;
        }
        Ok(())
    }

    /// Where an interrupted job picks up, or `None` if it cannot.
    fn resume_point(&self, record: &JobRecord) -> Option<(Job, usize)> {
        let job = Job::from_record(record).ok()?;
        let results = self.ctx.store().list_step_results(record.id).ok()?;
        let Some(last) = results.last() else {
            return Some((job, 0));
        };
        match last.state {
            StepState::Success => Some((job, last.step_index + 1)),
            StepState::Failed => None,
            StepState::Incomplete => {
                let steps = job.steps(self.ctx.cache(), self.ctx.config()).ok()?;
                steps
                    .get(last.step_index)
                    .filter(|step| step.idempotent())
                    .map(|_| (job, last.step_index))
            }
        }
    }

    fn spawn_session_watch(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let mut events = self.ctx.messenger().subscribe();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                let result = match event {
                    Ok(SessionEvent::Established { fqdn }) => alerts::host_contact(&this.ctx, &fqdn, false),
                    Ok(SessionEvent::Lost { fqdn, reason }) => {
                        tracing::debug!(fqdn, reason, "Agent session lost");
                        alerts::host_contact(&this.ctx, &fqdn, true)
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Session events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Could not update host contact alert");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use lustre_manager_core::{EntityId, StepResultId};
    use lustre_manager_store::{
        AlertVariant, CommandRecord, IdSpace, RocksStore, StatefulHeader, Store, Target,
        TargetMount,
    };
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::create::MgtSpec;
    use crate::mock::fixtures::{self, ServerLayout};
    use crate::mock::Harness;

    const OSS1: &str = "oss1.example.com";

    struct Setup {
        _dir: TempDir,
        store: Arc<dyn Store>,
    }

    fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        Setup { _dir: dir, store }
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            session_wait_timeout_seconds: 5,
            ..SchedulerConfig::default()
        }
    }

    struct Fs {
        filesystem_id: EntityId,
        mgs_id: EntityId,
        target_ids: Vec<EntityId>,
    }

    /// A filesystem with every target mounted on `server`, written straight
    /// to the store. A new MGS takes the first volume.
    fn mounted_filesystem(
        store: &dyn Store,
        server: &ServerLayout,
        name: &str,
        mgs_id: Option<EntityId>,
        volumes: &[EntityId],
    ) -> Fs {
        let next = || EntityId::new(store.next_id(IdSpace::Entity).unwrap());
        let mut writes = WriteSet::new();
        let mut put_target = |target_name: String, volume_id: EntityId, role: TargetRole| {
            let id = next();
            let node = store
                .list_entities(ClassTag::VolumeNode)
                .unwrap()
                .into_iter()
                .filter_map(|e| e.as_volume_node().cloned())
                .find(|n| n.volume_id == volume_id)
                .unwrap();
            let mount = TargetMount {
                id: next(),
                target_id: id,
                host_id: server.host_id,
                volume_node_id: node.id,
                mount_point: Some(format!("/mnt/{name}")),
                primary: true,
                not_deleted: true,
            };
            writes.put_entity(
                Target {
                    header: StatefulHeader::new(id, "mounted"),
                    ha_label: format!("{target_name}_{id}"),
                    name: target_name,
                    uuid: Some(format!("uuid-{id}")),
                    volume_id,
                    active_mount_id: Some(mount.id),
                    reformat: false,
                    inode_size: None,
                    role,
                }
                .into(),
            );
            writes.put_entity(mount.into());
            id
        };

        let mut volumes = volumes.iter().copied();
        let mgs_id = mgs_id.unwrap_or_else(|| {
            let role = TargetRole::Mgs {
                conf_param_version: 0,
                conf_param_version_applied: 0,
            };
            put_target("MGS".to_string(), volumes.next().unwrap(), role)
        });
        let filesystem_id = next();
        let mdt = put_target(
            format!("{name}-MDT0000"),
            volumes.next().unwrap(),
            TargetRole::Mdt {
                filesystem_id,
                index: 0,
            },
        );
        let ost = put_target(
            format!("{name}-OST0000"),
            volumes.next().unwrap(),
            TargetRole::Ost {
                filesystem_id,
                index: 0,
            },
        );
        writes.put_entity(
            Filesystem {
                header: StatefulHeader::new(filesystem_id, "available"),
                name: name.to_string(),
                mgs_id,
                mdt_next_index: 1,
                ost_next_index: 1,
            }
            .into(),
        );
        store.commit(writes).unwrap();
        Fs {
            filesystem_id,
            mgs_id,
            target_ids: vec![mdt, ost],
        }
    }

    fn set_stored_state(store: &dyn Store, item: EntityRef, state: &str) {
        let mut entity = store.get_entity(item).unwrap().unwrap();
        entity.header_mut().unwrap().set_state(state, Utc::now());
        let mut writes = WriteSet::new();
        writes.put_entity(entity);
        store.commit(writes).unwrap();
    }

    fn classes_of(h: &Harness, command: &CommandRecord) -> Vec<String> {
        command
            .jobs
            .iter()
            .map(|id| h.scheduler.get_job(*id).unwrap().class_name)
            .collect()
    }

    fn stored_state(h: &Harness, item: EntityRef) -> String {
        let entity = fixtures::stored(h.ctx().store(), item).unwrap().unwrap();
        entity.state().unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn new_host_is_set_up_to_managed() {
        let s = setup();
        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();

        let host = h
            .scheduler
            .create_host(&CreateHost {
                fqdn: OSS1.to_string(),
                address: None,
                nodename: None,
                server_profile: lustre_manager_store::ServerProfile::Managed,
                install_method: "existing_keys".to_string(),
            })
            .unwrap();
        let item = EntityRef::new(ClassTag::Host, host.header.id);

        let command = h
            .scheduler
            .set_state(&[StateRequest::new(item, "managed")], "Set up oss1")
            .unwrap();
        assert_eq!(
            classes_of(&h, &command),
            [
                "DeployHost",
                "InstallHostPackages",
                "ConfigureNTP",
                "ConfigureCorosync",
                "ConfigurePacemaker",
                "ConfigureLNet",
                "SetupHost",
            ]
        );

        let done = h.wait_for_command(command.id).await.unwrap();
        assert!(!done.errored && !done.cancelled, "{done:?}");
        assert_eq!(stored_state(&h, item), "managed");
        assert!(h.ctx().locks().get_by_locked_item(item).is_empty());

        let alerts = h.scheduler.alerts(false).unwrap();
        assert!(alerts
            .iter()
            .any(|a| a.variant == AlertVariant::CommandSuccessfulAlert));
    }

    #[tokio::test(start_paused = true)]
    async fn created_filesystem_becomes_available() {
        let s = setup();
        let server = fixtures::managed_server(s.store.as_ref(), OSS1, 3).unwrap();
        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();
        h.fleet.connect(OSS1).await;

        let (fs, command) = h
            .scheduler
            .create_filesystem(&CreateFilesystem {
                name: "testfs".to_string(),
                mgt: MgtSpec::New {
                    volume_id: server.volume_ids[0],
                },
                mdts: vec![server.volume_ids[1]],
                osts: vec![server.volume_ids[2]],
            })
            .unwrap();

        let done = h.wait_for_command(command.id).await.unwrap();
        assert!(!done.errored && !done.cancelled, "{done:?}");
        assert_eq!(
            stored_state(&h, EntityRef::new(ClassTag::Filesystem, fs.header.id)),
            "available"
        );
        for target in h.ctx().cache().fs_targets(fs.header.id) {
            assert_eq!(target.header.state, "mounted", "{}", target.name);
            assert!(target.active_mount_id.is_some());
        }
        assert_eq!(
            stored_state(&h, fixtures::target_ref(fs.mgs_id)),
            "mounted"
        );
        let formats = h
            .fleet
            .actions_for(OSS1)
            .iter()
            .filter(|a| *a == "format_target")
            .count();
        assert_eq!(formats, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn removals_sharing_an_mgs_are_serialised() {
        let s = setup();
        let server = fixtures::managed_server(s.store.as_ref(), OSS1, 5).unwrap();
        let fs1 = mounted_filesystem(s.store.as_ref(), &server, "fs1", None, &server.volume_ids[..3]);
        let fs2 = mounted_filesystem(
            s.store.as_ref(),
            &server,
            "fs2",
            Some(fs1.mgs_id),
            &server.volume_ids[3..],
        );
        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();
        h.fleet.connect(OSS1).await;

        let fs1_ref = EntityRef::new(ClassTag::Filesystem, fs1.filesystem_id);
        let fs2_ref = EntityRef::new(ClassTag::Filesystem, fs2.filesystem_id);
        let first = h
            .scheduler
            .set_state(&[StateRequest::new(fs1_ref, "removed")], "Remove fs1")
            .unwrap();
        let second = h
            .scheduler
            .set_state(&[StateRequest::new(fs2_ref, "removed")], "Remove fs2")
            .unwrap();

        let remove_job = |command: &CommandRecord| {
            command
                .jobs
                .iter()
                .map(|id| h.scheduler.get_job(*id).unwrap())
                .find(|j| j.class_name == "RemoveFilesystem")
                .unwrap()
        };
        let first_remove = remove_job(&first);
        let second_remove = remove_job(&second);
        assert!(second_remove.wait_for.contains(&first_remove.id));

        for command in [&first, &second] {
            let done = h.wait_for_command(command.id).await.unwrap();
            assert!(!done.errored && !done.cancelled, "{done:?}");
        }
        for fs_ref in [fs1_ref, fs2_ref] {
            let stored = fixtures::stored(h.ctx().store(), fs_ref).unwrap().unwrap();
            assert!(!stored.not_deleted());
        }
        for target_id in fs1.target_ids.iter().chain(&fs2.target_ids) {
            assert_eq!(stored_state(&h, fixtures::target_ref(*target_id)), "removed");
        }
        assert_eq!(stored_state(&h, fixtures::target_ref(fs1.mgs_id)), "mounted");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_agent_errors_the_command_and_raises_alerts() {
        let s = setup();
        let server = fixtures::managed_server(s.store.as_ref(), OSS1, 3).unwrap();
        let fs = mounted_filesystem(s.store.as_ref(), &server, "testfs", None, &server.volume_ids);
        let ost = fixtures::target_ref(fs.target_ids[1]);
        set_stored_state(s.store.as_ref(), ost, "unmounted");

        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();
        h.fleet.connect(OSS1).await;
        h.fleet.set_silent(OSS1, true);

        let command = h
            .scheduler
            .set_state(&[StateRequest::new(ost, "mounted")], "Start OST")
            .unwrap();
        assert_eq!(classes_of(&h, &command), ["StartTarget"]);

        let done = h.wait_for_command(command.id).await.unwrap();
        assert!(done.errored);
        assert_eq!(stored_state(&h, ost), "unmounted");

        let job = h.scheduler.get_job(command.jobs[0]).unwrap();
        assert!(job.errored);
        let steps = h.scheduler.step_results(job.id).unwrap();
        assert!(steps[0].backtrace.contains("timed out waiting for"), "{}", steps[0].backtrace);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let alerts = h.scheduler.alerts(false).unwrap();
        let command_alert = alerts
            .iter()
            .find(|a| a.variant == AlertVariant::CommandErroredAlert)
            .unwrap();
        assert!(!command_alert.active);
        assert!(h
            .scheduler
            .alerts(true)
            .unwrap()
            .iter()
            .any(|a| a.variant == AlertVariant::HostContactAlert));
    }

    #[tokio::test(start_paused = true)]
    async fn force_remove_preempts_and_strands_targets() {
        let s = setup();
        let server = fixtures::managed_server(s.store.as_ref(), "oss2.example.com", 3).unwrap();
        let fs = mounted_filesystem(s.store.as_ref(), &server, "testfs", None, &server.volume_ids);
        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();

        let lnet = EntityRef::new(ClassTag::LnetConfiguration, server.lnet_id);
        let stop = h
            .scheduler
            .set_state(&[StateRequest::new(fs.filesystem_id_ref(), "stopped")], "Stop testfs")
            .unwrap();
        assert!(!stop.complete);

        let host = EntityRef::new(ClassTag::Host, server.host_id);
        let force = h
            .scheduler
            .run_jobs(
                &[JobRequest {
                    class_name: "ForceRemoveHost".to_string(),
                    args: json!({ "host_id": server.host_id }),
                    depends_on_job_range: Vec::new(),
                }],
                "Force remove oss2",
            )
            .unwrap();

        let stopped = h.wait_for_command(stop.id).await.unwrap();
        assert!(stopped.cancelled, "{stopped:?}");
        let done = h.wait_for_command(force.id).await.unwrap();
        assert!(!done.errored && !done.cancelled, "{done:?}");

        let stored_host = fixtures::stored(h.ctx().store(), host).unwrap().unwrap();
        assert_eq!(stored_host.state(), Some("removed"));
        assert!(!stored_host.not_deleted());
        let stored_lnet = fixtures::stored(h.ctx().store(), lnet).unwrap().unwrap();
        assert!(!stored_lnet.not_deleted());
        for target_id in &fs.target_ids {
            let target = fixtures::stored(h.ctx().store(), fixtures::target_ref(*target_id))
                .unwrap()
                .unwrap();
            assert!(!target.not_deleted(), "{target:?}");
        }
        assert!(h.fleet.actions_for("oss2.example.com").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn state_notification_is_refused_during_a_transition() {
        let s = setup();
        let server = fixtures::managed_server(s.store.as_ref(), OSS1, 0).unwrap();
        let lnet = EntityRef::new(ClassTag::LnetConfiguration, server.lnet_id);
        set_stored_state(s.store.as_ref(), lnet, "lnet_down");
        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();
        h.fleet.connect(OSS1).await;

        let command = h
            .scheduler
            .set_state(&[StateRequest::new(lnet, "lnet_up")], "Start LNet")
            .unwrap();
        let outcome = h
            .scheduler
            .notify(Notification {
                item: lnet,
                observed_at: Utc::now(),
                attrs: json!({ "state": "lnet_down" }).as_object().cloned().unwrap(),
                from_states: Vec::new(),
            })
            .unwrap();
        assert!(matches!(outcome, NotifyOutcome::Refused(_)), "{outcome:?}");

        let done = h.wait_for_command(command.id).await.unwrap();
        assert!(!done.errored);
        assert_eq!(stored_state(&h, lnet), "lnet_up");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_job_cancels_its_dependents() {
        let s = setup();
        let server = fixtures::managed_server(s.store.as_ref(), OSS1, 3).unwrap();
        let fs = mounted_filesystem(s.store.as_ref(), &server, "testfs", None, &server.volume_ids);
        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();
        h.fleet.connect(OSS1).await;
        h.fleet.fail_action(OSS1, "stop_target", "device busy");

        let lnet = EntityRef::new(ClassTag::LnetConfiguration, server.lnet_id);
        let command = h
            .scheduler
            .set_state(&[StateRequest::new(lnet, "lnet_down")], "Stop LNet")
            .unwrap();
        let done = h.wait_for_command(command.id).await.unwrap();
        assert!(done.errored);

        let stop_lnet = command
            .jobs
            .iter()
            .map(|id| h.scheduler.get_job(*id).unwrap())
            .find(|j| j.class_name == "StopLNet")
            .unwrap();
        assert!(stop_lnet.cancelled);
        assert_eq!(stored_state(&h, lnet), "lnet_up");
        assert_eq!(
            stored_state(&h, fixtures::target_ref(fs.mgs_id)),
            "mounted"
        );
        assert!(h.ctx().locks().get_by_locked_item(lnet).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resumes_tasked_and_cancels_pending_jobs() {
        let s = setup();
        let server = fixtures::managed_server(s.store.as_ref(), OSS1, 0).unwrap();
        let lnet = EntityRef::new(ClassTag::LnetConfiguration, server.lnet_id);
        set_stored_state(s.store.as_ref(), lnet, "lnet_down");

        let now = Utc::now();
        let start = Job::new(JobClass::StartLnet, server.lnet_id);
        let mut tasked = JobRecord {
            id: JobId::new(s.store.next_id(IdSpace::Job).unwrap()),
            class_name: start.class.name().to_string(),
            args_json: start.args().to_string(),
            description: String::new(),
            state: JobState::Tasked,
            errored: false,
            cancelled: false,
            locks: Vec::new(),
            wait_for: Vec::new(),
            created_at: now,
            modified_at: now,
        };
        tasked.locks.push(StateLock::write(tasked.id, lnet, "lnet_down", "lnet_up"));
        let stop = Job::new(JobClass::StopLnet, server.lnet_id);
        let pending = JobRecord {
            id: JobId::new(s.store.next_id(IdSpace::Job).unwrap()),
            class_name: stop.class.name().to_string(),
            args_json: stop.args().to_string(),
            state: JobState::Pending,
            locks: Vec::new(),
            wait_for: vec![tasked.id],
            ..tasked.clone()
        };
        let command_id = CommandId::new(s.store.next_id(IdSpace::Command).unwrap());
        let mut command = CommandRecord::new(command_id, "Bounce LNet");
        command.jobs = vec![tasked.id, pending.id];

        let mut writes = WriteSet::new();
        writes
            .put_command(command)
            .put_job(tasked.clone())
            .put_job(pending.clone())
            .put_step_result(StepResultRecord {
                id: StepResultId::new(s.store.next_id(IdSpace::StepResult).unwrap()),
                job_id: tasked.id,
                step_index: 0,
                step_count: 2,
                step_class: "StartLNet".to_string(),
                args_json: "{}".to_string(),
                state: StepState::Success,
                log: String::new(),
                backtrace: String::new(),
                console: String::new(),
                result_json: Some("null".to_string()),
                created_at: now,
                modified_at: now,
            });
        s.store.commit(writes).unwrap();

        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();
        h.fleet.connect(OSS1).await;

        assert!(h.scheduler.get_job(pending.id).unwrap().cancelled);
        let done = h.wait_for_command(command_id).await.unwrap();
        assert!(done.cancelled && !done.errored, "{done:?}");
        assert!(h.scheduler.get_job(tasked.id).unwrap().succeeded());
        assert_eq!(stored_state(&h, lnet), "lnet_up");
        assert!(!h.fleet.actions_for(OSS1).contains(&"start_lnet".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn unplannable_request_yields_an_errored_command() {
        let s = setup();
        let server = fixtures::managed_server(s.store.as_ref(), OSS1, 0).unwrap();
        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();

        let ntp = EntityRef::new(ClassTag::NtpConfiguration, server.ntp_id);
        let command = h
            .scheduler
            .set_state(&[StateRequest::new(ntp, "no_such_state")], "Bad request")
            .unwrap();
        assert!(command.complete && command.errored);
        assert!(command.jobs.is_empty());
        assert!(h
            .scheduler
            .alerts(false)
            .unwrap()
            .iter()
            .any(|a| a.variant == AlertVariant::CommandErroredAlert));
    }

    #[tokio::test(start_paused = true)]
    async fn conf_params_are_applied_on_a_mounted_mgs() {
        let s = setup();
        let server = fixtures::managed_server(s.store.as_ref(), OSS1, 3).unwrap();
        let fs = mounted_filesystem(s.store.as_ref(), &server, "testfs", None, &server.volume_ids);
        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();
        h.fleet.connect(OSS1).await;

        let set = h
            .scheduler
            .set_conf_params(&[ConfParamUpdate {
                scope: lustre_manager_store::ConfParamScope::Filesystem {
                    filesystem_id: fs.filesystem_id,
                },
                key: "llite.max_cached_mb".to_string(),
                value: Some("512".to_string()),
            }])
            .unwrap();
        assert_eq!(set.params.len(), 1);
        assert_eq!(set.commands.len(), 1);

        let done = h.wait_for_command(set.commands[0].id).await.unwrap();
        assert!(!done.errored, "{done:?}");
        let mgs = h.ctx().cache().target(fs.mgs_id).unwrap();
        assert_eq!(
            mgs.role,
            TargetRole::Mgs {
                conf_param_version: 1,
                conf_param_version_applied: 1,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mgs_reported_mounted_gets_its_conf_params() {
        let s = setup();
        let server = fixtures::managed_server(s.store.as_ref(), OSS1, 3).unwrap();
        let fs = mounted_filesystem(s.store.as_ref(), &server, "testfs", None, &server.volume_ids);
        let mgs = EntityRef::new(ClassTag::Target, fs.mgs_id);
        set_stored_state(s.store.as_ref(), mgs, "unmounted");
        let h = Harness::start(Arc::clone(&s.store), config()).await.unwrap();
        h.fleet.connect(OSS1).await;

        let set = h
            .scheduler
            .set_conf_params(&[ConfParamUpdate {
                scope: lustre_manager_store::ConfParamScope::Filesystem {
                    filesystem_id: fs.filesystem_id,
                },
                key: "llite.max_cached_mb".to_string(),
                value: Some("512".to_string()),
            }])
            .unwrap();
        assert!(set.commands.is_empty());

        let outcome = h
            .scheduler
            .notify(Notification {
                item: mgs,
                observed_at: Utc::now() + chrono::Duration::seconds(1),
                attrs: json!({ "state": "mounted" }).as_object().cloned().unwrap(),
                from_states: Vec::new(),
            })
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Applied);

        let started = h.ctx().store().list_incomplete_commands().unwrap();
        assert_eq!(started.len(), 1);
        let done = h.wait_for_command(started[0].id).await.unwrap();
        assert!(!done.errored, "{done:?}");
        let applied = h.ctx().cache().target(fs.mgs_id).unwrap();
        assert_eq!(
            applied.role,
            TargetRole::Mgs {
                conf_param_version: 1,
                conf_param_version_applied: 1,
            }
        );
    }

    impl Fs {
        fn filesystem_id_ref(&self) -> EntityRef {
            EntityRef::new(ClassTag::Filesystem, self.filesystem_id)
        }
    }
}
