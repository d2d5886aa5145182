//! Command planning: from a requested state or job list to persisted jobs.
//!
//! Planning happens in two passes.
//!
//! ```text
//! set_state([(item, state), ..])
//!     │
//!     ├─ emit: route item expected → state, one node per hop
//!     │    └─ collect per new node:
//!     │         (a) job dependencies not yet met      → emit, node waits on it
//!     │         (b) static deps of the new state      → emit, node waits on it
//!     │         (c) dependents broken by the new state → emit fix, node waits on it
//!     │
//!     ├─ order: depth first from each node in emission order, waited nodes first
//!     │
//!     └─ create: allocate job ids, take locks, derive wait_for from the
//!                lock chains and the plan's edges, persist command + jobs
//! ```
//!
//! Planning starts from each entity's expected state: the end state of the
//! newest queued write lock, or the committed state when nothing is queued.
//! Every edge is a `(waiter, waited)` pair of node indexes.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::Utc;
use lustre_manager_core::{CommandId, EntityRef, JobId};
use lustre_manager_store::{CommandRecord, IdSpace, JobRecord, JobState, StateLock, WriteSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classes;
use crate::context::SchedulerContext;
use crate::deps::{DepCache, DependOn, Dependency};
use crate::error::{Result, SchedulerError};
use crate::jobs::Job;
use crate::registry;

/// A request to move an entity to a state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRequest {
    /// Entity to move.
    #[serde(flatten)]
    pub item: EntityRef,
    /// Requested state.
    pub state: String,
}

impl StateRequest {
    /// Request `item` to move to `state`.
    pub fn new(item: EntityRef, state: impl Into<String>) -> Self {
        Self {
            item,
            state: state.into(),
        }
    }
}

/// A request to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Job class name.
    pub class_name: String,
    /// Job arguments.
    #[serde(default)]
    pub args: Value,
    /// Indexes of earlier requests in the same call this job waits for.
    #[serde(default)]
    pub depends_on_job_range: Vec<usize>,
}

/// A persisted command and the jobs created for it.
#[derive(Debug, Clone)]
pub struct PlannedCommand {
    /// The command.
    pub command: CommandRecord,
    /// Newly created jobs, in creation order.
    pub jobs: Vec<JobRecord>,
}

/// One job of [`TransitionConsequences`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsequenceJob {
    /// Job class name.
    pub class: String,
    /// Label of the entity the job acts on.
    pub entity: String,
    /// User-visible description.
    pub description: String,
    /// Whether the job asks for confirmation.
    pub requires_confirmation: bool,
    /// Confirmation prompt.
    pub confirmation_prompt: Option<String>,
}

/// What a state change would run, without running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionConsequences {
    /// The job making the requested change itself.
    pub transition_job: Option<ConsequenceJob>,
    /// Everything else that would run, in execution order.
    pub dependency_jobs: Vec<ConsequenceJob>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PlanNode {
    job: Job,
    from: &'static str,
    to: &'static str,
}

impl fmt::Display for PlanNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} -> {})", self.job, self.from, self.to)
    }
}

type Stack = HashMap<EntityRef, String>;

/// Plans one command against a scheduler context.
///
/// A planner is single use. Locks of jobs it creates are entered in the
/// lock cache as each job is created and removed again if planning fails.
pub struct CommandPlanner<'a> {
    ctx: &'a SchedulerContext,
    deps: DepCache,
    nodes: Vec<PlanNode>,
    index: HashMap<PlanNode, usize>,
    edges: Vec<(usize, usize)>,
    created: Vec<JobId>,
}

impl<'a> CommandPlanner<'a> {
    /// A planner with an empty graph.
    #[must_use]
    pub fn new(ctx: &'a SchedulerContext) -> Self {
        Self {
            ctx,
            deps: DepCache::new(),
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            created: Vec::new(),
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Plan and persist a command moving each requested entity to its state.
    ///
    /// An entity already expected to reach its state gets no new job: the
    /// command is attached to the queued job that gets it there instead. A
    /// command with no jobs at all completes at once.
    ///
    /// # Errors
    ///
    /// Returns a validation error (see [`SchedulerError::is_validation`])
    /// when the change cannot be planned, or a store error.
    pub fn set_state(mut self, requests: &[StateRequest], message: &str) -> Result<PlannedCommand> {
        let outcome = self.plan_set_state(requests, message);
        if outcome.is_err() {
            self.rollback();
        }
        outcome
    }

    /// Plan and persist a command running the requested jobs in order.
    ///
    /// # Errors
    ///
    /// Returns `UnknownJobClass`, `InvalidJobArgs` or `InvalidRequest` for
    /// malformed requests, a validation error when a dependency cannot be
    /// planned, or a store error.
    pub fn run_jobs(mut self, requests: &[JobRequest], message: &str) -> Result<PlannedCommand> {
        let outcome = self.plan_run_jobs(requests, message);
        if outcome.is_err() {
            self.rollback();
        }
        outcome
    }

    /// The jobs a `set_state` of `item` to `state` would create, in execution order.
    ///
    /// # Errors
    ///
    /// Returns the same validation errors as [`Self::set_state`].
    pub fn transition_consequences(
        mut self,
        item: EntityRef,
        state: &str,
    ) -> Result<TransitionConsequences> {
        let from = self.checked_start(item, state)?;
        self.emit(item, &from, state, &Stack::new())?;
        let order = self.order()?;

        let cache = self.ctx.cache();
        let describe = |node: &PlanNode| ConsequenceJob {
            class: node.job.class.name().to_string(),
            entity: cache
                .get(node.job.subject())
                .map_or_else(|| node.job.subject().to_string(), |e| e.label()),
            description: node.job.description(cache),
            requires_confirmation: node.job.requires_confirmation(),
            confirmation_prompt: node.job.confirmation_prompt(cache),
        };

        let mut transition_job = None;
        let mut dependency_jobs = Vec::new();
        for idx in order {
            let node = &self.nodes[idx];
            if node.job.subject() == item && node.to == state {
                transition_job = Some(describe(node));
            } else {
                dependency_jobs.push(describe(node));
            }
        }
        Ok(TransitionConsequences {
            transition_job,
            dependency_jobs,
        })
    }

    // =========================================================================
    // set_state / run_jobs
    // =========================================================================

    fn plan_set_state(&mut self, requests: &[StateRequest], message: &str) -> Result<PlannedCommand> {
        if requests.is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "no state changes requested".to_string(),
            ));
        }
        let mut attached: Vec<JobId> = Vec::new();
        for request in requests {
            let (item, state) = (request.item, request.state.as_str());
            let from = self.checked_start(item, state)?;
            if from != state {
                tracing::debug!(item = %item, from = %from, to = state, "Planning state change");
                self.emit(item, &from, state, &Stack::new())?;
                continue;
            }
            if self.ctx.cache().state(item).as_deref() == Some(state) {
                tracing::debug!(item = %item, state, "Already in requested state");
            } else if let Some(lock) = self.ctx.locks().get_latest_write(item, None) {
                tracing::debug!(item = %item, state, job_id = %lock.job_id, "Attaching to queued job");
                if !attached.contains(&lock.job_id) {
                    attached.push(lock.job_id);
                }
            }
        }

        let order = self.order()?;
        let mut command = self.new_command(message)?;
        let jobs = self.create_plan_jobs(&order)?;
        command.jobs = attached;
        command.jobs.extend(jobs.iter().map(|j| j.id));
        command.complete = command.jobs.is_empty();
        self.commit(&command, &jobs)?;

        tracing::info!(
            command_id = %command.id,
            requests = requests.len(),
            jobs = jobs.len(),
            "Planned state change"
        );
        Ok(PlannedCommand { command, jobs })
    }

    fn plan_run_jobs(&mut self, requests: &[JobRequest], message: &str) -> Result<PlannedCommand> {
        if requests.is_empty() {
            return Err(SchedulerError::InvalidRequest("no jobs requested".to_string()));
        }
        let ctx = self.ctx;
        let mut parsed = Vec::with_capacity(requests.len());
        for (i, request) in requests.iter().enumerate() {
            let job = Job::parse(&request.class_name, &request.args)?;
            if !ctx.cache().contains(job.subject()) {
                return Err(SchedulerError::EntityVanished(job.subject()));
            }
            if let Some(bad) = request.depends_on_job_range.iter().find(|&&d| d >= i) {
                return Err(SchedulerError::InvalidRequest(format!(
                    "job {i} cannot depend on job {bad}: only earlier jobs may be named"
                )));
            }
            parsed.push(job);
        }

        // Unmet job dependencies become state changes planned ahead of the
        // requested jobs.
        let mut waits_on: Vec<Vec<usize>> = Vec::with_capacity(parsed.len());
        for &job in &parsed {
            let mut stack = Stack::new();
            if let Some(state) = self.expected_state(job.subject()) {
                stack.insert(job.subject(), state);
            }
            let deps = self.deps.job_deps(ctx.cache(), job);
            let mut waited = Vec::new();
            for leaf in self.unmet_leaves(&deps) {
                let current = self.require_state(leaf.item)?;
                if let Some(node) = self.emit(leaf.item, &current, leaf.preferred_state, &stack)? {
                    waited.push(node);
                }
            }
            waits_on.push(waited);
        }

        let order = self.order()?;
        let mut command = self.new_command(message)?;
        let mut jobs = self.create_plan_jobs(&order)?;
        let node_jobs: HashMap<usize, JobId> = order
            .iter()
            .zip(jobs.iter())
            .map(|(&idx, record)| (idx, record.id))
            .collect();

        let mut requested: Vec<JobId> = Vec::with_capacity(parsed.len());
        for (i, &job) in parsed.iter().enumerate() {
            let mut extra: Vec<JobId> = waits_on[i]
                .iter()
                .filter_map(|idx| node_jobs.get(idx).copied())
                .collect();
            extra.extend(requests[i].depends_on_job_range.iter().map(|&d| requested[d]));

            let transition = self.expected_state(job.subject()).and_then(|state| {
                registry::machine(job.class.subject_class())?
                    .transitions_from(&state)
                    .find(|t| t.job == job.class)
                    .map(|t| (t.from, t.to))
            });
            let record = self.create_job(job, transition, &extra)?;
            requested.push(record.id);
            jobs.push(record);
        }

        command.jobs = jobs.iter().map(|j| j.id).collect();
        self.commit(&command, &jobs)?;
        tracing::info!(
            command_id = %command.id,
            requested = requests.len(),
            jobs = jobs.len(),
            "Planned job run"
        );
        Ok(PlannedCommand { command, jobs })
    }

    /// The state planning for `item` starts from, after validating `state`.
    fn checked_start(&self, item: EntityRef, state: &str) -> Result<String> {
        let invalid = |message: String| SchedulerError::InvalidTransition {
            entity: item,
            message,
        };
        let entity = self
            .ctx
            .cache()
            .get(item)
            .ok_or(SchedulerError::EntityVanished(item))?;
        let machine = registry::machine(item.class)
            .ok_or_else(|| invalid(format!("{} has no states", item.class.as_str())))?;
        if machine.canonical(state).is_none() {
            return Err(invalid(format!("unknown state {state}")));
        }
        if entity.header().is_some_and(|h| h.immutable_state)
            && state != lustre_manager_store::STATE_FORGOTTEN
        {
            return Err(invalid("only forgetting is permitted".to_string()));
        }
        self.require_state(item)
    }

    // =========================================================================
    // Graph construction
    // =========================================================================

    /// Add the route from `from` to `to` on `item`, returning the last hop.
    fn emit(&mut self, item: EntityRef, from: &str, to: &str, stack: &Stack) -> Result<Option<usize>> {
        let mut stack = stack.clone();
        stack.insert(item, to.to_string());
        if from == to {
            return Ok(None);
        }

        let invalid = |message: String| SchedulerError::InvalidTransition {
            entity: item,
            message,
        };
        let machine = registry::machine(item.class)
            .ok_or_else(|| invalid(format!("{} has no states", item.class.as_str())))?;
        let route = machine
            .route(from, to)
            .ok_or_else(|| invalid(format!("no route from {from} to {to}")))?;

        let mut prev = None;
        for hop in route {
            let node = PlanNode {
                job: Job::new(hop.job, item.id),
                from: hop.from,
                to: hop.to,
            };
            let (idx, new) = self.insert(node);
            if new {
                self.collect(idx, &stack)?;
            }
            if let Some(prev) = prev {
                self.edge(idx, prev);
            }
            prev = Some(idx);
        }
        Ok(prev)
    }

    fn collect(&mut self, idx: usize, stack: &Stack) -> Result<()> {
        let node = self.nodes[idx];
        let item = node.job.subject();
        let ctx = self.ctx;
        let cache = ctx.cache();

        let job_deps = self.deps.job_deps(cache, node.job);
        for leaf in self.unmet_leaves(&job_deps) {
            let current = self.require_state(leaf.item)?;
            if let Some(dep) = self.emit(leaf.item, &current, leaf.preferred_state, stack)? {
                self.edge(idx, dep);
            }
        }

        let static_deps = self.deps.state_deps(cache, item, node.to);
        for leaf in static_deps.leaves() {
            if stack.contains_key(&leaf.item) {
                continue;
            }
            let current = self.require_state(leaf.item)?;
            if leaf.accepts(&current) {
                continue;
            }
            if let Some(dep) = self.emit(leaf.item, &current, leaf.preferred_state, stack)? {
                self.edge(idx, dep);
            }
        }

        let entity = cache.get(item).ok_or(SchedulerError::EntityVanished(item))?;
        for dependent in classes::dependents(cache, &entity) {
            if stack.contains_key(&dependent) {
                continue;
            }
            let Some(dependent_state) = self.expected_state(dependent) else {
                continue;
            };
            let their_deps = self.deps.state_deps(cache, dependent, &dependent_state);
            for leaf in their_deps.leaves() {
                if leaf.item != item || leaf.accepts(node.to) {
                    continue;
                }
                let fix = leaf.fix_state.ok_or_else(|| SchedulerError::InvalidTransition {
                    entity: item,
                    message: format!(
                        "{dependent} in state {dependent_state} needs {item} to stay {}",
                        leaf.preferred_state
                    ),
                })?;
                if let Some(fixed) = self.emit(dependent, &dependent_state, fix, stack)? {
                    self.edge(idx, fixed);
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, node: PlanNode) -> (usize, bool) {
        if let Some(&idx) = self.index.get(&node) {
            return (idx, false);
        }
        let idx = self.nodes.len();
        self.nodes.push(node);
        self.index.insert(node, idx);
        (idx, true)
    }

    fn edge(&mut self, waiter: usize, waited: usize) {
        if !self.edges.contains(&(waiter, waited)) {
            self.edges.push((waiter, waited));
        }
    }

    fn waited_by(&self, idx: usize) -> impl Iterator<Item = usize> + '_ {
        self.edges
            .iter()
            .filter(move |(waiter, _)| *waiter == idx)
            .map(|(_, waited)| *waited)
    }

    /// Node indexes with every node after the nodes it waits on.
    ///
    /// Nodes are visited in emission order and each one's waited nodes in
    /// the order their edges were added, so independent dependencies keep
    /// the order their dependency expressions list them in.
    fn order(&self) -> Result<Vec<usize>> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut placed = vec![false; self.nodes.len()];
        for idx in 0..self.nodes.len() {
            self.place(idx, &mut placed, &mut Vec::new(), &mut order)?;
        }
        Ok(order)
    }

    fn place(
        &self,
        idx: usize,
        placed: &mut [bool],
        visiting: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<()> {
        if placed[idx] {
            return Ok(());
        }
        if let Some(at) = visiting.iter().position(|&v| v == idx) {
            let chain: Vec<String> = visiting[at..]
                .iter()
                .chain(std::iter::once(&idx))
                .map(|&i| self.nodes[i].to_string())
                .collect();
            return Err(SchedulerError::CircularDependency(chain.join(" -> ")));
        }
        visiting.push(idx);
        let waited: Vec<usize> = self.waited_by(idx).collect();
        for w in waited {
            self.place(w, placed, visiting, order)?;
        }
        visiting.pop();
        placed[idx] = true;
        order.push(idx);
        Ok(())
    }

    // =========================================================================
    // Job creation
    // =========================================================================

    fn create_plan_jobs(&mut self, order: &[usize]) -> Result<Vec<JobRecord>> {
        let mut ids: HashMap<usize, JobId> = HashMap::new();
        let mut records = Vec::with_capacity(order.len());
        for &idx in order {
            let node = self.nodes[idx];
            let waits: Vec<JobId> = self
                .waited_by(idx)
                .filter_map(|w| ids.get(&w).copied())
                .collect();
            let record = self.create_job(node.job, Some((node.from, node.to)), &waits)?;
            ids.insert(idx, record.id);
            records.push(record);
        }
        Ok(records)
    }

    fn create_job(
        &mut self,
        job: Job,
        transition: Option<(&'static str, &'static str)>,
        extra_wait: &[JobId],
    ) -> Result<JobRecord> {
        let id = JobId::new(self.ctx.next_id(IdSpace::Job)?);
        let locks = self.job_locks(id, job, transition)?;
        let mut wait_for = self.wait_for(id, &locks)?;
        wait_for.extend(extra_wait.iter().copied());
        wait_for.remove(&id);

        for lock in &locks {
            self.ctx.locks().add(lock.clone());
        }
        self.created.push(id);

        let now = Utc::now();
        let record = JobRecord {
            id,
            class_name: job.class.name().to_string(),
            args_json: job.args().to_string(),
            description: job.description(self.ctx.cache()),
            state: JobState::Pending,
            errored: false,
            cancelled: false,
            locks,
            wait_for: wait_for.into_iter().collect(),
            created_at: now,
            modified_at: now,
        };
        tracing::debug!(
            job_id = %id,
            job = %job,
            wait_for = ?record.wait_for,
            "Job created"
        );
        Ok(record)
    }

    fn job_locks(
        &mut self,
        job_id: JobId,
        job: Job,
        transition: Option<(&'static str, &'static str)>,
    ) -> Result<Vec<StateLock>> {
        let ctx = self.ctx;
        let cache = ctx.cache();
        let mut locks = Vec::new();

        let job_deps = self.deps.job_deps(cache, job);
        self.check_reads(job_id, &job_deps)?;
        for leaf in job_deps.leaves() {
            push_unique(&mut locks, StateLock::read(job_id, leaf.item));
        }
        if let Some((from, to)) = transition {
            let item = job.subject();
            for state in [from, to] {
                let state_deps = self.deps.state_deps(cache, item, state);
                if state == to {
                    self.check_reads(job_id, &state_deps)?;
                }
                for leaf in state_deps.leaves() {
                    push_unique(&mut locks, StateLock::read(job_id, leaf.item));
                }
            }
            push_unique(&mut locks, StateLock::write(job_id, item, from, to));
        }
        for spec in job.create_locks(cache) {
            let lock = match (spec.write, spec.begin, spec.end) {
                (true, Some(begin), Some(end)) => StateLock::write(job_id, spec.item, begin, end),
                (true, _, _) => StateLock::exclusive(job_id, spec.item),
                (false, _, _) => StateLock::read(job_id, spec.item),
            };
            push_unique(&mut locks, lock);
        }
        Ok(locks)
    }

    /// Fails when a queued write leaves an item of `dep` in a state the job
    /// cannot read.
    fn check_reads(&self, job_id: JobId, dep: &Dependency) -> Result<()> {
        let lock_cache = self.ctx.locks();
        let queued_end = |item| {
            lock_cache
                .get_latest_write(item, Some(job_id))
                .and_then(|w| {
                    let writer = w.job_id;
                    w.end_state.map(|end| (writer, end))
                })
        };
        match unreadable(dep, &queued_end) {
            None => Ok(()),
            Some((leaf, writer, end)) => Err(SchedulerError::LockConflict {
                item: leaf.item,
                message: format!(
                    "job {job_id} reads it as {} but job {writer} leaves it {end}",
                    leaf.preferred_state
                ),
            }),
        }
    }

    /// Jobs that must complete before a job holding `locks` may start.
    fn wait_for(&self, job_id: JobId, locks: &[StateLock]) -> Result<BTreeSet<JobId>> {
        let lock_cache = self.ctx.locks();
        let mut wait = BTreeSet::new();
        for lock in locks {
            let item = lock.locked_item;
            let prior = lock_cache.get_latest_write(item, Some(job_id));
            if !lock.write {
                wait.extend(prior.map(|p| p.job_id));
                continue;
            }
            if prior.is_none() {
                let current = self.ctx.cache().state(item);
                if let (Some(begin), Some(current)) = (&lock.begin_state, current) {
                    if *begin != current {
                        return Err(SchedulerError::LockConflict {
                            item,
                            message: format!("job {job_id} starts from {begin} but it is {current}"),
                        });
                    }
                }
            }
            if let Some(prior) = &prior {
                if let (Some(begin), Some(end)) = (&lock.begin_state, &prior.end_state) {
                    if begin != end {
                        return Err(SchedulerError::LockConflict {
                            item,
                            message: format!(
                                "job {job_id} starts from {begin} but job {} leaves it {end}",
                                prior.job_id
                            ),
                        });
                    }
                }
                wait.insert(prior.job_id);
            }
            let barrier = prior.map_or(JobId::new(0), |p| p.job_id);
            wait.extend(
                lock_cache
                    .get_read_locks(item, barrier, Some(job_id))
                    .into_iter()
                    .map(|l| l.job_id),
            );
        }
        Ok(wait)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn expected_state(&self, item: EntityRef) -> Option<String> {
        self.ctx
            .locks()
            .expected_state(item)
            .or_else(|| self.ctx.cache().state(item))
    }

    fn require_state(&self, item: EntityRef) -> Result<String> {
        self.expected_state(item)
            .ok_or(SchedulerError::EntityVanished(item))
    }

    /// Leaves of `dep` the planner must act on, judged by expected state.
    /// An unmet `Any` is satisfied through its first branch.
    fn unmet_leaves(&self, dep: &Dependency) -> Vec<DependOn> {
        let state_of = |item| self.expected_state(item);
        let mut out = Vec::new();
        unmet(dep, &state_of, &mut out);
        out
    }

    fn new_command(&self, message: &str) -> Result<CommandRecord> {
        let id = CommandId::new(self.ctx.next_id(IdSpace::Command)?);
        Ok(CommandRecord::new(id, message))
    }

    fn commit(&self, command: &CommandRecord, jobs: &[JobRecord]) -> Result<()> {
        let mut writes = WriteSet::new();
        writes.put_command(command.clone());
        for job in jobs {
            writes.put_job(job.clone());
        }
        self.ctx.write(writes)
    }

    fn rollback(&mut self) {
        for job_id in self.created.drain(..) {
            self.ctx.locks().remove_job(job_id);
        }
    }
}

fn unmet(dep: &Dependency, state_of: &impl Fn(EntityRef) -> Option<String>, out: &mut Vec<DependOn>) {
    match dep {
        Dependency::On(leaf) => {
            if !state_of(leaf.item).is_some_and(|s| leaf.accepts(&s)) {
                out.push(leaf.clone());
            }
        }
        Dependency::All(children) => {
            for child in children {
                unmet(child, state_of, out);
            }
        }
        Dependency::Any(children) => {
            if !dep.satisfied(state_of) {
                if let Some(first) = children.first() {
                    unmet(first, state_of, out);
                }
            }
        }
    }
}

/// The first leaf of `dep` whose queued end state fails it, with the writer
/// and that state. Leaves with no queued write are not judged.
fn unreadable<'d>(
    dep: &'d Dependency,
    queued_end: &impl Fn(EntityRef) -> Option<(JobId, String)>,
) -> Option<(&'d DependOn, JobId, String)> {
    match dep {
        Dependency::On(leaf) => queued_end(leaf.item)
            .filter(|(_, end)| !leaf.accepts(end))
            .map(|(writer, end)| (leaf, writer, end)),
        Dependency::All(children) => children.iter().find_map(|c| unreadable(c, queued_end)),
        Dependency::Any(children) => children
            .iter()
            .map(|c| unreadable(c, queued_end))
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .next(),
    }
}

fn push_unique(locks: &mut Vec<StateLock>, lock: StateLock) {
    if !locks.contains(&lock) {
        locks.push(lock);
    }
}

/// Persist a command rejected during planning: complete, errored, no jobs.
///
/// # Errors
///
/// Returns a store error if the command cannot be written.
pub fn reject(ctx: &SchedulerContext, message: &str, reason: &SchedulerError) -> Result<CommandRecord> {
    let id = CommandId::new(ctx.next_id(IdSpace::Command)?);
    let mut command = CommandRecord::new(id, message);
    command.complete = true;
    command.errored = true;
    command.error = Some(reason.to_string());
    let mut writes = WriteSet::new();
    writes.put_command(command.clone());
    ctx.write(writes)?;
    tracing::warn!(command_id = %id, error = %reason, "Command rejected");
    Ok(command)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lustre_manager_core::{ClassTag, EntityId};
    use lustre_manager_store::{
        CorosyncConfiguration, Entity, LnetConfiguration, NtpConfiguration,
        PacemakerConfiguration, RocksStore, StatefulHeader, Store,
    };
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::agent_rpc::{AgentMessenger, Transport};
    use crate::config::SchedulerConfig;
    use crate::jobs::JobClass;
    use crate::local::LocalActions;
    use crate::mock::fixtures::{self, Layout};
    use crate::mock::{MockAgentFleet, MockLocalActions};

    fn context() -> (TempDir, SchedulerContext) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let config = SchedulerConfig::default();
        let fleet = MockAgentFleet::new();
        let messenger = Arc::new(AgentMessenger::new(fleet as Arc<dyn Transport>, &config));
        let local = MockLocalActions::new() as Arc<dyn LocalActions>;
        let ctx = SchedulerContext::new(store, config, messenger, local).unwrap();
        (dir, ctx)
    }

    fn set(ctx: &SchedulerContext, item: EntityRef, state: &str) {
        let mut entity = ctx.cache().get(item).unwrap();
        entity.header_mut().unwrap().set_state(state, Utc::now());
        ctx.cache().add(entity);
    }

    fn target(id: EntityId) -> EntityRef {
        EntityRef::new(ClassTag::Target, id)
    }

    fn lnet(layout: &Layout) -> EntityRef {
        EntityRef::new(ClassTag::LnetConfiguration, layout.lnet_id)
    }

    fn classes(jobs: &[JobRecord]) -> Vec<&str> {
        jobs.iter().map(|j| j.class_name.as_str()).collect()
    }

    fn undeployed_host(ctx: &SchedulerContext) -> EntityRef {
        let host_id = EntityId::new(1);
        let header = |id: u64| StatefulHeader::new(EntityId::new(id), "unconfigured");
        let cache = ctx.cache();
        cache.add(fixtures::host(1, "h1.example.com", "undeployed").into());
        cache.add(Entity::from(NtpConfiguration {
            header: header(2),
            host_id,
            server: None,
        }));
        cache.add(Entity::from(CorosyncConfiguration {
            header: header(3),
            host_id,
            mcast_port: None,
            corosync_reported_up: false,
        }));
        cache.add(Entity::from(PacemakerConfiguration {
            header: header(4),
            host_id,
        }));
        cache.add(Entity::from(LnetConfiguration {
            header: header(5),
            host_id,
            nids: Vec::new(),
        }));
        EntityRef::new(ClassTag::Host, host_id)
    }

    #[test]
    fn host_setup_runs_in_dependency_order() {
        let (_dir, ctx) = context();
        let host = undeployed_host(&ctx);

        let planned = CommandPlanner::new(&ctx)
            .set_state(&[StateRequest::new(host, "managed")], "Set up h1")
            .unwrap();
        assert_eq!(
            classes(&planned.jobs),
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

        let setup = planned.jobs.last().unwrap();
        for earlier in &planned.jobs[1..6] {
            assert!(setup.wait_for.contains(&earlier.id), "{}", earlier.class_name);
        }
        assert_eq!(
            ctx.locks().expected_state(host).as_deref(),
            Some("managed")
        );
        let stored = ctx.store().get_command(planned.command.id).unwrap().unwrap();
        assert_eq!(stored.jobs.len(), 7);
        assert!(!stored.complete);
    }

    #[test]
    fn stopping_lnet_stops_mounted_targets_first() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());
        for id in [layout.mgs_id, layout.mdt_id, layout.ost_id] {
            set(&ctx, target(id), "mounted");
        }

        let planned = CommandPlanner::new(&ctx)
            .set_state(&[StateRequest::new(lnet(&layout), "lnet_down")], "Stop LNet")
            .unwrap();
        assert_eq!(
            classes(&planned.jobs),
            ["StopTarget", "StopTarget", "StopTarget", "StopLNet"]
        );
        let stop_lnet = &planned.jobs[3];
        for stop in &planned.jobs[..3] {
            assert!(stop_lnet.wait_for.contains(&stop.id));
        }
    }

    #[test]
    fn expected_state_needs_no_jobs() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());

        let planned = CommandPlanner::new(&ctx)
            .set_state(&[StateRequest::new(lnet(&layout), "lnet_up")], "Start LNet")
            .unwrap();
        assert!(planned.jobs.is_empty());
        assert!(planned.command.complete);
        assert!(!planned.command.errored);
    }

    #[test]
    fn queued_change_is_shared() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());

        let first = CommandPlanner::new(&ctx)
            .set_state(&[StateRequest::new(lnet(&layout), "lnet_down")], "Stop LNet")
            .unwrap();
        let second = CommandPlanner::new(&ctx)
            .set_state(&[StateRequest::new(lnet(&layout), "lnet_down")], "Stop LNet again")
            .unwrap();
        assert!(second.jobs.is_empty());
        assert!(!second.command.complete);
        assert_eq!(second.command.jobs, [first.jobs[0].id]);
    }

    #[test]
    fn later_commands_queue_behind_earlier_ones() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());

        let stop = CommandPlanner::new(&ctx)
            .set_state(&[StateRequest::new(lnet(&layout), "lnet_down")], "Stop LNet")
            .unwrap();
        let start = CommandPlanner::new(&ctx)
            .set_state(&[StateRequest::new(lnet(&layout), "lnet_up")], "Start LNet")
            .unwrap();
        assert_eq!(classes(&start.jobs), ["StartLNet"]);
        assert!(start.jobs[0].wait_for.contains(&stop.jobs[0].id));
        let write = start.jobs[0].transition_lock(lnet(&layout)).unwrap();
        assert_eq!(write.begin_state.as_deref(), Some("lnet_down"));
    }

    #[test]
    fn first_write_must_start_from_current_state() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());
        set(&ctx, target(layout.ost_id), "unmounted");

        let request = JobRequest {
            class_name: "FailoverTarget".to_string(),
            args: json!({ "target_id": layout.ost_id.get() }),
            depends_on_job_range: Vec::new(),
        };
        let err = CommandPlanner::new(&ctx)
            .run_jobs(&[request], "Failover OST")
            .unwrap_err();
        match err {
            SchedulerError::LockConflict { item, message } => {
                assert_eq!(item, target(layout.ost_id));
                assert!(message.contains("starts from mounted but it is unmounted"), "{message}");
            }
            other => panic!("expected a lock conflict, got {other}"),
        }
        assert_eq!(ctx.locks().job_count(), 0);
    }

    #[test]
    fn read_must_see_the_state_a_queued_write_leaves() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());
        set(&ctx, target(layout.mgs_id), "unmounted");
        let stop = CommandPlanner::new(&ctx)
            .set_state(&[StateRequest::new(lnet(&layout), "lnet_down")], "Stop LNet")
            .unwrap();
        let stop_lnet = stop.jobs.last().unwrap().id;

        let mut planner = CommandPlanner::new(&ctx);
        let start = Job::new(JobClass::StartTarget, layout.mgs_id);
        let err = planner
            .create_job(start, Some(("unmounted", "mounted")), &[])
            .unwrap_err();
        match err {
            SchedulerError::LockConflict { item, message } => {
                assert_eq!(item, lnet(&layout));
                assert!(
                    message.contains(&format!("reads it as lnet_up but job {stop_lnet} leaves it lnet_down")),
                    "{message}"
                );
            }
            other => panic!("expected a lock conflict, got {other}"),
        }
        assert_eq!(ctx.locks().job_count(), stop.jobs.len());
    }

    #[test]
    fn unreachable_state_is_rejected() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());
        let host = EntityRef::new(ClassTag::Host, layout.host_id);

        let err = CommandPlanner::new(&ctx)
            .set_state(&[StateRequest::new(host, "undeployed")], "Undeploy")
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
        assert!(err.is_validation());
        assert_eq!(ctx.locks().job_count(), 0);
    }

    #[test]
    fn unknown_state_is_rejected() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());
        let err = CommandPlanner::new(&ctx)
            .set_state(&[StateRequest::new(lnet(&layout), "sideways")], "Nope")
            .unwrap_err();
        assert!(err.to_string().contains("unknown state sideways"));
    }

    #[test]
    fn run_jobs_plans_unmet_dependencies_first() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());
        set(&ctx, lnet(&layout), "lnet_down");
        set(&ctx, target(layout.mgs_id), "unmounted");

        let request = JobRequest {
            class_name: "StartTarget".to_string(),
            args: json!({ "target_id": layout.mgs_id.get() }),
            depends_on_job_range: Vec::new(),
        };
        let planned = CommandPlanner::new(&ctx)
            .run_jobs(&[request], "Start MGS")
            .unwrap();
        assert_eq!(classes(&planned.jobs), ["StartLNet", "StartTarget"]);
        let start = &planned.jobs[1];
        assert!(start.wait_for.contains(&planned.jobs[0].id));
        let write = start.transition_lock(target(layout.mgs_id)).unwrap();
        assert_eq!(write.end_state.as_deref(), Some("mounted"));
    }

    #[test]
    fn run_jobs_honours_requested_ordering() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());
        let requests = [
            JobRequest {
                class_name: "StopCorosync".to_string(),
                args: json!({ "corosync_configuration_id": layout.corosync_id.get() }),
                depends_on_job_range: Vec::new(),
            },
            JobRequest {
                class_name: "RebootHost".to_string(),
                args: json!({ "host_id": layout.host_id.get() }),
                depends_on_job_range: vec![0],
            },
        ];
        let planned = CommandPlanner::new(&ctx)
            .run_jobs(&requests, "Stop and reboot")
            .unwrap();
        let reboot = planned
            .jobs
            .iter()
            .find(|j| j.class_name == "RebootHost")
            .unwrap();
        let stop = planned
            .jobs
            .iter()
            .find(|j| j.class_name == "StopCorosync")
            .unwrap();
        assert!(reboot.wait_for.contains(&stop.id));
    }

    #[test]
    fn run_jobs_rejects_forward_references() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());
        let request = JobRequest {
            class_name: "RebootHost".to_string(),
            args: json!({ "host_id": layout.host_id.get() }),
            depends_on_job_range: vec![0],
        };
        let err = CommandPlanner::new(&ctx)
            .run_jobs(&[request], "Reboot")
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }

    #[test]
    fn consequences_plan_without_creating_jobs() {
        let (_dir, ctx) = context();
        let layout = fixtures::single_server_filesystem(ctx.cache());
        for id in [layout.mgs_id, layout.mdt_id, layout.ost_id] {
            set(&ctx, target(id), "mounted");
        }

        let consequences = CommandPlanner::new(&ctx)
            .transition_consequences(lnet(&layout), "lnet_down")
            .unwrap();
        let transition = consequences.transition_job.unwrap();
        assert_eq!(transition.class, "StopLNet");
        assert!(transition.requires_confirmation);
        assert_eq!(consequences.dependency_jobs.len(), 3);
        assert!(consequences
            .dependency_jobs
            .iter()
            .all(|j| j.class == "StopTarget" && j.confirmation_prompt.is_some()));
        assert_eq!(ctx.locks().job_count(), 0);
        assert!(ctx.store().list_incomplete_jobs().unwrap().is_empty());
    }

    #[test]
    fn rejected_commands_are_recorded() {
        let (_dir, ctx) = context();
        let reason = SchedulerError::CircularDependency("a -> b -> a".to_string());
        let command = reject(&ctx, "Loop", &reason).unwrap();
        let stored = ctx.store().get_command(command.id).unwrap().unwrap();
        assert!(stored.complete && stored.errored);
        assert!(stored.jobs.is_empty());
        assert_eq!(stored.error.as_deref(), Some("circular dependency: a -> b -> a"));
    }

    #[test]
    fn state_request_wire_format() {
        let request: StateRequest =
            serde_json::from_value(json!({ "class_tag": "target", "id": 7, "state": "mounted" }))
                .unwrap();
        assert_eq!(request.item, target(EntityId::new(7)));
        assert_eq!(request.state, "mounted");
    }
}
