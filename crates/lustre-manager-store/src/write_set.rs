//! Atomic groups of writes.

use crate::entities::Entity;
use crate::types::{AlertRecord, CommandRecord, JobRecord, StepResultRecord};

/// One record write.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert or replace an entity.
    Entity(Entity),
    /// Insert or replace a command.
    Command(CommandRecord),
    /// Insert or replace a job.
    Job(JobRecord),
    /// Insert or replace a step result.
    StepResult(StepResultRecord),
    /// Insert or replace an alert.
    Alert(AlertRecord),
}

/// A group of writes committed in one batch.
///
/// Used wherever several records must change together: a command with all
/// of its jobs, a job completion with the state change it commits.
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    ops: Vec<WriteOp>,
}

impl WriteSet {
    /// An empty write set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an entity write.
    pub fn put_entity(&mut self, entity: Entity) -> &mut Self {
        self.ops.push(WriteOp::Entity(entity));
        self
    }

    /// Queue a command write.
    pub fn put_command(&mut self, command: CommandRecord) -> &mut Self {
        self.ops.push(WriteOp::Command(command));
        self
    }

    /// Queue a job write.
    pub fn put_job(&mut self, job: JobRecord) -> &mut Self {
        self.ops.push(WriteOp::Job(job));
        self
    }

    /// Queue a step result write.
    pub fn put_step_result(&mut self, step: StepResultRecord) -> &mut Self {
        self.ops.push(WriteOp::StepResult(step));
        self
    }

    /// Queue an alert write.
    pub fn put_alert(&mut self, alert: AlertRecord) -> &mut Self {
        self.ops.push(WriteOp::Alert(alert));
        self
    }

    /// Append all writes of `other`.
    pub fn extend(&mut self, other: Self) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of queued writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Entities touched by this write set.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.ops.iter().filter_map(|op| match op {
            WriteOp::Entity(e) => Some(e),
            _ => None,
        })
    }

    /// Consume into the queued operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}
