//! Scheduler records stored in the database.
//!
//! These types are the durable record of commands, jobs, step executions and
//! alerts. The scheduler's in-memory caches are derived from them at startup.

use chrono::{DateTime, Utc};
use lustre_manager_core::{AlertId, CommandId, EntityRef, JobId, StepResultId};
use serde::{Deserialize, Serialize};

/// A user-originated request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Command id.
    pub id: CommandId,
    /// User-visible message.
    pub message: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Terminal flag.
    pub complete: bool,
    /// Some job of the command errored.
    pub errored: bool,
    /// Some job of the command was cancelled.
    pub cancelled: bool,
    /// Jobs belonging to the command. A job may belong to several commands.
    pub jobs: Vec<JobId>,
    /// Why the command was rejected before any job was created.
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandRecord {
    /// A fresh, incomplete command.
    #[must_use]
    pub fn new(id: CommandId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            created_at: Utc::now(),
            complete: false,
            errored: false,
            cancelled: false,
            jobs: Vec::new(),
            error: None,
        }
    }
}

/// Job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting on `wait_for` jobs.
    Pending,
    /// Handed to the runner.
    Tasked,
    /// Finished; see `errored` and `cancelled`.
    Complete,
}

/// A read or write lock held by a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateLock {
    /// Job holding the lock.
    pub job_id: JobId,
    /// Locked entity.
    pub locked_item: EntityRef,
    /// Write lock when true, read lock otherwise.
    pub write: bool,
    /// State the item must be in when the job starts (write locks only).
    pub begin_state: Option<String>,
    /// State the item will be in when the job completes (write locks only).
    pub end_state: Option<String>,
}

impl StateLock {
    /// A read lock.
    #[must_use]
    pub const fn read(job_id: JobId, locked_item: EntityRef) -> Self {
        Self {
            job_id,
            locked_item,
            write: false,
            begin_state: None,
            end_state: None,
        }
    }

    /// A write lock across a state change.
    #[must_use]
    pub fn write(job_id: JobId, locked_item: EntityRef, begin: &str, end: &str) -> Self {
        Self {
            job_id,
            locked_item,
            write: true,
            begin_state: Some(begin.to_string()),
            end_state: Some(end.to_string()),
        }
    }

    /// A write lock that does not describe a state change.
    #[must_use]
    pub const fn exclusive(job_id: JobId, locked_item: EntityRef) -> Self {
        Self {
            job_id,
            locked_item,
            write: true,
            begin_state: None,
            end_state: None,
        }
    }
}

/// A unit of work owned by one or more commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub id: JobId,
    /// Job class name, the tag of `args_json`.
    pub class_name: String,
    /// Tagged JSON arguments.
    pub args_json: String,
    /// Rendered description at creation time.
    pub description: String,
    /// Lifecycle state.
    pub state: JobState,
    /// Finished with an error.
    pub errored: bool,
    /// Finished by cancellation.
    pub cancelled: bool,
    /// Locks taken by the job.
    pub locks: Vec<StateLock>,
    /// Jobs that must complete before this one starts.
    pub wait_for: Vec<JobId>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified_at: DateTime<Utc>,
}

impl JobRecord {
    /// Whether the job has finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == JobState::Complete
    }

    /// Whether the job finished successfully.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.is_complete() && !self.errored && !self.cancelled
    }

    /// The write lock that describes the state change of `subject`, if any.
    #[must_use]
    pub fn transition_lock(&self, subject: EntityRef) -> Option<&StateLock> {
        self.locks.iter().find(|l| {
            l.write && l.locked_item == subject && l.begin_state.is_some() && l.end_state.is_some()
        })
    }
}

/// Outcome of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Started and not finished (or interrupted).
    Incomplete,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failed,
}

/// Per-step execution record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResultRecord {
    /// Record id.
    pub id: StepResultId,
    /// Owning job.
    pub job_id: JobId,
    /// Zero-based index of the step in the job.
    pub step_index: usize,
    /// Number of steps in the job.
    pub step_count: usize,
    /// Step class name.
    pub step_class: String,
    /// Tagged JSON arguments.
    pub args_json: String,
    /// Outcome.
    pub state: StepState,
    /// Log lines written by the step.
    pub log: String,
    /// Backtrace of a failure.
    pub backtrace: String,
    /// Console output of remote subprocesses.
    pub console: String,
    /// JSON result.
    pub result_json: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub modified_at: DateTime<Utc>,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Service affected.
    Error,
}

/// Alert variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[repr(u8)]
pub enum AlertVariant {
    /// Agent contact with a host is lost.
    HostContactAlert = 1,
    /// A host rebooted.
    HostRebootEvent = 2,
    /// LNet is down on a host that should have it up.
    LnetOfflineAlert = 3,
    /// Corosync is stopped on a configured host.
    CorosyncStoppedAlert = 4,
    /// Pacemaker is stopped on a configured host.
    PacemakerStoppedAlert = 5,
    /// A target went unmounted without a job stopping it.
    TargetOfflineAlert = 6,
    /// A target is running on a secondary server.
    TargetFailoverAlert = 7,
    /// A command completed successfully.
    CommandSuccessfulAlert = 8,
    /// A command completed with an errored job.
    CommandErroredAlert = 9,
    /// A command completed with a cancelled job.
    CommandCancelledAlert = 10,
}

impl AlertVariant {
    /// Convert the variant to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Command alerts are historical and never active.
    #[must_use]
    pub const fn is_command_alert(self) -> bool {
        matches!(
            self,
            Self::CommandSuccessfulAlert | Self::CommandErroredAlert | Self::CommandCancelledAlert
        )
    }
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertSubject {
    /// An entity.
    Entity {
        /// The entity.
        item: EntityRef,
    },
    /// A command.
    Command {
        /// The command.
        command_id: CommandId,
    },
}

impl AlertSubject {
    /// Index key fragment.
    #[must_use]
    pub fn to_key(self) -> Vec<u8> {
        match self {
            Self::Entity { item } => {
                let mut key = vec![0u8];
                key.extend_from_slice(&item.to_key());
                key
            }
            Self::Command { command_id } => {
                let mut key = vec![1u8];
                key.extend_from_slice(&command_id.to_be_bytes());
                key
            }
        }
    }
}

/// Per-subject condition record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Record id.
    pub id: AlertId,
    /// Alert variant.
    pub variant: AlertVariant,
    /// What the alert is about.
    pub subject: AlertSubject,
    /// When the condition began.
    pub begin: DateTime<Utc>,
    /// When the condition ended.
    pub end: Option<DateTime<Utc>>,
    /// At most one active record per `(variant, subject)`.
    pub active: bool,
    /// Severity.
    pub severity: AlertSeverity,
    /// User-visible message.
    pub message: String,
    /// Dismissed by a user.
    pub dismissed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lustre_manager_core::{ClassTag, EntityId};

    #[test]
    fn transition_lock_skips_exclusive_locks() {
        let item = EntityRef::new(ClassTag::Host, EntityId::new(1));
        let record = JobRecord {
            id: JobId::new(4),
            class_name: "ForceRemoveHost".to_string(),
            args_json: "{}".to_string(),
            description: String::new(),
            state: JobState::Pending,
            errored: false,
            cancelled: false,
            locks: vec![
                StateLock::exclusive(JobId::new(4), item),
                StateLock::read(JobId::new(4), item),
            ],
            wait_for: Vec::new(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
        };
        assert!(record.transition_lock(item).is_none());
        assert!(!record.succeeded());
    }

    #[test]
    fn command_alerts_are_flagged() {
        assert!(AlertVariant::CommandErroredAlert.is_command_alert());
        assert!(!AlertVariant::TargetOfflineAlert.is_command_alert());
    }

    #[test]
    fn alert_subject_keys_are_distinct() {
        let entity = AlertSubject::Entity {
            item: EntityRef::new(ClassTag::Host, EntityId::new(1)),
        };
        let command = AlertSubject::Command {
            command_id: CommandId::new(1),
        };
        assert_ne!(entity.to_key(), command.to_key());
    }
}
