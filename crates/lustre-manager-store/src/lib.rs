//! `RocksDB` storage layer for the Lustre manager.
//!
//! This crate is the single durable record of the system: the entity model
//! (hosts, configurations, targets, filesystems, ...) and the scheduler's
//! commands, jobs, step results and alerts.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `entities`: entity records, keyed by `class_tag || id`
//! - `commands` / `commands_incomplete`: commands and the index of open ones
//! - `jobs` / `jobs_incomplete`: jobs and the index of unfinished ones
//! - `step_results`: step executions, keyed by `job_id || step_result_id`
//! - `alerts` / `alerts_active`: alert records and the active-alert index
//! - `counters`: monotonic id allocation
//!
//! Multi-record changes go through a [`WriteSet`], committed as a single
//! `RocksDB` write batch.
//!
//! # Example
//!
//! ```no_run
//! use lustre_manager_core::ClassTag;
//! use lustre_manager_store::{RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/lustre-manager-db").unwrap();
//! let hosts = store.list_entities(ClassTag::Host).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod entities;
pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;
pub mod write_set;

pub use entities::{
    is_terminal_state, ClientMount, ConfParam, ConfParamScope, Copytool, CorosyncConfiguration,
    Entity, Filesystem, Host, LnetConfiguration, NtpConfiguration, PacemakerConfiguration,
    ServerProfile, StatefulHeader, Target, TargetMount, TargetRole, Volume, VolumeNode,
    STATE_FORGOTTEN, STATE_REMOVED,
};
pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    AlertRecord, AlertSeverity, AlertSubject, AlertVariant, CommandRecord, JobRecord, JobState,
    StateLock, StepResultRecord, StepState,
};
pub use write_set::{WriteOp, WriteSet};

use lustre_manager_core::{ClassTag, CommandId, EntityRef, JobId};

/// Id allocation spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdSpace {
    /// Entity ids (shared by all classes).
    Entity,
    /// Command ids.
    Command,
    /// Job ids.
    Job,
    /// Step result ids.
    StepResult,
    /// Alert ids.
    Alert,
}

impl IdSpace {
    /// Counter name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entity => "entity",
            Self::Command => "command",
            Self::Job => "job",
            Self::StepResult => "step_result",
            Self::Alert => "alert",
        }
    }
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer so the scheduler can be driven by
/// `RocksDB` in production and by a temporary database in tests.
pub trait Store: Send + Sync {
    // =========================================================================
    // Id Allocation
    // =========================================================================

    /// Allocate the next id in `space`. Ids start at 1 and never repeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn next_id(&self, space: IdSpace) -> Result<u64>;

    // =========================================================================
    // Entity Operations
    // =========================================================================

    /// Get an entity by reference, including deleted ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_entity(&self, item: EntityRef) -> Result<Option<Entity>>;

    /// List all entities of a class, including deleted ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_entities(&self, class: ClassTag) -> Result<Vec<Entity>>;

    // =========================================================================
    // Command Operations
    // =========================================================================

    /// Get a command by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_command(&self, id: CommandId) -> Result<Option<CommandRecord>>;

    /// List commands that have not completed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_incomplete_commands(&self) -> Result<Vec<CommandRecord>>;

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Get a job by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_job(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// List jobs that have not completed, in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_incomplete_jobs(&self) -> Result<Vec<JobRecord>>;

    /// List the step results of a job, in creation order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_step_results(&self, job_id: JobId) -> Result<Vec<StepResultRecord>>;

    // =========================================================================
    // Alert Operations
    // =========================================================================

    /// The active alert for `(variant, subject)`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_active_alert(
        &self,
        variant: AlertVariant,
        subject: AlertSubject,
    ) -> Result<Option<AlertRecord>>;

    /// List all active alerts.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_active_alerts(&self) -> Result<Vec<AlertRecord>>;

    /// List all alert records, active and historical.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_alerts(&self) -> Result<Vec<AlertRecord>>;

    // =========================================================================
    // Writes
    // =========================================================================

    /// Commit a group of writes atomically, maintaining all indexes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the database write fails; in that
    /// case nothing from the group is written.
    fn commit(&self, writes: WriteSet) -> Result<()>;

    /// Insert or replace a single entity.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_entity(&self, entity: &Entity) -> Result<()> {
        let mut writes = WriteSet::new();
        writes.put_entity(entity.clone());
        self.commit(writes)
    }

    /// Insert or replace a single job.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_job(&self, job: &JobRecord) -> Result<()> {
        let mut writes = WriteSet::new();
        writes.put_job(job.clone());
        self.commit(writes)
    }

    /// Insert or replace a single step result.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_step_result(&self, step: &StepResultRecord) -> Result<()> {
        let mut writes = WriteSet::new();
        writes.put_step_result(step.clone());
        self.commit(writes)
    }
}
