//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use lustre_manager_core::{ClassTag, CommandId, EntityRef, JobId};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode,
    MultiThreaded, Options, WriteBatch,
};

use crate::entities::Entity;
use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{
    AlertRecord, AlertSubject, AlertVariant, CommandRecord, JobRecord, JobState, StepResultRecord,
};
use crate::write_set::{WriteOp, WriteSet};
use crate::{IdSpace, Store};

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
    counters: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            counters: Mutex::new(()),
        })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_cbor<T: serde::de::DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    /// Collect the values under `prefix` in a column family.
    fn scan_values<T: serde::de::DeserializeOwned>(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut values = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            // Stop if we're past the prefix
            if !key.starts_with(prefix) {
                break;
            }

            values.push(Self::deserialize(&value)?);
        }

        Ok(values)
    }

    /// Collect the keys of an index column family.
    fn scan_index_keys(&self, cf_name: &str) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf(cf_name)?;
        self.db
            .iterator_cf(&cf, IteratorMode::Start)
            .map(|item| {
                item.map(|(key, _)| key)
                    .map_err(|e| StoreError::Database(e.to_string()))
            })
            .collect()
    }

    fn stage(&self, batch: &mut WriteBatch, op: &WriteOp) -> Result<()> {
        match op {
            WriteOp::Entity(entity) => {
                let cf_entities = self.cf(cf::ENTITIES)?;
                batch.put_cf(
                    &cf_entities,
                    keys::entity_key(entity.entity_ref()),
                    Self::serialize(entity)?,
                );
            }
            WriteOp::Command(command) => {
                let cf_commands = self.cf(cf::COMMANDS)?;
                let cf_incomplete = self.cf(cf::COMMANDS_INCOMPLETE)?;
                let key = keys::command_key(command.id);
                batch.put_cf(&cf_commands, &key, Self::serialize(command)?);
                if command.complete {
                    batch.delete_cf(&cf_incomplete, &key);
                } else {
                    batch.put_cf(&cf_incomplete, &key, []);
                }
            }
            WriteOp::Job(job) => {
                let cf_jobs = self.cf(cf::JOBS)?;
                let cf_incomplete = self.cf(cf::JOBS_INCOMPLETE)?;
                let key = keys::job_key(job.id);
                batch.put_cf(&cf_jobs, &key, Self::serialize(job)?);
                if job.state == JobState::Complete {
                    batch.delete_cf(&cf_incomplete, &key);
                } else {
                    batch.put_cf(&cf_incomplete, &key, []);
                }
            }
            WriteOp::StepResult(step) => {
                let cf_steps = self.cf(cf::STEP_RESULTS)?;
                batch.put_cf(
                    &cf_steps,
                    keys::step_result_key(step.job_id, step.id),
                    Self::serialize(step)?,
                );
            }
            WriteOp::Alert(alert) => {
                let cf_alerts = self.cf(cf::ALERTS)?;
                let cf_active = self.cf(cf::ALERTS_ACTIVE)?;
                let index_key = keys::active_alert_key(alert.variant, alert.subject);
                batch.put_cf(&cf_alerts, alert.id.to_be_bytes(), Self::serialize(alert)?);
                if alert.active {
                    batch.put_cf(&cf_active, &index_key, alert.id.to_be_bytes());
                } else {
                    batch.delete_cf(&cf_active, &index_key);
                }
            }
        }
        Ok(())
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Id Allocation
    // =========================================================================

    fn next_id(&self, space: IdSpace) -> Result<u64> {
        let cf_counters = self.cf(cf::COUNTERS)?;
        let key = keys::counter_key(space.as_str());

        let _guard = self.counters.lock();
        let current = self
            .db
            .get_cf(&cf_counters, &key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| {
                <[u8; 8]>::try_from(data.as_slice())
                    .map(u64::from_be_bytes)
                    .map_err(|_| StoreError::CorruptKey(format!("counter {}", space.as_str())))
            })
            .transpose()?
            .unwrap_or(0);

        let next = current + 1;
        self.db
            .put_cf(&cf_counters, &key, next.to_be_bytes())
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(next)
    }

    // =========================================================================
    // Entity Operations
    // =========================================================================

    fn get_entity(&self, item: EntityRef) -> Result<Option<Entity>> {
        self.get_cbor(cf::ENTITIES, &keys::entity_key(item))
    }

    fn list_entities(&self, class: ClassTag) -> Result<Vec<Entity>> {
        self.scan_values(cf::ENTITIES, &keys::class_prefix(class))
    }

    // =========================================================================
    // Command Operations
    // =========================================================================

    fn get_command(&self, id: CommandId) -> Result<Option<CommandRecord>> {
        self.get_cbor(cf::COMMANDS, &keys::command_key(id))
    }

    fn list_incomplete_commands(&self) -> Result<Vec<CommandRecord>> {
        let mut commands = Vec::new();
        for key in self.scan_index_keys(cf::COMMANDS_INCOMPLETE)? {
            let id = CommandId::from_be_slice(&key)
                .map_err(|e| StoreError::CorruptKey(e.to_string()))?;
            if let Some(command) = self.get_command(id)? {
                commands.push(command);
            }
        }
        Ok(commands)
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.get_cbor(cf::JOBS, &keys::job_key(id))
    }

    fn list_incomplete_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut jobs = Vec::new();
        for key in self.scan_index_keys(cf::JOBS_INCOMPLETE)? {
            let id = JobId::from_be_slice(&key).map_err(|e| StoreError::CorruptKey(e.to_string()))?;
            if let Some(job) = self.get_job(id)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    fn list_step_results(&self, job_id: JobId) -> Result<Vec<StepResultRecord>> {
        self.scan_values(cf::STEP_RESULTS, &keys::job_prefix(job_id))
    }

    // =========================================================================
    // Alert Operations
    // =========================================================================

    fn get_active_alert(
        &self,
        variant: AlertVariant,
        subject: AlertSubject,
    ) -> Result<Option<AlertRecord>> {
        let cf_active = self.cf(cf::ALERTS_ACTIVE)?;
        let alert_key = self
            .db
            .get_cf(&cf_active, keys::active_alert_key(variant, subject))
            .map_err(|e| StoreError::Database(e.to_string()))?;

        match alert_key {
            Some(alert_key) => self.get_cbor(cf::ALERTS, &alert_key),
            None => Ok(None),
        }
    }

    fn list_active_alerts(&self) -> Result<Vec<AlertRecord>> {
        let cf_active = self.cf(cf::ALERTS_ACTIVE)?;
        let mut alerts = Vec::new();
        for item in self.db.iterator_cf(&cf_active, IteratorMode::Start) {
            let (_, alert_key) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if let Some(alert) = self.get_cbor(cf::ALERTS, &alert_key)? {
                alerts.push(alert);
            }
        }
        Ok(alerts)
    }

    fn list_alerts(&self) -> Result<Vec<AlertRecord>> {
        self.scan_values(cf::ALERTS, &[])
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn commit(&self, writes: WriteSet) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let count = writes.len();
        let mut batch = WriteBatch::default();
        for op in &writes.into_ops() {
            self.stage(&mut batch, op)?;
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::trace!(records = count, "Committed write set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Host, ServerProfile, StatefulHeader};
    use crate::types::{AlertSeverity, StateLock, StepState};
    use chrono::Utc;
    use lustre_manager_core::{AlertId, EntityId, StepResultId};
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn create_test_host(id: u64, fqdn: &str) -> Entity {
        Entity::Host(Host {
            header: StatefulHeader::new(EntityId::new(id), "undeployed"),
            fqdn: fqdn.to_string(),
            address: fqdn.to_string(),
            nodename: fqdn.to_string(),
            server_profile: ServerProfile::Managed,
            boot_time: None,
            install_method: "existing_keys".to_string(),
            properties: std::collections::BTreeMap::new(),
            ha_cluster_peers: Vec::new(),
        })
    }

    fn create_test_job(id: u64, state: JobState) -> JobRecord {
        JobRecord {
            id: JobId::new(id),
            class_name: "DeployHost".to_string(),
            args_json: r#"{"host_id":1}"#.to_string(),
            description: "Deploy agent".to_string(),
            state,
            errored: false,
            cancelled: false,
            locks: vec![StateLock::write(
                JobId::new(id),
                EntityRef::new(ClassTag::Host, EntityId::new(1)),
                "undeployed",
                "unconfigured",
            )],
            wait_for: Vec::new(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn ids_are_monotonic_per_space() {
        let (store, _dir) = create_test_store();
        assert_eq!(store.next_id(IdSpace::Job).unwrap(), 1);
        assert_eq!(store.next_id(IdSpace::Job).unwrap(), 2);
        assert_eq!(store.next_id(IdSpace::Command).unwrap(), 1);
        assert_eq!(store.next_id(IdSpace::Job).unwrap(), 3);
    }

    #[test]
    fn ids_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.next_id(IdSpace::Entity).unwrap();
            store.next_id(IdSpace::Entity).unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.next_id(IdSpace::Entity).unwrap(), 3);
    }

    #[test]
    fn entity_crud() {
        let (store, _dir) = create_test_store();
        let host = create_test_host(1, "h1");

        store.put_entity(&host).unwrap();
        let retrieved = store.get_entity(host.entity_ref()).unwrap().unwrap();
        assert_eq!(retrieved, host);

        let missing = EntityRef::new(ClassTag::Host, EntityId::new(2));
        assert!(store.get_entity(missing).unwrap().is_none());
    }

    #[test]
    fn list_entities_by_class() {
        let (store, _dir) = create_test_store();
        store.put_entity(&create_test_host(1, "h1")).unwrap();
        store.put_entity(&create_test_host(2, "h2")).unwrap();

        assert_eq!(store.list_entities(ClassTag::Host).unwrap().len(), 2);
        assert!(store.list_entities(ClassTag::Target).unwrap().is_empty());
    }

    #[test]
    fn incomplete_job_index_follows_state() {
        let (store, _dir) = create_test_store();
        let mut job = create_test_job(1, JobState::Pending);
        store.put_job(&job).unwrap();
        store.put_job(&create_test_job(2, JobState::Tasked)).unwrap();
        assert_eq!(store.list_incomplete_jobs().unwrap().len(), 2);

        job.state = JobState::Complete;
        store.put_job(&job).unwrap();
        let incomplete = store.list_incomplete_jobs().unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, JobId::new(2));

        // Locks survive the round trip for lock cache reconstruction.
        assert_eq!(incomplete[0].locks.len(), 1);
    }

    #[test]
    fn commit_writes_command_and_jobs_together() {
        let (store, _dir) = create_test_store();
        let mut command = CommandRecord::new(CommandId::new(1), "Set up host");
        command.jobs = vec![JobId::new(1), JobId::new(2)];

        let mut writes = WriteSet::new();
        writes
            .put_command(command.clone())
            .put_job(create_test_job(1, JobState::Pending))
            .put_job(create_test_job(2, JobState::Pending));
        store.commit(writes).unwrap();

        assert_eq!(store.get_command(command.id).unwrap().unwrap(), command);
        assert_eq!(store.list_incomplete_commands().unwrap().len(), 1);
        assert_eq!(store.list_incomplete_jobs().unwrap().len(), 2);

        command.complete = true;
        let mut writes = WriteSet::new();
        writes.put_command(command);
        store.commit(writes).unwrap();
        assert!(store.list_incomplete_commands().unwrap().is_empty());
    }

    #[test]
    fn step_results_scan_by_job() {
        let (store, _dir) = create_test_store();
        for (job, step) in [(1, 1), (1, 2), (2, 3)] {
            store
                .put_step_result(&StepResultRecord {
                    id: StepResultId::new(step),
                    job_id: JobId::new(job),
                    step_index: 0,
                    step_count: 1,
                    step_class: "AgentAction".to_string(),
                    args_json: "{}".to_string(),
                    state: StepState::Success,
                    log: String::new(),
                    backtrace: String::new(),
                    console: String::new(),
                    result_json: None,
                    created_at: Utc::now(),
                    modified_at: Utc::now(),
                })
                .unwrap();
        }

        let steps = store.list_step_results(JobId::new(1)).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].id, StepResultId::new(1));
        assert_eq!(store.list_step_results(JobId::new(2)).unwrap().len(), 1);
    }

    #[test]
    fn active_alert_index() {
        let (store, _dir) = create_test_store();
        let subject = AlertSubject::Entity {
            item: EntityRef::new(ClassTag::Target, EntityId::new(4)),
        };
        let mut alert = AlertRecord {
            id: AlertId::new(1),
            variant: AlertVariant::TargetOfflineAlert,
            subject,
            begin: Utc::now(),
            end: None,
            active: true,
            severity: AlertSeverity::Error,
            message: "Target offline".to_string(),
            dismissed: false,
        };
        let mut writes = WriteSet::new();
        writes.put_alert(alert.clone());
        store.commit(writes).unwrap();

        let active = store
            .get_active_alert(AlertVariant::TargetOfflineAlert, subject)
            .unwrap();
        assert_eq!(active.map(|a| a.id), Some(AlertId::new(1)));
        assert_eq!(store.list_active_alerts().unwrap().len(), 1);

        alert.active = false;
        alert.end = Some(Utc::now());
        let mut writes = WriteSet::new();
        writes.put_alert(alert);
        store.commit(writes).unwrap();

        assert!(store
            .get_active_alert(AlertVariant::TargetOfflineAlert, subject)
            .unwrap()
            .is_none());
        assert!(store.list_active_alerts().unwrap().is_empty());
        assert_eq!(store.list_alerts().unwrap().len(), 1);
    }
}
