//! Key encoding utilities for `RocksDB`.
//!
//! Ids are encoded big-endian so that iteration order equals id order.

use lustre_manager_core::{CommandId, EntityRef, JobId, StepResultId};

use crate::types::{AlertSubject, AlertVariant};

/// Encode an entity key: `class_tag || entity_id`.
#[must_use]
pub fn entity_key(item: EntityRef) -> Vec<u8> {
    item.to_key().to_vec()
}

/// Encode a class prefix for scanning all entities of a class.
#[must_use]
pub fn class_prefix(class: lustre_manager_core::ClassTag) -> Vec<u8> {
    vec![class.as_u8()]
}

/// Encode a command key.
#[must_use]
pub fn command_key(id: CommandId) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// Encode a job key.
#[must_use]
pub fn job_key(id: JobId) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

/// Encode a step result key: `job_id || step_result_id`.
///
/// This allows efficient prefix scans for all steps of a job.
#[must_use]
pub fn step_result_key(job_id: JobId, id: StepResultId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&job_id.to_be_bytes());
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Encode a job prefix for scanning the step results of one job.
#[must_use]
pub fn job_prefix(job_id: JobId) -> Vec<u8> {
    job_id.to_be_bytes().to_vec()
}

/// Encode an active-alert index key: `variant || subject`.
#[must_use]
pub fn active_alert_key(variant: AlertVariant, subject: AlertSubject) -> Vec<u8> {
    let mut key = vec![variant.as_u8()];
    key.extend_from_slice(&subject.to_key());
    key
}

/// Encode a counter key.
#[must_use]
pub fn counter_key(space: &str) -> Vec<u8> {
    space.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lustre_manager_core::{ClassTag, EntityId};

    #[test]
    fn entity_keys_group_by_class() {
        let host = entity_key(EntityRef::new(ClassTag::Host, EntityId::new(99)));
        let target = entity_key(EntityRef::new(ClassTag::Target, EntityId::new(1)));
        assert!(host.starts_with(&class_prefix(ClassTag::Host)));
        assert!(!target.starts_with(&class_prefix(ClassTag::Host)));
        assert!(host < target);
    }

    #[test]
    fn step_result_keys_share_job_prefix() {
        let key = step_result_key(JobId::new(7), StepResultId::new(3));
        assert_eq!(key.len(), 16);
        assert!(key.starts_with(&job_prefix(JobId::new(7))));
        assert!(!key.starts_with(&job_prefix(JobId::new(8))));
    }

    #[test]
    fn active_alert_key_leads_with_variant() {
        let subject = AlertSubject::Command {
            command_id: CommandId::new(1),
        };
        let key = active_alert_key(AlertVariant::CommandErroredAlert, subject);
        assert_eq!(key[0], AlertVariant::CommandErroredAlert.as_u8());
    }
}
