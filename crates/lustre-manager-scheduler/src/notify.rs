//! Notification intake.
//!
//! Monitoring reports attribute changes it observed on live entities. The
//! intake applies them unless a job owns the entity:
//!
//! - a `from_states` precondition that does not hold refuses the update
//! - a state report on a write-locked entity is refused, the job owns it
//! - other attributes of a write-locked entity are buffered and applied when
//!   its locks are released, keeping the latest report per attribute set
//! - a report older than one already taken for the same attribute is stale
//! - a state report no newer than the entity's last state change is stale

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use lustre_manager_core::EntityRef;
use lustre_manager_store::{Entity, WriteSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::alerts;
use crate::context::SchedulerContext;
use crate::error::{Result, SchedulerError};
use crate::registry;

/// Attributes that identify an entity and cannot be reported.
const PROTECTED: [&str; 4] = ["class_tag", "id", "header", "not_deleted"];

/// One observation of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Observed entity.
    #[serde(flatten)]
    pub item: EntityRef,
    /// When the observation was made.
    pub observed_at: DateTime<Utc>,
    /// Observed attribute values; `state` moves the entity.
    pub attrs: Map<String, Value>,
    /// States the entity must be in for the update to apply.
    #[serde(default)]
    pub from_states: Vec<String>,
}

/// What became of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum NotifyOutcome {
    /// The update was written.
    Applied,
    /// The entity is locked; the update waits for the lock to go.
    Buffered,
    /// The update was rejected.
    Refused(String),
    /// Every attribute had a newer observation already.
    Stale,
}

/// Buffers and ordering state for notifications.
#[derive(Debug, Default)]
pub struct NotifyIntake {
    observed: Mutex<HashMap<(EntityRef, String), DateTime<Utc>>>,
    buffered: Mutex<HashMap<EntityRef, Vec<Notification>>>,
}

impl NotifyIntake {
    /// An empty intake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one notification.
    ///
    /// Rejections are reported through the outcome, never as errors.
    ///
    /// # Errors
    ///
    /// Returns an error only if writing the store fails.
    pub fn notify(&self, ctx: &SchedulerContext, mut notification: Notification) -> Result<NotifyOutcome> {
        let item = notification.item;
        let Some(current) = ctx.cache().get(item) else {
            return Ok(NotifyOutcome::Refused(format!("{item} does not exist")));
        };

        if !notification.from_states.is_empty() {
            let state = current.state().unwrap_or_default();
            if !notification.from_states.iter().any(|s| s == state) {
                tracing::debug!(item = %item, state, "Notification precondition not met");
                return Ok(NotifyOutcome::Refused(format!(
                    "{item} is {state}, not one of {:?}",
                    notification.from_states
                )));
            }
        }

        {
            let observed = self.observed.lock();
            notification.attrs.retain(|attr, _| {
                !matches!(
                    observed.get(&(item, attr.clone())),
                    Some(seen) if *seen > notification.observed_at
                )
            });
        }
        if let Some(header) = current.header() {
            if notification.attrs.contains_key("state")
                && notification.observed_at <= header.state_modified_at
            {
                tracing::debug!(
                    item = %item,
                    observed_at = %notification.observed_at,
                    state_modified_at = %header.state_modified_at,
                    "State report predates the last state change"
                );
                notification.attrs.remove("state");
            }
        }
        if notification.attrs.is_empty() {
            tracing::debug!(item = %item, "Stale notification dropped");
            return Ok(NotifyOutcome::Stale);
        }

        if ctx.locks().is_write_locked(item) {
            if notification.attrs.contains_key("state") {
                tracing::warn!(
                    item = %item,
                    state = %notification.attrs["state"],
                    "State notification refused, a job holds the entity"
                );
                return Ok(NotifyOutcome::Refused(format!(
                    "{item} is being changed by a job"
                )));
            }
            self.mark_observed(&notification);
            self.buffer(notification);
            tracing::debug!(item = %item, "Notification buffered");
            return Ok(NotifyOutcome::Buffered);
        }

        let outcome = apply(ctx, current, &notification)?;
        if outcome == NotifyOutcome::Applied {
            self.mark_observed(&notification);
        }
        Ok(outcome)
    }

    /// Apply the updates buffered for `item` if it is no longer locked.
    ///
    /// Returns how many were applied.
    ///
    /// # Errors
    ///
    /// Returns an error if writing the store fails.
    pub fn release(&self, ctx: &SchedulerContext, item: EntityRef) -> Result<usize> {
        if ctx.locks().is_write_locked(item) {
            return Ok(0);
        }
        let Some(mut pending) = self.buffered.lock().remove(&item) else {
            return Ok(0);
        };
        pending.sort_by_key(|n| n.observed_at);

        let mut applied = 0;
        for notification in pending {
            let Some(current) = ctx.cache().get(item) else {
                break;
            };
            match apply(ctx, current, &notification)? {
                NotifyOutcome::Applied => applied += 1,
                other => {
                    tracing::warn!(item = %item, outcome = ?other, "Buffered notification dropped");
                }
            }
        }
        Ok(applied)
    }

    /// Number of updates waiting on `item`.
    #[must_use]
    pub fn buffered(&self, item: EntityRef) -> usize {
        self.buffered.lock().get(&item).map_or(0, Vec::len)
    }

    fn buffer(&self, notification: Notification) {
        let keys: BTreeSet<String> = notification.attrs.keys().cloned().collect();
        let mut buffered = self.buffered.lock();
        let queue = buffered.entry(notification.item).or_default();
        match queue
            .iter_mut()
            .find(|n| n.attrs.keys().cloned().collect::<BTreeSet<_>>() == keys)
        {
            Some(existing) if existing.observed_at <= notification.observed_at => {
                *existing = notification;
            }
            Some(_) => {}
            None => queue.push(notification),
        }
    }

    fn mark_observed(&self, notification: &Notification) {
        let mut observed = self.observed.lock();
        for attr in notification.attrs.keys() {
            observed.insert((notification.item, attr.clone()), notification.observed_at);
        }
    }
}

fn apply(ctx: &SchedulerContext, current: Entity, notification: &Notification) -> Result<NotifyOutcome> {
    let item = notification.item;
    let mut value = serde_json::to_value(&current)?;
    let fields = value
        .as_object_mut()
        .ok_or_else(|| SchedulerError::Internal(format!("{item} does not encode as an object")))?;

    let mut new_state = None;
    for (attr, observed) in &notification.attrs {
        if attr == "state" {
            let machine = registry::machine(item.class);
            let Some(state) = observed
                .as_str()
                .and_then(|s| machine.and_then(|m| m.canonical(s)))
            else {
                return Ok(NotifyOutcome::Refused(format!(
                    "{observed} is not a state of {item}"
                )));
            };
            new_state = Some(state);
            continue;
        }
        if PROTECTED.contains(&attr.as_str()) || !fields.contains_key(attr) {
            return Ok(NotifyOutcome::Refused(format!("unknown attribute {attr}")));
        }
        fields.insert(attr.clone(), observed.clone());
    }

    let mut updated: Entity = match serde_json::from_value(value) {
        Ok(entity) => entity,
        Err(e) => return Ok(NotifyOutcome::Refused(format!("invalid update: {e}"))),
    };
    if let Some(state) = new_state {
        if updated.state() != Some(state) {
            if let Some(header) = updated.header_mut() {
                header.set_state(state, notification.observed_at);
            }
        }
    }
    if updated == current {
        return Ok(NotifyOutcome::Applied);
    }

    let rebooted = match (current.as_host(), updated.as_host()) {
        (Some(before), Some(after)) => {
            before.boot_time.is_some() && before.boot_time != after.boot_time
        }
        _ => false,
    };

    let mut writes = WriteSet::new();
    writes.put_entity(updated.clone());
    ctx.write(writes)?;
    tracing::debug!(
        item = %item,
        attrs = ?notification.attrs.keys().collect::<Vec<_>>(),
        "Notification applied"
    );

    if rebooted {
        if let Some(host) = updated.as_host() {
            alerts::host_rebooted(ctx, host)?;
        }
    }
    alerts::evaluate(ctx, &updated, false)?;
    Ok(NotifyOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use lustre_manager_core::{ClassTag, JobId};
    use lustre_manager_store::{AlertVariant, RocksStore, StateLock, Store};
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::mock::{fixtures, mock_context};

    struct Setup {
        _dir: TempDir,
        ctx: SchedulerContext,
        server: fixtures::ServerLayout,
        intake: NotifyIntake,
    }

    fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let server = fixtures::managed_server(store.as_ref(), "oss1.example.com", 0).unwrap();
        let (ctx, _, _) = mock_context(store, SchedulerConfig::default()).unwrap();
        Setup {
            _dir: dir,
            ctx,
            server,
            intake: NotifyIntake::new(),
        }
    }

    fn note(item: EntityRef, at: DateTime<Utc>, attrs: Value) -> Notification {
        Notification {
            item,
            observed_at: at,
            attrs: attrs.as_object().cloned().unwrap(),
            from_states: Vec::new(),
        }
    }

    impl Setup {
        fn lnet(&self) -> EntityRef {
            EntityRef::new(ClassTag::LnetConfiguration, self.server.lnet_id)
        }

        fn host(&self) -> EntityRef {
            EntityRef::new(ClassTag::Host, self.server.host_id)
        }
    }

    #[test]
    fn state_report_moves_entity_and_alerts() {
        let s = setup();
        let outcome = s
            .intake
            .notify(&s.ctx, note(s.lnet(), Utc::now(), json!({"state": "lnet_down"})))
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Applied);
        assert_eq!(s.ctx.cache().state(s.lnet()).as_deref(), Some("lnet_down"));
        let stored = s.ctx.store().get_entity(s.lnet()).unwrap().unwrap();
        assert_eq!(stored.state(), Some("lnet_down"));
        let active = s.ctx.store().list_active_alerts().unwrap();
        assert_eq!(active[0].variant, AlertVariant::LnetOfflineAlert);
    }

    #[test]
    fn precondition_must_hold() {
        let s = setup();
        let mut n = note(s.lnet(), Utc::now(), json!({"state": "lnet_down"}));
        n.from_states = vec!["lnet_unloaded".to_string()];
        assert!(matches!(
            s.intake.notify(&s.ctx, n).unwrap(),
            NotifyOutcome::Refused(_)
        ));
        assert_eq!(s.ctx.cache().state(s.lnet()).as_deref(), Some("lnet_up"));
    }

    #[test]
    fn state_report_under_write_lock_is_refused() {
        let s = setup();
        s.ctx
            .locks()
            .add(StateLock::write(JobId::new(1), s.lnet(), "lnet_up", "lnet_down"));
        let outcome = s
            .intake
            .notify(&s.ctx, note(s.lnet(), Utc::now(), json!({"state": "lnet_unloaded"})))
            .unwrap();
        assert!(matches!(outcome, NotifyOutcome::Refused(_)));
        assert_eq!(s.ctx.cache().state(s.lnet()).as_deref(), Some("lnet_up"));
    }

    #[test]
    fn attribute_report_under_write_lock_waits_for_release() {
        let s = setup();
        let now = Utc::now();
        s.ctx
            .locks()
            .add(StateLock::write(JobId::new(1), s.lnet(), "lnet_up", "lnet_down"));

        for (offset, nid) in [(0, "a@tcp0"), (1, "b@tcp0")] {
            let at = now + Duration::seconds(offset);
            let outcome = s
                .intake
                .notify(&s.ctx, note(s.lnet(), at, json!({"nids": [nid]})))
                .unwrap();
            assert_eq!(outcome, NotifyOutcome::Buffered);
        }
        assert_eq!(s.intake.buffered(s.lnet()), 1);
        assert_eq!(s.intake.release(&s.ctx, s.lnet()).unwrap(), 0);

        s.ctx.locks().remove_job(JobId::new(1));
        assert_eq!(s.intake.release(&s.ctx, s.lnet()).unwrap(), 1);
        let lnet = s.ctx.cache().get(s.lnet()).unwrap();
        assert_eq!(lnet.as_lnet().unwrap().nids, ["b@tcp0"]);
        assert_eq!(s.intake.buffered(s.lnet()), 0);
    }

    #[test]
    fn older_reports_are_stale_per_attribute() {
        let s = setup();
        let now = Utc::now();
        s.intake
            .notify(&s.ctx, note(s.host(), now, json!({"nodename": "new"})))
            .unwrap();
        let outcome = s
            .intake
            .notify(
                &s.ctx,
                note(s.host(), now - Duration::seconds(5), json!({"nodename": "old"})),
            )
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Stale);

        let outcome = s
            .intake
            .notify(
                &s.ctx,
                note(
                    s.host(),
                    now - Duration::seconds(5),
                    json!({"nodename": "old", "install_method": "root_password"}),
                ),
            )
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Applied);
        let host = s.ctx.cache().host(s.server.host_id).unwrap();
        assert_eq!(host.nodename, "new");
        assert_eq!(host.install_method, "root_password");
    }

    #[test]
    fn state_report_older_than_last_change_is_stale() {
        let s = setup();
        let changed_at = s.ctx.cache().get(s.lnet()).unwrap().header().unwrap().state_modified_at;
        let before = changed_at - Duration::seconds(5);

        let outcome = s
            .intake
            .notify(&s.ctx, note(s.lnet(), before, json!({"state": "lnet_down"})))
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Stale);
        assert_eq!(s.ctx.cache().state(s.lnet()).as_deref(), Some("lnet_up"));

        let outcome = s
            .intake
            .notify(
                &s.ctx,
                note(s.lnet(), before, json!({"state": "lnet_down", "nids": ["c@tcp0"]})),
            )
            .unwrap();
        assert_eq!(outcome, NotifyOutcome::Applied);
        let lnet = s.ctx.cache().get(s.lnet()).unwrap();
        assert_eq!(lnet.state(), Some("lnet_up"));
        assert_eq!(lnet.as_lnet().unwrap().nids, ["c@tcp0"]);
    }

    #[test]
    fn unknown_attributes_are_refused() {
        let s = setup();
        for attrs in [
            json!({"colour": "blue"}),
            json!({"header": {}}),
            json!({"state": "sideways"}),
            json!({"nids": "not-a-list"}),
        ] {
            let outcome = s
                .intake
                .notify(&s.ctx, note(s.lnet(), Utc::now(), attrs.clone()))
                .unwrap();
            assert!(matches!(outcome, NotifyOutcome::Refused(_)), "{attrs}");
        }
    }

    #[test]
    fn boot_time_change_records_reboot() {
        let s = setup();
        let first = Utc::now() - Duration::hours(2);
        s.intake
            .notify(&s.ctx, note(s.host(), Utc::now(), json!({"boot_time": first})))
            .unwrap();
        assert!(s.ctx.store().list_alerts().unwrap().is_empty());

        let second = Utc::now();
        s.intake
            .notify(
                &s.ctx,
                note(s.host(), Utc::now() + Duration::seconds(1), json!({"boot_time": second})),
            )
            .unwrap();
        let alerts = s.ctx.store().list_alerts().unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].variant, AlertVariant::HostRebootEvent);
    }
}
