//! Alert engine.
//!
//! Entity alerts are predicates over an entity's current state: when one
//! becomes true an active record is opened, when it becomes false the record
//! is closed by stamping `end`. Command alerts and host reboot events are
//! historical records written inactive.

use chrono::Utc;
use lustre_manager_core::{AlertId, ClassTag, EntityRef};
use lustre_manager_store::{
    AlertRecord, AlertSeverity, AlertSubject, AlertVariant, CommandRecord, Entity, Host, IdSpace,
    WriteSet,
};

use crate::context::SchedulerContext;
use crate::error::Result;
use crate::object_cache::ObjectCache;

/// Entity alert variants, evaluated on every state change.
const ENTITY_VARIANTS: [AlertVariant; 5] = [
    AlertVariant::LnetOfflineAlert,
    AlertVariant::CorosyncStoppedAlert,
    AlertVariant::PacemakerStoppedAlert,
    AlertVariant::TargetOfflineAlert,
    AlertVariant::TargetFailoverAlert,
];

/// What a predicate says about one entity.
struct Verdict {
    variant: AlertVariant,
    severity: AlertSeverity,
    /// `Some(message)` when the alert condition holds.
    raised: Option<String>,
    /// Whether the condition is only an alert when nobody asked for it.
    suppressed_when_intentional: bool,
}

fn verdicts(cache: &ObjectCache, entity: &Entity) -> Vec<Verdict> {
    let Some(state) = entity.state() else {
        return Vec::new();
    };
    let label = entity.label();
    match entity {
        Entity::LnetConfiguration(_) => vec![Verdict {
            variant: AlertVariant::LnetOfflineAlert,
            severity: AlertSeverity::Warning,
            raised: matches!(state, "lnet_down" | "lnet_unloaded")
                .then(|| format!("LNet offline on {}", owner_label(cache, entity))),
            suppressed_when_intentional: false,
        }],
        Entity::CorosyncConfiguration(_) => vec![Verdict {
            variant: AlertVariant::CorosyncStoppedAlert,
            severity: AlertSeverity::Warning,
            raised: (state == "stopped")
                .then(|| format!("Corosync stopped on {}", owner_label(cache, entity))),
            suppressed_when_intentional: true,
        }],
        Entity::PacemakerConfiguration(_) => vec![Verdict {
            variant: AlertVariant::PacemakerStoppedAlert,
            severity: AlertSeverity::Warning,
            raised: (state == "stopped")
                .then(|| format!("Pacemaker stopped on {}", owner_label(cache, entity))),
            suppressed_when_intentional: true,
        }],
        Entity::Target(target) => {
            let failed_over = state == "mounted"
                && target
                    .active_mount_id
                    .and_then(|id| cache.target_mount(id))
                    .is_some_and(|m| !m.primary);
            let failover_host = cache
                .target_active_host(target.header.id)
                .map(|h| h.fqdn)
                .unwrap_or_default();
            vec![
                Verdict {
                    variant: AlertVariant::TargetOfflineAlert,
                    severity: AlertSeverity::Error,
                    raised: (state == "unmounted").then(|| format!("Target {label} offline")),
                    suppressed_when_intentional: true,
                },
                Verdict {
                    variant: AlertVariant::TargetFailoverAlert,
                    severity: AlertSeverity::Warning,
                    raised: failed_over
                        .then(|| format!("Target {label} running on secondary server {failover_host}")),
                    suppressed_when_intentional: false,
                },
            ]
        }
        _ => Vec::new(),
    }
}

fn owner_label(cache: &ObjectCache, entity: &Entity) -> String {
    let host_id = match entity {
        Entity::LnetConfiguration(c) => c.host_id,
        Entity::CorosyncConfiguration(c) => c.host_id,
        Entity::PacemakerConfiguration(c) => c.host_id,
        _ => return entity.label(),
    };
    cache
        .host(host_id)
        .map_or_else(|| entity.label(), |h| h.fqdn)
}

// =============================================================================
// Record primitives
// =============================================================================

/// Open an alert unless one is already active for `(variant, subject)`.
///
/// Returns the newly opened record.
///
/// # Errors
///
/// Returns an error if reading or writing the store fails.
pub fn raise(
    ctx: &SchedulerContext,
    variant: AlertVariant,
    subject: AlertSubject,
    severity: AlertSeverity,
    message: &str,
) -> Result<Option<AlertRecord>> {
    let _guard = ctx.alert_guard();
    if ctx.store().get_active_alert(variant, subject)?.is_some() {
        return Ok(None);
    }
    let alert = AlertRecord {
        id: AlertId::new(ctx.next_id(IdSpace::Alert)?),
        variant,
        subject,
        begin: Utc::now(),
        end: None,
        active: true,
        severity,
        message: message.to_string(),
        dismissed: false,
    };
    let mut writes = WriteSet::new();
    writes.put_alert(alert.clone());
    ctx.write(writes)?;
    tracing::warn!(alert_id = %alert.id, variant = ?variant, message, "Alert raised");
    Ok(Some(alert))
}

/// Close the active alert for `(variant, subject)`, if any.
///
/// # Errors
///
/// Returns an error if reading or writing the store fails.
pub fn clear(
    ctx: &SchedulerContext,
    variant: AlertVariant,
    subject: AlertSubject,
) -> Result<Option<AlertRecord>> {
    let _guard = ctx.alert_guard();
    let Some(mut alert) = ctx.store().get_active_alert(variant, subject)? else {
        return Ok(None);
    };
    alert.active = false;
    alert.end = Some(Utc::now());
    let mut writes = WriteSet::new();
    writes.put_alert(alert.clone());
    ctx.write(writes)?;
    tracing::info!(alert_id = %alert.id, variant = ?variant, "Alert cleared");
    Ok(Some(alert))
}

fn record_event(
    ctx: &SchedulerContext,
    variant: AlertVariant,
    subject: AlertSubject,
    severity: AlertSeverity,
    message: String,
) -> Result<AlertRecord> {
    let now = Utc::now();
    let alert = AlertRecord {
        id: AlertId::new(ctx.next_id(IdSpace::Alert)?),
        variant,
        subject,
        begin: now,
        end: Some(now),
        active: false,
        severity,
        message,
        dismissed: false,
    };
    let mut writes = WriteSet::new();
    writes.put_alert(alert.clone());
    ctx.write(writes)?;
    Ok(alert)
}

// =============================================================================
// Triggers
// =============================================================================

/// Re-evaluate the alert predicates of `entity`.
///
/// `intentional` is set when the change was made by a job; conditions a
/// user asked for (a stopped target, a stopped cluster service) then clear
/// existing alerts but never raise new ones. Deleted entities have all their
/// alerts closed.
///
/// # Errors
///
/// Returns an error if reading or writing the store fails.
pub fn evaluate(ctx: &SchedulerContext, entity: &Entity, intentional: bool) -> Result<()> {
    let subject = AlertSubject::Entity {
        item: entity.entity_ref(),
    };
    if !entity.not_deleted() {
        for variant in ENTITY_VARIANTS.into_iter().chain([AlertVariant::HostContactAlert]) {
            clear(ctx, variant, subject)?;
        }
        return Ok(());
    }

    for verdict in verdicts(ctx.cache(), entity) {
        match verdict.raised {
            Some(message) if !(intentional && verdict.suppressed_when_intentional) => {
                raise(ctx, verdict.variant, subject, verdict.severity, &message)?;
            }
            Some(_) => {}
            None => {
                clear(ctx, verdict.variant, subject)?;
            }
        }
    }
    Ok(())
}

/// Record the outcome of a completed command.
///
/// # Errors
///
/// Returns an error if writing the store fails.
pub fn command_finished(ctx: &SchedulerContext, command: &CommandRecord) -> Result<AlertRecord> {
    let (variant, severity, outcome) = if command.errored {
        (AlertVariant::CommandErroredAlert, AlertSeverity::Error, "failed")
    } else if command.cancelled {
        (AlertVariant::CommandCancelledAlert, AlertSeverity::Warning, "cancelled")
    } else {
        (AlertVariant::CommandSuccessfulAlert, AlertSeverity::Info, "succeeded")
    };
    let alert = record_event(
        ctx,
        variant,
        AlertSubject::Command {
            command_id: command.id,
        },
        severity,
        format!("Command \"{}\" {outcome}", command.message),
    )?;
    tracing::info!(command_id = %command.id, outcome, "Command finished");
    Ok(alert)
}

/// Open or close the contact alert of the host named `fqdn`.
///
/// Unknown hosts are ignored.
///
/// # Errors
///
/// Returns an error if reading or writing the store fails.
pub fn host_contact(ctx: &SchedulerContext, fqdn: &str, lost: bool) -> Result<()> {
    let Some(host) = ctx.cache().host_by_fqdn(fqdn) else {
        return Ok(());
    };
    let subject = AlertSubject::Entity {
        item: EntityRef::new(ClassTag::Host, host.header.id),
    };
    if lost {
        raise(
            ctx,
            AlertVariant::HostContactAlert,
            subject,
            AlertSeverity::Warning,
            &format!("Lost contact with host {fqdn}"),
        )?;
    } else {
        clear(ctx, AlertVariant::HostContactAlert, subject)?;
    }
    Ok(())
}

/// Record that `host` rebooted.
///
/// # Errors
///
/// Returns an error if writing the store fails.
pub fn host_rebooted(ctx: &SchedulerContext, host: &Host) -> Result<AlertRecord> {
    record_event(
        ctx,
        AlertVariant::HostRebootEvent,
        AlertSubject::Entity {
            item: EntityRef::new(ClassTag::Host, host.header.id),
        },
        AlertSeverity::Info,
        format!("{} restarted", host.fqdn),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lustre_manager_core::CommandId;
    use lustre_manager_store::{RocksStore, Store};
    use tempfile::TempDir;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::mock::{fixtures, mock_context};

    fn setup() -> (TempDir, SchedulerContext, fixtures::ServerLayout) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let server = fixtures::managed_server(store.as_ref(), "oss1.example.com", 0).unwrap();
        let (ctx, _, _) = mock_context(store, SchedulerConfig::default()).unwrap();
        (dir, ctx, server)
    }

    fn with_state(ctx: &SchedulerContext, item: EntityRef, state: &str) -> Entity {
        let mut entity = ctx.cache().get(item).unwrap();
        entity.header_mut().unwrap().set_state(state, Utc::now());
        let mut writes = WriteSet::new();
        writes.put_entity(entity.clone());
        ctx.write(writes).unwrap();
        entity
    }

    #[test]
    fn lnet_offline_raises_once_and_clears() {
        let (_dir, ctx, server) = setup();
        let item = EntityRef::new(ClassTag::LnetConfiguration, server.lnet_id);
        let subject = AlertSubject::Entity { item };

        let down = with_state(&ctx, item, "lnet_down");
        evaluate(&ctx, &down, false).unwrap();
        evaluate(&ctx, &down, false).unwrap();
        let active = ctx.store().list_active_alerts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].variant, AlertVariant::LnetOfflineAlert);
        assert!(active[0].message.contains("oss1.example.com"));

        let up = with_state(&ctx, item, "lnet_up");
        evaluate(&ctx, &up, false).unwrap();
        assert!(ctx
            .store()
            .get_active_alert(AlertVariant::LnetOfflineAlert, subject)
            .unwrap()
            .is_none());
        let history = ctx.store().list_alerts().unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].end.is_some());
    }

    #[test]
    fn intentional_stop_does_not_alert() {
        let (_dir, ctx, server) = setup();
        let item = EntityRef::new(ClassTag::PacemakerConfiguration, server.pacemaker_id);

        let stopped = with_state(&ctx, item, "stopped");
        evaluate(&ctx, &stopped, true).unwrap();
        assert!(ctx.store().list_active_alerts().unwrap().is_empty());

        evaluate(&ctx, &stopped, false).unwrap();
        assert_eq!(ctx.store().list_active_alerts().unwrap().len(), 1);
    }

    #[test]
    fn deleted_entities_lose_their_alerts() {
        let (_dir, ctx, server) = setup();
        let item = EntityRef::new(ClassTag::CorosyncConfiguration, server.corosync_id);
        let stopped = with_state(&ctx, item, "stopped");
        evaluate(&ctx, &stopped, false).unwrap();
        assert_eq!(ctx.store().list_active_alerts().unwrap().len(), 1);

        let mut gone = stopped;
        gone.mark_deleted();
        evaluate(&ctx, &gone, true).unwrap();
        assert!(ctx.store().list_active_alerts().unwrap().is_empty());
    }

    #[test]
    fn contact_alerts_follow_sessions() {
        let (_dir, ctx, server) = setup();
        host_contact(&ctx, "oss1.example.com", true).unwrap();
        host_contact(&ctx, "oss1.example.com", true).unwrap();
        host_contact(&ctx, "unknown.example.com", true).unwrap();
        let active = ctx.store().list_active_alerts().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(
            active[0].subject,
            AlertSubject::Entity {
                item: EntityRef::new(ClassTag::Host, server.host_id)
            }
        );

        host_contact(&ctx, "oss1.example.com", false).unwrap();
        assert!(ctx.store().list_active_alerts().unwrap().is_empty());
    }

    #[test]
    fn command_alerts_are_historical() {
        let (_dir, ctx, _) = setup();
        let mut command = CommandRecord::new(CommandId::new(9), "Stop LNet");
        command.complete = true;
        command.errored = true;
        command.cancelled = true;

        let alert = command_finished(&ctx, &command).unwrap();
        assert_eq!(alert.variant, AlertVariant::CommandErroredAlert);
        assert_eq!(alert.severity, AlertSeverity::Error);
        assert!(!alert.active);
        assert_eq!(alert.end, Some(alert.begin));
        assert!(ctx.store().list_active_alerts().unwrap().is_empty());
    }

    #[test]
    fn reboot_events_are_recorded() {
        let (_dir, ctx, server) = setup();
        let host = ctx.cache().host(server.host_id).unwrap();
        let event = host_rebooted(&ctx, &host).unwrap();
        assert_eq!(event.variant, AlertVariant::HostRebootEvent);
        assert!(!event.active);
        assert!(event.message.contains("oss1.example.com"));
    }
}
