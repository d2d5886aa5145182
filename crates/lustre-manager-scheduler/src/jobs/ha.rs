use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use lustre_manager_store::Entity;
use serde_json::{json, Value};

use super::{owning_host, Job, JobClass};
use crate::classes::CONFIGURED_STATES;
use crate::deps::{DependOn, Dependency};
use crate::error::StepError;
use crate::object_cache::ObjectCache;
use crate::steps::Step;

pub(super) fn description(job: Job, cache: &ObjectCache, subject: &Entity) -> String {
    let host = owning_host(cache, subject).map_or_else(|| subject.label(), |h| h.fqdn);
    let what = match job.class {
        JobClass::ConfigureNtp => "Configure NTP",
        JobClass::UnconfigureNtp => "Unconfigure NTP",
        JobClass::ConfigureCorosync => "Configure Corosync",
        JobClass::StartCorosync => "Start Corosync",
        JobClass::StopCorosync => "Stop Corosync",
        JobClass::UnconfigureCorosync => "Unconfigure Corosync",
        JobClass::ConfigurePacemaker => "Configure Pacemaker",
        JobClass::StartPacemaker => "Start Pacemaker",
        JobClass::StopPacemaker => "Stop Pacemaker",
        JobClass::UnconfigurePacemaker => "Unconfigure Pacemaker",
        JobClass::ConfigureLnet => "Configure LNet",
        JobClass::LoadLnet => "Load the LNet kernel modules",
        JobClass::StartLnet => "Start LNet",
        JobClass::StopLnet => "Stop LNet",
        JobClass::UnloadLnet => "Unload the LNet kernel modules",
        JobClass::UnconfigureLnet => "Unconfigure LNet",
        other => other.name(),
    };
    format!("{what} on {host}")
}

fn config_host(subject: &Entity) -> Option<EntityId> {
    match subject {
        Entity::LnetConfiguration(c) => Some(c.host_id),
        Entity::CorosyncConfiguration(c) => Some(c.host_id),
        Entity::PacemakerConfiguration(c) => Some(c.host_id),
        Entity::NtpConfiguration(c) => Some(c.host_id),
        _ => None,
    }
}

pub(super) fn deps(job: Job, cache: &ObjectCache, subject: &Entity) -> Dependency {
    let Some(host_id) = config_host(subject) else {
        return Dependency::none();
    };
    let host = EntityRef::new(ClassTag::Host, host_id);
    let installed = || DependOn::any_of(host, CONFIGURED_STATES[0], &CONFIGURED_STATES);
    let corosync = cache.host_config(host_id, ClassTag::CorosyncConfiguration);

    match job.class {
        JobClass::ConfigureNtp | JobClass::ConfigureCorosync | JobClass::ConfigureLnet => {
            installed().into()
        }
        JobClass::ConfigurePacemaker => {
            let mut leaves = vec![installed()];
            leaves.extend(corosync.map(|c| DependOn::any_of(c, "stopped", &["started"])));
            Dependency::all(leaves)
        }
        JobClass::StartPacemaker => {
            Dependency::all(corosync.map(|c| DependOn::new(c, "started")))
        }
        _ => Dependency::none(),
    }
}

pub(super) fn steps(job: Job, subject: &Entity) -> Result<Vec<Step>, StepError> {
    let host_id = config_host(subject).ok_or_else(|| {
        StepError::PreconditionFailure(format!("{} is not a host configuration", job.subject()))
    })?;
    let agent = |action: &str, args: Value| Step::AgentAction {
        host_id,
        action: action.to_string(),
        args,
    };
    let none = || json!({});

    let steps = match job.class {
        JobClass::ConfigureNtp => {
            let server = subject.as_ntp().and_then(|n| n.server.clone());
            vec![agent("configure_ntp", json!({ "ntp_server": server }))]
        }
        JobClass::UnconfigureNtp => vec![agent("unconfigure_ntp", none())],
        JobClass::ConfigureCorosync => {
            let port = subject.as_corosync().and_then(|c| c.mcast_port);
            vec![agent("configure_corosync", json!({ "mcast_port": port }))]
        }
        JobClass::StartCorosync => vec![agent("start_corosync", none())],
        JobClass::StopCorosync => vec![agent("stop_corosync", none())],
        JobClass::UnconfigureCorosync => vec![agent("unconfigure_corosync", none())],
        JobClass::ConfigurePacemaker => vec![agent("configure_pacemaker", none())],
        JobClass::StartPacemaker => vec![agent("start_pacemaker", none())],
        JobClass::StopPacemaker => vec![agent("stop_pacemaker", none())],
        JobClass::UnconfigurePacemaker => vec![agent("unconfigure_pacemaker", none())],
        JobClass::ConfigureLnet => vec![agent("configure_lnet", none())],
        JobClass::LoadLnet => vec![agent("load_lnet", none())],
        JobClass::StartLnet => vec![
            agent("start_lnet", none()),
            Step::LearnNids {
                lnet_id: subject.id(),
            },
        ],
        JobClass::StopLnet => vec![agent("stop_lnet", none())],
        JobClass::UnloadLnet => vec![agent("unload_lnet", none())],
        JobClass::UnconfigureLnet => vec![agent("unconfigure_lnet", none())],
        other => {
            return Err(StepError::PreconditionFailure(format!(
                "{other} does not run on host configurations"
            )))
        }
    };
    Ok(steps)
}
