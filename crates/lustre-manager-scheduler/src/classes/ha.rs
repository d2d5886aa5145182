//! Per-host configuration classes: NTP, Corosync, Pacemaker and LNet.

use lustre_manager_core::{ClassTag, EntityRef};
use lustre_manager_store::{CorosyncConfiguration, LnetConfiguration, PacemakerConfiguration};

use crate::deps::{DependOn, Dependency};
use crate::jobs::JobClass;
use crate::object_cache::ObjectCache;
use crate::registry::{transition, StateMachine};

pub static NTP_MACHINE: StateMachine = StateMachine {
    class: ClassTag::NtpConfiguration,
    states: &["unconfigured", "configured"],
    initial_state: "unconfigured",
    transitions: &[
        transition("unconfigured", "configured", JobClass::ConfigureNtp, None),
        transition("configured", "unconfigured", JobClass::UnconfigureNtp, None),
    ],
};

pub static COROSYNC_MACHINE: StateMachine = StateMachine {
    class: ClassTag::CorosyncConfiguration,
    states: &["unconfigured", "stopped", "started"],
    initial_state: "unconfigured",
    transitions: &[
        transition("unconfigured", "stopped", JobClass::ConfigureCorosync, None),
        transition("stopped", "started", JobClass::StartCorosync, Some("Start Corosync")),
        transition("started", "stopped", JobClass::StopCorosync, Some("Stop Corosync")),
        transition("stopped", "unconfigured", JobClass::UnconfigureCorosync, None),
    ],
};

pub static PACEMAKER_MACHINE: StateMachine = StateMachine {
    class: ClassTag::PacemakerConfiguration,
    states: &["unconfigured", "stopped", "started"],
    initial_state: "unconfigured",
    transitions: &[
        transition("unconfigured", "stopped", JobClass::ConfigurePacemaker, None),
        transition("stopped", "started", JobClass::StartPacemaker, Some("Start Pacemaker")),
        transition("started", "stopped", JobClass::StopPacemaker, Some("Stop Pacemaker")),
        transition("stopped", "unconfigured", JobClass::UnconfigurePacemaker, None),
    ],
};

pub static LNET_MACHINE: StateMachine = StateMachine {
    class: ClassTag::LnetConfiguration,
    states: &["unconfigured", "lnet_unloaded", "lnet_down", "lnet_up"],
    initial_state: "unconfigured",
    transitions: &[
        transition("unconfigured", "lnet_unloaded", JobClass::ConfigureLnet, None),
        transition("lnet_unloaded", "lnet_down", JobClass::LoadLnet, Some("Load LNet")),
        transition("lnet_down", "lnet_up", JobClass::StartLnet, Some("Start LNet")),
        transition("lnet_up", "lnet_down", JobClass::StopLnet, Some("Stop LNet")),
        transition("lnet_down", "lnet_unloaded", JobClass::UnloadLnet, Some("Unload LNet")),
        transition("lnet_unloaded", "unconfigured", JobClass::UnconfigureLnet, None),
    ],
};

pub fn pacemaker_state_deps(
    cache: &ObjectCache,
    pacemaker: &PacemakerConfiguration,
    state: &str,
) -> Dependency {
    let Some(corosync) = cache.host_config(pacemaker.host_id, ClassTag::CorosyncConfiguration)
    else {
        return Dependency::none();
    };
    match state {
        "started" => DependOn::new(corosync, "started").fix("stopped").into(),
        "stopped" => DependOn::except(corosync, "stopped", &["unconfigured"])
            .fix("unconfigured")
            .into(),
        _ => Dependency::none(),
    }
}

pub fn corosync_dependents(cache: &ObjectCache, corosync: &CorosyncConfiguration) -> Vec<EntityRef> {
    cache
        .host_config(corosync.host_id, ClassTag::PacemakerConfiguration)
        .into_iter()
        .collect()
}

pub fn lnet_dependents(cache: &ObjectCache, lnet: &LnetConfiguration) -> Vec<EntityRef> {
    let targets = cache
        .host_targets(lnet.host_id)
        .into_iter()
        .map(|t| EntityRef::new(ClassTag::Target, t.header.id));
    let clients = cache
        .host_client_mounts(lnet.host_id)
        .into_iter()
        .map(|c| EntityRef::new(ClassTag::ClientMount, c.header.id));
    targets.chain(clients).collect()
}
