//! Job classes.
//!
//! Every job acts on exactly one subject entity, so a job is a class plus
//! the subject's id. The class decides the argument name (`host_id`,
//! `target_id`, ...), the dependencies, the locks, the steps and the
//! bookkeeping done on success.
//!
//! Behaviour lives in one module per domain; this module only dispatches.

mod client;
mod conf_param;
mod filesystem;
mod ha;
mod host;
mod target;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use lustre_manager_store::{Entity, JobRecord};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::config::SchedulerConfig;
use crate::deps::Dependency;
use crate::error::{Result, SchedulerError, StepError};
use crate::object_cache::ObjectCache;
use crate::steps::Step;

pub(crate) use client::mgs_nid_spec;
pub(crate) use host::removal_cascade;
pub(crate) use target::expected_label;

macro_rules! job_classes {
    ($($variant:ident => $name:literal, $class:ident, $arg:literal;)*) => {
        /// Every job class the scheduler can run.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[allow(missing_docs)]
        pub enum JobClass {
            $($variant,)*
        }

        impl JobClass {
            /// All classes, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];

            /// Class name used on the wire and in job records.
            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            /// Class of the entity the job acts on.
            #[must_use]
            pub const fn subject_class(self) -> ClassTag {
                match self {
                    $(Self::$variant => ClassTag::$class,)*
                }
            }

            /// Name of the job's single argument.
            #[must_use]
            pub const fn arg_name(self) -> &'static str {
                match self {
                    $(Self::$variant => $arg,)*
                }
            }
        }

        impl FromStr for JobClass {
            type Err = SchedulerError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(Self::$variant),)*
                    other => Err(SchedulerError::UnknownJobClass(other.to_string())),
                }
            }
        }
    };
}

job_classes! {
    DeployHost => "DeployHost", Host, "host_id";
    InstallHostPackages => "InstallHostPackages", Host, "host_id";
    SetupHost => "SetupHost", Host, "host_id";
    SetupMonitoredHost => "SetupMonitoredHost", Host, "host_id";
    SetupWorker => "SetupWorker", Host, "host_id";
    RemoveHost => "RemoveHost", Host, "host_id";
    RemoveUnconfiguredHost => "RemoveUnconfiguredHost", Host, "host_id";
    ForceRemoveHost => "ForceRemoveHost", Host, "host_id";
    RebootHost => "RebootHost", Host, "host_id";
    ShutdownHost => "ShutdownHost", Host, "host_id";
    MountClient => "MountClient", Host, "host_id";
    UnmountClient => "UnmountClient", Host, "host_id";

    ConfigureNtp => "ConfigureNTP", NtpConfiguration, "ntp_configuration_id";
    UnconfigureNtp => "UnconfigureNTP", NtpConfiguration, "ntp_configuration_id";

    ConfigureCorosync => "ConfigureCorosync", CorosyncConfiguration, "corosync_configuration_id";
    StartCorosync => "StartCorosync", CorosyncConfiguration, "corosync_configuration_id";
    StopCorosync => "StopCorosync", CorosyncConfiguration, "corosync_configuration_id";
    UnconfigureCorosync => "UnconfigureCorosync", CorosyncConfiguration, "corosync_configuration_id";

    ConfigurePacemaker => "ConfigurePacemaker", PacemakerConfiguration, "pacemaker_configuration_id";
    StartPacemaker => "StartPacemaker", PacemakerConfiguration, "pacemaker_configuration_id";
    StopPacemaker => "StopPacemaker", PacemakerConfiguration, "pacemaker_configuration_id";
    UnconfigurePacemaker => "UnconfigurePacemaker", PacemakerConfiguration, "pacemaker_configuration_id";

    ConfigureLnet => "ConfigureLNet", LnetConfiguration, "lnet_configuration_id";
    LoadLnet => "LoadLNet", LnetConfiguration, "lnet_configuration_id";
    StartLnet => "StartLNet", LnetConfiguration, "lnet_configuration_id";
    StopLnet => "StopLNet", LnetConfiguration, "lnet_configuration_id";
    UnloadLnet => "UnloadLNet", LnetConfiguration, "lnet_configuration_id";
    UnconfigureLnet => "UnconfigureLNet", LnetConfiguration, "lnet_configuration_id";

    FormatTarget => "FormatTarget", Target, "target_id";
    RegisterTarget => "RegisterTarget", Target, "target_id";
    ConfigureTarget => "ConfigureTarget", Target, "target_id";
    StartTarget => "StartTarget", Target, "target_id";
    StopTarget => "StopTarget", Target, "target_id";
    RemoveConfiguredTarget => "RemoveConfiguredTarget", Target, "target_id";
    RemoveTarget => "RemoveTarget", Target, "target_id";
    ForgetTarget => "ForgetTarget", Target, "target_id";
    FailoverTarget => "FailoverTarget", Target, "target_id";
    FailbackTarget => "FailbackTarget", Target, "target_id";
    ApplyConfParams => "ApplyConfParams", Target, "mgs_id";

    StartFilesystem => "StartFilesystem", Filesystem, "filesystem_id";
    StartUnavailableFilesystem => "StartUnavailableFilesystem", Filesystem, "filesystem_id";
    StopFilesystem => "StopFilesystem", Filesystem, "filesystem_id";
    StopUnavailableFilesystem => "StopUnavailableFilesystem", Filesystem, "filesystem_id";
    MakeAvailableFilesystemUnavailable => "MakeAvailableFilesystemUnavailable", Filesystem, "filesystem_id";
    MakeStoppedFilesystemUnavailable => "MakeStoppedFilesystemUnavailable", Filesystem, "filesystem_id";
    RemoveFilesystem => "RemoveFilesystem", Filesystem, "filesystem_id";
    ForgetFilesystem => "ForgetFilesystem", Filesystem, "filesystem_id";

    MountLustreClient => "MountLustreClient", ClientMount, "client_mount_id";
    UnmountLustreClient => "UnmountLustreClient", ClientMount, "client_mount_id";
    RemoveLustreClient => "RemoveLustreClient", ClientMount, "client_mount_id";

    StartCopytool => "StartCopytool", Copytool, "copytool_id";
    StopCopytool => "StopCopytool", Copytool, "copytool_id";
    RemoveCopytool => "RemoveCopytool", Copytool, "copytool_id";
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for JobClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for JobClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A lock a job takes beyond its transition's own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSpec {
    /// Locked entity.
    pub item: EntityRef,
    /// Write lock when true.
    pub write: bool,
    /// Begin state of a write lock.
    pub begin: Option<&'static str>,
    /// End state of a write lock.
    pub end: Option<&'static str>,
}

impl LockSpec {
    /// A write lock that leaves `item` in `state`.
    #[must_use]
    pub const fn hold(item: EntityRef, state: &'static str) -> Self {
        Self {
            item,
            write: true,
            begin: Some(state),
            end: Some(state),
        }
    }

    /// A write lock without a state change.
    #[must_use]
    pub const fn exclusive(item: EntityRef) -> Self {
        Self {
            item,
            write: true,
            begin: None,
            end: None,
        }
    }
}

/// A job: a class applied to one subject entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Job {
    /// Job class.
    pub class: JobClass,
    /// Id of the subject entity.
    pub id: EntityId,
}

impl Serialize for Job {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Job", 2)?;
        s.serialize_field("class_name", self.class.name())?;
        s.serialize_field("args", &self.args())?;
        s.end()
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.class, self.subject())
    }
}

impl Job {
    /// Create a job.
    #[must_use]
    pub const fn new(class: JobClass, id: EntityId) -> Self {
        Self { class, id }
    }

    /// The entity the job acts on.
    #[must_use]
    pub const fn subject(&self) -> EntityRef {
        EntityRef::new(self.class.subject_class(), self.id)
    }

    /// Arguments as a JSON object.
    #[must_use]
    pub fn args(&self) -> Value {
        let mut args = serde_json::Map::new();
        args.insert(self.class.arg_name().to_string(), Value::from(self.id.get()));
        Value::Object(args)
    }

    /// Decode a job from its class name and JSON arguments.
    ///
    /// # Errors
    ///
    /// Returns `UnknownJobClass` for an unknown class and `InvalidJobArgs`
    /// when the arguments do not match the class's schema.
    pub fn parse(class_name: &str, args: &Value) -> Result<Self> {
        let class: JobClass = class_name.parse()?;
        let invalid = |message: String| SchedulerError::InvalidJobArgs {
            class_name: class_name.to_string(),
            message,
        };
        let fields = args
            .as_object()
            .ok_or_else(|| invalid("arguments must be an object".to_string()))?;
        if let Some(extra) = fields.keys().find(|k| k.as_str() != class.arg_name()) {
            return Err(invalid(format!("unknown field `{extra}`")));
        }
        let raw = fields
            .get(class.arg_name())
            .ok_or_else(|| invalid(format!("missing field `{}`", class.arg_name())))?;
        let id = raw
            .as_u64()
            .ok_or_else(|| invalid(format!("`{}` must be an unsigned integer", class.arg_name())))?;
        Ok(Self::new(class, EntityId::new(id)))
    }

    /// Decode the job stored in a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record's class or arguments do not decode.
    pub fn from_record(record: &JobRecord) -> Result<Self> {
        let args: Value = serde_json::from_str(&record.args_json)?;
        Self::parse(&record.class_name, &args)
    }

    /// User-visible description.
    #[must_use]
    pub fn description(&self, cache: &ObjectCache) -> String {
        let Some(subject) = cache.get(self.subject()) else {
            return format!("{} {}", self.class, self.subject());
        };
        match self.class {
            JobClass::ApplyConfParams => conf_param::description(*self, &subject),
            _ => match self.class.subject_class() {
                ClassTag::Host => host::description(*self, &subject),
                ClassTag::Target => target::description(*self, &subject),
                ClassTag::Filesystem => filesystem::description(*self, &subject),
                ClassTag::ClientMount | ClassTag::Copytool => {
                    client::description(*self, &subject)
                }
                _ => ha::description(*self, cache, &subject),
            },
        }
    }

    /// What must hold before the job may run.
    #[must_use]
    pub fn deps(&self, cache: &ObjectCache) -> Dependency {
        let Some(subject) = cache.get(self.subject()) else {
            return Dependency::none();
        };
        match self.class {
            JobClass::ApplyConfParams => conf_param::deps(*self, cache, &subject),
            _ => match self.class.subject_class() {
                ClassTag::Host => host::deps(*self, cache, &subject),
                ClassTag::Target => target::deps(*self, cache, &subject),
                ClassTag::Filesystem => filesystem::deps(*self, cache, &subject),
                ClassTag::ClientMount | ClassTag::Copytool => client::deps(*self, cache, &subject),
                _ => ha::deps(*self, cache, &subject),
            },
        }
    }

    /// Locks taken in addition to the transition's write lock and the read
    /// locks on dependencies.
    #[must_use]
    pub fn create_locks(&self, cache: &ObjectCache) -> Vec<LockSpec> {
        match self.class.subject_class() {
            ClassTag::Host => host::create_locks(*self, cache),
            ClassTag::Target => target::create_locks(*self, cache),
            ClassTag::Filesystem => filesystem::create_locks(*self, cache),
            _ => Vec::new(),
        }
    }

    /// The ordered steps that perform the job.
    ///
    /// # Errors
    ///
    /// Returns an error if an entity the steps need has vanished.
    pub fn steps(
        &self,
        cache: &ObjectCache,
        config: &SchedulerConfig,
    ) -> std::result::Result<Vec<Step>, StepError> {
        let subject = cache
            .get(self.subject())
            .ok_or(StepError::EntityVanished(self.subject()))?;
        match self.class {
            JobClass::ApplyConfParams => Ok(conf_param::steps(*self)),
            _ => match self.class.subject_class() {
                ClassTag::Host => host::steps(*self, cache, config, &subject),
                ClassTag::Target => target::steps(*self, cache, &subject),
                ClassTag::Filesystem => Ok(filesystem::steps(*self)),
                ClassTag::ClientMount | ClassTag::Copytool => {
                    Ok(client::steps(*self, cache, &subject))
                }
                _ => ha::steps(*self, &subject),
            },
        }
    }

    /// Entity writes committed together with the job's completion.
    ///
    /// The transition's own state change is applied by the scheduler; this
    /// covers the cascade that goes with it.
    #[must_use]
    pub fn on_success(&self, cache: &ObjectCache, now: DateTime<Utc>) -> Vec<Entity> {
        match self.class.subject_class() {
            ClassTag::Host => host::on_success(*self, cache, now),
            ClassTag::Target => target::on_success(*self, cache),
            _ => Vec::new(),
        }
    }

    /// Entities whose outstanding jobs are cancelled before this job is
    /// planned.
    #[must_use]
    pub fn preempts(&self, cache: &ObjectCache) -> Vec<EntityRef> {
        match self.class {
            JobClass::ForceRemoveHost => host::force_remove_scope(self.id, cache),
            _ => Vec::new(),
        }
    }

    /// Whether a user must confirm before the job runs.
    #[must_use]
    pub const fn requires_confirmation(&self) -> bool {
        confirmation_template(self.class).is_some()
    }

    /// The confirmation prompt for destructive jobs.
    #[must_use]
    pub fn confirmation_prompt(&self, cache: &ObjectCache) -> Option<String> {
        let template = confirmation_template(self.class)?;
        let label = cache
            .get(self.subject())
            .map_or_else(|| self.subject().to_string(), |e| e.label());
        Some(template.replace("{}", &label))
    }
}

const fn confirmation_template(class: JobClass) -> Option<&'static str> {
    match class {
        JobClass::RemoveHost | JobClass::RemoveUnconfiguredHost => Some(
            "Remove {} from the manager. Targets on it will be removed and its configuration \
             torn down.",
        ),
        JobClass::ForceRemoveHost => Some(
            "Remove {} from the manager without contacting it. Use only when the server is \
             permanently gone.",
        ),
        JobClass::RebootHost => Some("Reboot {}. Targets on it will fail over or stop."),
        JobClass::ShutdownHost => Some("Shut down {}. Targets on it will fail over or stop."),
        JobClass::StopLnet | JobClass::UnloadLnet => {
            Some("Stopping LNet ({}) will stop every target and client on the server.")
        }
        JobClass::StopCorosync | JobClass::StopPacemaker => {
            Some("Stopping {} will stop high availability on the server.")
        }
        JobClass::StopTarget => Some("Stopping {} will make it unavailable to clients."),
        JobClass::RemoveConfiguredTarget | JobClass::RemoveTarget => {
            Some("Remove {}. Its data will no longer be reachable through the manager.")
        }
        JobClass::ForgetTarget | JobClass::ForgetFilesystem => {
            Some("Forget {}. It will no longer be monitored or managed.")
        }
        JobClass::FailoverTarget => Some("Move {} to its secondary server."),
        JobClass::FailbackTarget => Some("Move {} back to its primary server."),
        JobClass::StopFilesystem => Some("Stopping {} will make it unavailable to clients."),
        JobClass::RemoveFilesystem => {
            Some("Remove {}. Its configuration will be purged from the MGS.")
        }
        JobClass::UnmountLustreClient | JobClass::RemoveLustreClient => {
            Some("Unmount {} on the client.")
        }
        _ => None,
    }
}

/// Host of an entity: itself for hosts, the owner for configurations.
pub(crate) fn owning_host(cache: &ObjectCache, entity: &Entity) -> Option<lustre_manager_store::Host> {
    let host_id = match entity {
        Entity::Host(h) => return Some(h.clone()),
        Entity::LnetConfiguration(c) => c.host_id,
        Entity::CorosyncConfiguration(c) => c.host_id,
        Entity::PacemakerConfiguration(c) => c.host_id,
        Entity::NtpConfiguration(c) => c.host_id,
        Entity::ClientMount(c) => c.host_id,
        Entity::Copytool(c) => c.host_id,
        _ => return None,
    };
    cache.host(host_id)
}
