//! Steps: the sequential units of work inside a job.
//!
//! A job's steps are computed from the job and the object cache when the
//! job starts. Each step either runs an action on an agent, runs a
//! manager-side helper, or writes to the database, and returns a JSON
//! result that is recorded on its step result and handed to the next step.
//!
//! Steps are a closed enum serialized as `{"step_class", "args"}`, so a
//! step result's arguments decode back to the step that produced them.

mod context;
mod host;
mod target;

use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StepError;
use crate::object_cache::ObjectCache;

pub use context::StepContext;

/// A unit of work run by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step_class", content = "args")]
pub enum Step {
    /// Run a named action on a host's agent.
    AgentAction {
        /// Host to run on.
        host_id: EntityId,
        /// Action name.
        action: String,
        /// Action arguments.
        #[serde(default)]
        args: Value,
    },
    /// Install the agent on a host over ssh.
    DeployAgent {
        /// Host to deploy to.
        host_id: EntityId,
    },
    /// Wait for a host's agent to open a session.
    AwaitSession {
        /// Host.
        host_id: EntityId,
        /// How long to wait.
        timeout_seconds: u64,
    },
    /// Install the host profile's packages.
    InstallPackages {
        /// Host.
        host_id: EntityId,
        /// Package names.
        packages: Vec<String>,
    },
    /// Reboot if the previous step reported that a reboot is required.
    RebootIfRequired {
        /// Host.
        host_id: EntityId,
        /// How long to wait for the agent to return.
        timeout_seconds: u64,
    },
    /// Reboot a host and wait for its agent to return.
    Reboot {
        /// Host.
        host_id: EntityId,
        /// How long to wait for the agent to return.
        timeout_seconds: u64,
    },
    /// Record the NIDs of a host once LNet is up.
    LearnNids {
        /// LNet configuration to update.
        lnet_id: EntityId,
    },
    /// Format a target on its primary device.
    FormatTarget {
        /// Target.
        target_id: EntityId,
    },
    /// Register a target with its MGS.
    RegisterTarget {
        /// Target.
        target_id: EntityId,
    },
    /// Create the HA resource for a target on one of its mounts.
    ConfigureTargetHa {
        /// Mount to configure.
        target_mount_id: EntityId,
    },
    /// Remove the HA resource for a target from one of its mounts.
    UnconfigureTargetHa {
        /// Mount to unconfigure.
        target_mount_id: EntityId,
    },
    /// Start a target's HA resource and record where it runs.
    StartTarget {
        /// Target.
        target_id: EntityId,
    },
    /// Stop a target's HA resource.
    StopTarget {
        /// Target.
        target_id: EntityId,
    },
    /// Move a running target to another of its mounts.
    MoveTarget {
        /// Target.
        target_id: EntityId,
        /// Destination mount.
        target_mount_id: EntityId,
        /// Whether the destination is the primary.
        failback: bool,
    },
    /// Erase a filesystem's configuration from its MGS.
    PurgeFilesystem {
        /// Filesystem.
        filesystem_id: EntityId,
    },
    /// Write pending conf params through an MGS.
    ApplyConfParams {
        /// MGS target.
        mgs_id: EntityId,
    },
    /// Retire a host and everything that only exists through it.
    ForceRemoveHost {
        /// Host.
        host_id: EntityId,
    },
}

impl Step {
    /// Step class name recorded on step results.
    #[must_use]
    pub const fn class_name(&self) -> &'static str {
        match self {
            Self::AgentAction { .. } => "AgentAction",
            Self::DeployAgent { .. } => "DeployAgent",
            Self::AwaitSession { .. } => "AwaitSession",
            Self::InstallPackages { .. } => "InstallPackages",
            Self::RebootIfRequired { .. } => "RebootIfRequired",
            Self::Reboot { .. } => "Reboot",
            Self::LearnNids { .. } => "LearnNids",
            Self::FormatTarget { .. } => "FormatTarget",
            Self::RegisterTarget { .. } => "RegisterTarget",
            Self::ConfigureTargetHa { .. } => "ConfigureTargetHa",
            Self::UnconfigureTargetHa { .. } => "UnconfigureTargetHa",
            Self::StartTarget { .. } => "StartTarget",
            Self::StopTarget { .. } => "StopTarget",
            Self::MoveTarget { .. } => "MoveTarget",
            Self::PurgeFilesystem { .. } => "PurgeFilesystem",
            Self::ApplyConfParams { .. } => "ApplyConfParams",
            Self::ForceRemoveHost { .. } => "ForceRemoveHost",
        }
    }

    /// Whether the step may be re-run after being interrupted.
    #[must_use]
    pub const fn idempotent(&self) -> bool {
        !matches!(
            self,
            Self::DeployAgent { .. }
                | Self::FormatTarget { .. }
                | Self::RegisterTarget { .. }
                | Self::Reboot { .. }
                | Self::RebootIfRequired { .. }
                | Self::PurgeFilesystem { .. }
        )
    }

    /// Whether the step writes to the database itself.
    #[must_use]
    pub const fn database(&self) -> bool {
        matches!(
            self,
            Self::LearnNids { .. }
                | Self::FormatTarget { .. }
                | Self::RegisterTarget { .. }
                | Self::StartTarget { .. }
                | Self::StopTarget { .. }
                | Self::MoveTarget { .. }
                | Self::ApplyConfParams { .. }
                | Self::ForceRemoveHost { .. }
        )
    }

    /// Step arguments as recorded on the step result.
    #[must_use]
    pub fn args(&self) -> Value {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.get("args").cloned())
            .unwrap_or(Value::Null)
    }

    /// User-visible rendering.
    #[must_use]
    pub fn describe(&self, cache: &ObjectCache) -> String {
        let label = |class: ClassTag, id: EntityId| {
            let item = EntityRef::new(class, id);
            cache.get(item).map_or_else(|| item.to_string(), |e| e.label())
        };
        let host = |id: EntityId| label(ClassTag::Host, id);
        let target = |id: EntityId| label(ClassTag::Target, id);
        let mount = |id: EntityId| {
            cache.target_mount(id).map_or_else(
                || EntityRef::new(ClassTag::TargetMount, id).to_string(),
                |m| format!("{} on {}", target(m.target_id), host(m.host_id)),
            )
        };
        match self {
            Self::AgentAction {
                host_id, action, ..
            } => format!("Run {action} on {}", host(*host_id)),
            Self::DeployAgent { host_id } => format!("Deploy agent to {}", host(*host_id)),
            Self::AwaitSession { host_id, .. } => {
                format!("Wait for the agent on {} to connect", host(*host_id))
            }
            Self::InstallPackages { host_id, packages } => {
                format!("Install {} on {}", packages.join(", "), host(*host_id))
            }
            Self::RebootIfRequired { host_id, .. } => {
                format!("Reboot {} if required", host(*host_id))
            }
            Self::Reboot { host_id, .. } => format!("Reboot {}", host(*host_id)),
            Self::LearnNids { lnet_id } => {
                format!("Learn NIDs for {}", label(ClassTag::LnetConfiguration, *lnet_id))
            }
            Self::FormatTarget { target_id } => format!("Format {}", target(*target_id)),
            Self::RegisterTarget { target_id } => format!("Register {}", target(*target_id)),
            Self::ConfigureTargetHa { target_mount_id } => {
                format!("Configure HA for {}", mount(*target_mount_id))
            }
            Self::UnconfigureTargetHa { target_mount_id } => {
                format!("Remove HA configuration for {}", mount(*target_mount_id))
            }
            Self::StartTarget { target_id } => format!("Start {}", target(*target_id)),
            Self::StopTarget { target_id } => format!("Stop {}", target(*target_id)),
            Self::MoveTarget {
                target_mount_id,
                failback,
                ..
            } => {
                let verb = if *failback { "Fail back" } else { "Fail over" };
                format!("{verb} {}", mount(*target_mount_id))
            }
            Self::PurgeFilesystem { filesystem_id } => format!(
                "Purge configuration of {}",
                label(ClassTag::Filesystem, *filesystem_id)
            ),
            Self::ApplyConfParams { mgs_id } => {
                format!("Apply conf params on {}", target(*mgs_id))
            }
            Self::ForceRemoveHost { host_id } => format!("Force remove {}", host(*host_id)),
        }
    }

    /// Run the step.
    ///
    /// # Errors
    ///
    /// Returns the step's failure; the runner fails the job with it.
    pub async fn run(&self, ctx: &StepContext<'_>) -> Result<Value, StepError> {
        match self {
            Self::AgentAction {
                host_id,
                action,
                args,
            } => ctx.invoke_agent(*host_id, action, args.clone()).await,
            Self::DeployAgent { host_id } => host::deploy_agent(ctx, *host_id).await,
            Self::AwaitSession {
                host_id,
                timeout_seconds,
            } => host::await_session(ctx, *host_id, *timeout_seconds).await,
            Self::InstallPackages { host_id, packages } => {
                host::install_packages(ctx, *host_id, packages).await
            }
            Self::RebootIfRequired {
                host_id,
                timeout_seconds,
            } => {
                if ctx.prev_result()["reboot_required"].as_bool() == Some(true) {
                    host::reboot(ctx, *host_id, *timeout_seconds).await
                } else {
                    Ok(Value::Null)
                }
            }
            Self::Reboot {
                host_id,
                timeout_seconds,
            } => host::reboot(ctx, *host_id, *timeout_seconds).await,
            Self::LearnNids { lnet_id } => host::learn_nids(ctx, *lnet_id).await,
            Self::FormatTarget { target_id } => target::format(ctx, *target_id).await,
            Self::RegisterTarget { target_id } => target::register(ctx, *target_id).await,
            Self::ConfigureTargetHa { target_mount_id } => {
                target::configure_ha(ctx, *target_mount_id).await
            }
            Self::UnconfigureTargetHa { target_mount_id } => {
                target::unconfigure_ha(ctx, *target_mount_id).await
            }
            Self::StartTarget { target_id } => target::start(ctx, *target_id).await,
            Self::StopTarget { target_id } => target::stop(ctx, *target_id).await,
            Self::MoveTarget {
                target_id,
                target_mount_id,
                failback,
            } => target::move_to(ctx, *target_id, *target_mount_id, *failback).await,
            Self::PurgeFilesystem { filesystem_id } => {
                target::purge_filesystem(ctx, *filesystem_id).await
            }
            Self::ApplyConfParams { mgs_id } => target::apply_conf_params(ctx, *mgs_id).await,
            Self::ForceRemoveHost { host_id } => host::force_remove(ctx, *host_id),
        }
    }
}
