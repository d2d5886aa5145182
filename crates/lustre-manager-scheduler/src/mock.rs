//! Test doubles and fixtures.
//!
//! - [`MockAgentFleet`]: scripted agents behind a simulated transport
//! - [`MockLocalActions`]: records manager-side helper calls
//! - [`fixtures`]: entity layouts for cache-level and end-to-end tests
//! - [`mock_context`] / [`Harness`]: a context or a started scheduler wired
//!   to the mocks

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lustre_manager_core::CommandId;
use lustre_manager_store::{CommandRecord, Entity, Store, WriteSet};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub use crate::agent_rpc::mock::{AgentCall, MockAgentFleet};
use crate::agent_rpc::{AgentMessenger, Transport};
use crate::config::SchedulerConfig;
use crate::context::SchedulerContext;
use crate::error::{Result, SchedulerError, StepError};
use crate::local::LocalActions;
use crate::scheduler::JobScheduler;

/// Records helper invocations instead of running them.
///
/// With a fleet attached, `deploy_agent` connects the deployed host's agent,
/// as a real deployment would.
#[derive(Default)]
pub struct MockLocalActions {
    fleet: Option<Arc<MockAgentFleet>>,
    calls: Mutex<Vec<(String, Value)>>,
    failures: Mutex<HashMap<String, String>>,
}

impl MockLocalActions {
    /// Helpers that succeed and do nothing.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Helpers whose agent deployments connect agents in `fleet`.
    #[must_use]
    pub fn with_fleet(fleet: Arc<MockAgentFleet>) -> Arc<Self> {
        Arc::new(Self {
            fleet: Some(fleet),
            ..Self::default()
        })
    }

    /// Make `action` fail with `message`.
    pub fn fail(&self, action: &str, message: &str) {
        self.failures
            .lock()
            .insert(action.to_string(), message.to_string());
    }

    /// Every helper run, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl LocalActions for MockLocalActions {
    async fn run(&self, action: &str, args: &Value) -> std::result::Result<Value, StepError> {
        self.calls.lock().push((action.to_string(), args.clone()));
        if let Some(message) = self.failures.lock().get(action).cloned() {
            return Err(StepError::Local {
                action: action.to_string(),
                message,
            });
        }
        if action == "deploy_agent" {
            if let (Some(fleet), Some(fqdn)) = (&self.fleet, args["fqdn"].as_str()) {
                fleet.connect(fqdn).await;
            }
        }
        Ok(json!({}))
    }
}

/// A context over `store` wired to a fresh fleet and helpers.
///
/// # Errors
///
/// Returns an error if the store cannot be read.
pub fn mock_context(
    store: Arc<dyn Store>,
    config: SchedulerConfig,
) -> Result<(SchedulerContext, Arc<MockAgentFleet>, Arc<MockLocalActions>)> {
    let fleet = MockAgentFleet::new();
    let messenger = Arc::new(AgentMessenger::new(
        Arc::clone(&fleet) as Arc<dyn Transport>,
        &config,
    ));
    fleet.attach(&messenger);
    let local = MockLocalActions::with_fleet(Arc::clone(&fleet));
    let ctx = SchedulerContext::new(
        store,
        config,
        messenger,
        Arc::clone(&local) as Arc<dyn LocalActions>,
    )?;
    Ok((ctx, fleet, local))
}

/// A started scheduler wired to a mock fleet and mock helpers.
pub struct Harness {
    /// The scheduler under test.
    pub scheduler: Arc<JobScheduler>,
    /// Simulated agents.
    pub fleet: Arc<MockAgentFleet>,
    /// Simulated helpers.
    pub local: Arc<MockLocalActions>,
}

impl Harness {
    /// Build and start a scheduler over `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or recovery fails.
    pub async fn start(store: Arc<dyn Store>, config: SchedulerConfig) -> Result<Self> {
        let (ctx, fleet, local) = mock_context(store, config)?;
        let scheduler = JobScheduler::new(ctx);
        scheduler.start().await?;
        Ok(Self {
            scheduler,
            fleet,
            local,
        })
    }

    /// Scheduler context.
    #[must_use]
    pub fn ctx(&self) -> &SchedulerContext {
        self.scheduler.context()
    }

    /// Write entities through the scheduler's single writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub fn put(&self, entities: impl IntoIterator<Item = Entity>) -> Result<()> {
        let mut writes = WriteSet::new();
        for entity in entities {
            writes.put_entity(entity);
        }
        self.ctx().write(writes)
    }

    /// Wait until the command completes.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if it has not completed within an hour of
    /// (possibly paused) tokio time.
    pub async fn wait_for_command(&self, id: CommandId) -> Result<CommandRecord> {
        let poll = async {
            loop {
                if let Some(command) = self.ctx().store().get_command(id)? {
                    if command.complete {
                        return Ok::<_, SchedulerError>(command);
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(3600), poll)
            .await
            .map_err(|_| SchedulerError::Internal(format!("command {id} did not complete")))?
    }
}

/// Entity layouts.
pub mod fixtures {
    use std::collections::BTreeMap;

    use lustre_manager_core::{ClassTag, EntityId, EntityRef};
    use lustre_manager_store::{
        ClientMount, Copytool, CorosyncConfiguration, Entity, Filesystem, Host, IdSpace,
        LnetConfiguration, NtpConfiguration, PacemakerConfiguration, ServerProfile,
        StatefulHeader, Store, Target, TargetMount, TargetRole, Volume, VolumeNode, WriteSet,
    };

    use crate::error::Result;
    use crate::object_cache::ObjectCache;

    /// Ids of the entities in [`single_server_filesystem`].
    #[derive(Debug, Clone, Copy)]
    pub struct Layout {
        /// The server.
        pub host_id: EntityId,
        /// Its LNet configuration.
        pub lnet_id: EntityId,
        /// Its Corosync configuration.
        pub corosync_id: EntityId,
        /// Its Pacemaker configuration.
        pub pacemaker_id: EntityId,
        /// Its NTP configuration.
        pub ntp_id: EntityId,
        /// The MGS.
        pub mgs_id: EntityId,
        /// The MDT.
        pub mdt_id: EntityId,
        /// The OST.
        pub ost_id: EntityId,
        /// The filesystem.
        pub filesystem_id: EntityId,
    }

    /// Ids of the records written by [`managed_server`].
    #[derive(Debug, Clone)]
    pub struct ServerLayout {
        /// The server.
        pub host_id: EntityId,
        /// Its LNet configuration.
        pub lnet_id: EntityId,
        /// Its Corosync configuration.
        pub corosync_id: EntityId,
        /// Its Pacemaker configuration.
        pub pacemaker_id: EntityId,
        /// Its NTP configuration.
        pub ntp_id: EntityId,
        /// Volumes visible to the server, one node each.
        pub volume_ids: Vec<EntityId>,
    }

    const fn id(raw: u64) -> EntityId {
        EntityId::new(raw)
    }

    /// A managed-profile host.
    #[must_use]
    pub fn host(raw_id: u64, fqdn: &str, state: &str) -> Host {
        Host {
            header: StatefulHeader::new(id(raw_id), state),
            fqdn: fqdn.to_string(),
            address: format!("10.0.0.{raw_id}"),
            nodename: fqdn.split('.').next().unwrap_or(fqdn).to_string(),
            server_profile: ServerProfile::Managed,
            boot_time: None,
            install_method: "existing_keys".to_string(),
            properties: BTreeMap::new(),
            ha_cluster_peers: Vec::new(),
        }
    }

    struct Configs {
        lnet: LnetConfiguration,
        corosync: CorosyncConfiguration,
        pacemaker: PacemakerConfiguration,
        ntp: NtpConfiguration,
    }

    fn running_configs(host_id: EntityId, first_id: u64, nids: Vec<String>) -> Configs {
        Configs {
            lnet: LnetConfiguration {
                header: StatefulHeader::new(id(first_id), "lnet_up"),
                host_id,
                nids,
            },
            corosync: CorosyncConfiguration {
                header: StatefulHeader::new(id(first_id + 1), "started"),
                host_id,
                mcast_port: Some(4242),
                corosync_reported_up: true,
            },
            pacemaker: PacemakerConfiguration {
                header: StatefulHeader::new(id(first_id + 2), "started"),
                host_id,
            },
            ntp: NtpConfiguration {
                header: StatefulHeader::new(id(first_id + 3), "configured"),
                host_id,
                server: Some("ntp.example.com".to_string()),
            },
        }
    }

    fn volume(raw_id: u64, label: &str) -> Volume {
        Volume {
            id: id(raw_id),
            label: label.to_string(),
            size: Some(1 << 40),
            filesystem_type: None,
            not_deleted: true,
        }
    }

    fn volume_node(raw_id: u64, volume_id: EntityId, host_id: EntityId, path: &str) -> VolumeNode {
        VolumeNode {
            id: id(raw_id),
            volume_id,
            host_id,
            path: path.to_string(),
            primary: true,
            use_for_mounts: true,
            not_deleted: true,
        }
    }

    fn target(raw_id: u64, name: &str, volume_id: EntityId, role: TargetRole) -> Target {
        Target {
            header: StatefulHeader::new(id(raw_id), "unformatted"),
            name: name.to_string(),
            uuid: None,
            ha_label: format!("{name}_{raw_id}"),
            volume_id,
            active_mount_id: None,
            reformat: false,
            inode_size: None,
            role,
        }
    }

    /// One managed server `h1.example.com` carrying an MGS, an MDT and an
    /// OST of the unformatted filesystem `testfs`, each on its own volume.
    ///
    /// The server's services are all running.
    pub fn single_server_filesystem(cache: &ObjectCache) -> Layout {
        let host_id = id(1);
        let configs = running_configs(host_id, 2, Vec::new());
        let layout = Layout {
            host_id,
            lnet_id: configs.lnet.header.id,
            corosync_id: configs.corosync.header.id,
            pacemaker_id: configs.pacemaker.header.id,
            ntp_id: configs.ntp.header.id,
            mgs_id: id(30),
            mdt_id: id(31),
            ost_id: id(32),
            filesystem_id: id(50),
        };

        cache.add(host(1, "h1.example.com", "managed").into());
        cache.add(configs.lnet.into());
        cache.add(configs.corosync.into());
        cache.add(configs.pacemaker.into());
        cache.add(configs.ntp.into());

        let roles = [
            (
                layout.mgs_id,
                "MGS",
                TargetRole::Mgs {
                    conf_param_version: 0,
                    conf_param_version_applied: 0,
                },
            ),
            (
                layout.mdt_id,
                "testfs-MDT0000",
                TargetRole::Mdt {
                    filesystem_id: layout.filesystem_id,
                    index: 0,
                },
            ),
            (
                layout.ost_id,
                "testfs-OST0000",
                TargetRole::Ost {
                    filesystem_id: layout.filesystem_id,
                    index: 0,
                },
            ),
        ];
        for (n, ((target_id, name, role), path)) in roles
            .into_iter()
            .zip(["/dev/sda", "/dev/sdb", "/dev/sdc"])
            .enumerate()
        {
            let n = n as u64;
            let volume_id = id(10 + n);
            cache.add(volume(10 + n, &format!("vol-{n}")).into());
            cache.add(volume_node(20 + n, volume_id, host_id, path).into());
            cache.add(target(target_id.get(), name, volume_id, role).into());
            cache.add(
                TargetMount {
                    id: id(40 + n),
                    target_id,
                    host_id,
                    volume_node_id: id(20 + n),
                    mount_point: Some(format!("/mnt/{name}")),
                    primary: true,
                    not_deleted: true,
                }
                .into(),
            );
        }

        cache.add(
            Filesystem {
                header: StatefulHeader::new(layout.filesystem_id, "unavailable"),
                name: "testfs".to_string(),
                mgs_id: layout.mgs_id,
                mdt_next_index: 1,
                ost_next_index: 1,
            }
            .into(),
        );
        layout
    }

    /// A worker host with an unmounted client of the layout's filesystem and
    /// a stopped copytool on it. Returns `(client_mount_id, copytool_id)`.
    pub fn client_with_copytool(cache: &ObjectCache, layout: &Layout) -> (EntityId, EntityId) {
        let mut worker = host(60, "client.example.com", "working");
        worker.server_profile = ServerProfile::Worker;
        cache.add(worker.into());
        cache.add(
            LnetConfiguration {
                header: StatefulHeader::new(id(61), "lnet_up"),
                host_id: id(60),
                nids: vec!["10.0.0.60@tcp0".to_string()],
            }
            .into(),
        );
        cache.add(
            ClientMount {
                header: StatefulHeader::new(id(62), "unmounted"),
                host_id: id(60),
                filesystem_id: layout.filesystem_id,
                mountpoint: "/mnt/testfs".to_string(),
            }
            .into(),
        );
        cache.add(
            Copytool {
                header: StatefulHeader::new(id(63), "stopped"),
                host_id: id(60),
                client_mount_id: Some(id(62)),
                bin_path: "/usr/sbin/lhsmtool_posix".to_string(),
                archive: 1,
                uuid: None,
            }
            .into(),
        );
        (id(62), id(63))
    }

    /// Write a fully set up managed server with `volumes` unused volumes
    /// (`/dev/sda`, `/dev/sdb`, ...) to `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if id allocation or the commit fails.
    pub fn managed_server(store: &dyn Store, fqdn: &str, volumes: usize) -> Result<ServerLayout> {
        let mut next = || store.next_id(IdSpace::Entity).map(EntityId::new);
        let host_id = next()?;
        let mut host = host(host_id.get(), fqdn, "managed");
        host.header.id = host_id;

        let lnet = LnetConfiguration {
            header: StatefulHeader::new(next()?, "lnet_up"),
            host_id,
            nids: vec![format!("{fqdn}@tcp0")],
        };
        let corosync = CorosyncConfiguration {
            header: StatefulHeader::new(next()?, "started"),
            host_id,
            mcast_port: Some(4242),
            corosync_reported_up: true,
        };
        let pacemaker = PacemakerConfiguration {
            header: StatefulHeader::new(next()?, "started"),
            host_id,
        };
        let ntp = NtpConfiguration {
            header: StatefulHeader::new(next()?, "configured"),
            host_id,
            server: None,
        };
        let mut layout = ServerLayout {
            host_id,
            lnet_id: lnet.header.id,
            corosync_id: corosync.header.id,
            pacemaker_id: pacemaker.header.id,
            ntp_id: ntp.header.id,
            volume_ids: Vec::new(),
        };

        let mut writes = WriteSet::new();
        writes
            .put_entity(host.into())
            .put_entity(lnet.into())
            .put_entity(corosync.into())
            .put_entity(pacemaker.into())
            .put_entity(ntp.into());
        for n in 0..volumes {
            let volume_id = next()?;
            let node_id = next()?;
            let letter = char::from(b'a' + u8::try_from(n % 26).unwrap_or(0));
            writes.put_entity(volume(volume_id.get(), &format!("{fqdn}-vol{n}")).into());
            writes.put_entity(
                volume_node(node_id.get(), volume_id, host_id, &format!("/dev/sd{letter}")).into(),
            );
            layout.volume_ids.push(volume_id);
        }
        store.commit(writes)?;
        Ok(layout)
    }

    /// The entity `item` as currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn stored(store: &dyn Store, item: EntityRef) -> Result<Option<Entity>> {
        Ok(store.get_entity(item)?)
    }

    /// Reference to a target.
    #[must_use]
    pub const fn target_ref(target_id: EntityId) -> EntityRef {
        EntityRef::new(ClassTag::Target, target_id)
    }
}
