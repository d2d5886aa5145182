//! Validation and record building for entity-creating requests.
//!
//! Each builder checks its request against the object cache and returns
//! the records to commit. Nothing here writes; the scheduler commits the
//! returned [`WriteSet`] under its own lock.

use std::collections::{BTreeMap, HashSet};

use lustre_manager_core::{ClassTag, EntityId};
use lustre_manager_store::{
    ClientMount, ConfParam, ConfParamScope, Copytool, CorosyncConfiguration, Entity, Filesystem,
    Host, IdSpace, LnetConfiguration, NtpConfiguration, PacemakerConfiguration, ServerProfile,
    StatefulHeader, Target, TargetMount, TargetRole, WriteSet,
};
use serde::{Deserialize, Serialize};

use crate::classes;
use crate::context::SchedulerContext;
use crate::error::{Result, SchedulerError};

/// Longest filesystem name Lustre accepts.
pub const MAX_FILESYSTEM_NAME: usize = 8;

/// Register a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateHost {
    /// Fully qualified domain name, unique across hosts.
    pub fqdn: String,
    /// Address to reach the host at; defaults to the FQDN.
    #[serde(default)]
    pub address: Option<String>,
    /// Short node name; defaults to the first FQDN label.
    #[serde(default)]
    pub nodename: Option<String>,
    /// Role the host is set up for.
    #[serde(default)]
    pub server_profile: ServerProfile,
    /// How the agent is deployed.
    #[serde(default = "default_install_method")]
    pub install_method: String,
}

fn default_install_method() -> String {
    "existing_keys".to_string()
}

/// Where a new filesystem's MGS comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MgtSpec {
    /// Share an MGS that already exists.
    Existing {
        /// The MGS target.
        mgs_id: EntityId,
    },
    /// Create a new MGS on a volume.
    New {
        /// The volume.
        volume_id: EntityId,
    },
}

/// Create a filesystem from unused volumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFilesystem {
    /// Filesystem name.
    pub name: String,
    /// MGS to register with.
    pub mgt: MgtSpec,
    /// One volume per MDT.
    pub mdts: Vec<EntityId>,
    /// One volume per OST.
    pub osts: Vec<EntityId>,
}

/// Mount a filesystem on a client host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClientMount {
    /// The client.
    pub host_id: EntityId,
    /// The filesystem.
    pub filesystem_id: EntityId,
    /// Mount point; defaults to `/mnt/{name}`.
    #[serde(default)]
    pub mountpoint: Option<String>,
}

/// Register an HSM copytool on a client host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCopytool {
    /// The client.
    pub host_id: EntityId,
    /// Client mount it archives from.
    #[serde(default)]
    pub client_mount_id: Option<EntityId>,
    /// Copytool binary.
    pub bin_path: String,
    /// HSM archive number.
    #[serde(default = "default_archive")]
    pub archive: u32,
}

const fn default_archive() -> u32 {
    1
}

/// Set or clear one configuration parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfParamUpdate {
    /// What the parameter applies to.
    #[serde(flatten)]
    pub scope: ConfParamScope,
    /// Parameter name, e.g. `osc.max_dirty_mb`.
    pub key: String,
    /// New value; `None` deletes the parameter.
    #[serde(default)]
    pub value: Option<String>,
}

fn invalid(message: impl Into<String>) -> SchedulerError {
    SchedulerError::InvalidRequest(message.into())
}

fn next_entity_id(ctx: &SchedulerContext) -> Result<EntityId> {
    ctx.next_id(IdSpace::Entity).map(EntityId::new)
}

/// Build a host and its four service configurations.
///
/// # Errors
///
/// Returns `InvalidRequest` if the FQDN is empty or already registered.
pub fn host_records(ctx: &SchedulerContext, request: &CreateHost) -> Result<(Host, WriteSet)> {
    let fqdn = request.fqdn.trim();
    if fqdn.is_empty() {
        return Err(invalid("fqdn must not be empty"));
    }
    if ctx.cache().host_by_fqdn(fqdn).is_some() {
        return Err(invalid(format!("host {fqdn} already exists")));
    }

    let host = Host {
        header: StatefulHeader::new(next_entity_id(ctx)?, classes::initial_state(ClassTag::Host)),
        fqdn: fqdn.to_string(),
        address: request.address.clone().unwrap_or_else(|| fqdn.to_string()),
        nodename: request
            .nodename
            .clone()
            .unwrap_or_else(|| fqdn.split('.').next().unwrap_or(fqdn).to_string()),
        server_profile: request.server_profile,
        boot_time: None,
        install_method: request.install_method.clone(),
        properties: BTreeMap::new(),
        ha_cluster_peers: Vec::new(),
    };
    let host_id = host.header.id;
    let header = |class: ClassTag| -> Result<StatefulHeader> {
        Ok(StatefulHeader::new(next_entity_id(ctx)?, classes::initial_state(class)))
    };

    let mut writes = WriteSet::new();
    writes
        .put_entity(host.clone().into())
        .put_entity(
            LnetConfiguration {
                header: header(ClassTag::LnetConfiguration)?,
                host_id,
                nids: Vec::new(),
            }
            .into(),
        )
        .put_entity(
            CorosyncConfiguration {
                header: header(ClassTag::CorosyncConfiguration)?,
                host_id,
                mcast_port: None,
                corosync_reported_up: false,
            }
            .into(),
        )
        .put_entity(
            PacemakerConfiguration {
                header: header(ClassTag::PacemakerConfiguration)?,
                host_id,
            }
            .into(),
        )
        .put_entity(
            NtpConfiguration {
                header: header(ClassTag::NtpConfiguration)?,
                host_id,
                server: None,
            }
            .into(),
        );
    Ok((host, writes))
}

fn validate_filesystem_name(ctx: &SchedulerContext, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_FILESYSTEM_NAME {
        return Err(invalid(format!(
            "filesystem name must be 1 to {MAX_FILESYSTEM_NAME} characters"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(invalid(format!(
            "filesystem name {name:?} may only contain letters, digits and underscores"
        )));
    }
    if ctx.cache().filesystem_by_name(name).is_some() {
        return Err(invalid(format!("filesystem {name} already exists")));
    }
    Ok(())
}

/// A target plus one mount per volume node usable for mounting.
fn target_records(
    ctx: &SchedulerContext,
    name: String,
    volume_id: EntityId,
    role: TargetRole,
    mount_point: &str,
    writes: &mut WriteSet,
) -> Result<Target> {
    let nodes: Vec<_> = ctx
        .cache()
        .volume_nodes(volume_id)
        .into_iter()
        .filter(|n| n.use_for_mounts)
        .collect();
    if nodes.is_empty() {
        return Err(invalid(format!("volume {volume_id} is not visible to any server")));
    }

    let id = next_entity_id(ctx)?;
    let target = Target {
        header: StatefulHeader::new(id, classes::initial_state(ClassTag::Target)),
        ha_label: format!("{name}_{id}"),
        name,
        uuid: None,
        volume_id,
        active_mount_id: None,
        reformat: false,
        inode_size: None,
        role,
    };
    writes.put_entity(target.clone().into());
    for node in nodes {
        writes.put_entity(
            TargetMount {
                id: next_entity_id(ctx)?,
                target_id: id,
                host_id: node.host_id,
                volume_node_id: node.id,
                mount_point: Some(mount_point.to_string()),
                primary: node.primary,
                not_deleted: true,
            }
            .into(),
        );
    }
    Ok(target)
}

/// Build a filesystem, its targets and their mounts.
///
/// A new MGS is created when the request names a volume for it. The
/// filesystem starts `unavailable`; the caller plans it to `available`.
///
/// # Errors
///
/// Returns `InvalidRequest` for a bad name, an unknown or used volume, or
/// an MGS that does not exist.
pub fn filesystem_records(
    ctx: &SchedulerContext,
    request: &CreateFilesystem,
) -> Result<(Filesystem, WriteSet)> {
    let name = request.name.trim();
    validate_filesystem_name(ctx, name)?;
    if request.mdts.is_empty() || request.osts.is_empty() {
        return Err(invalid("a filesystem needs at least one MDT and one OST"));
    }

    let mut volumes: Vec<EntityId> = request.mdts.iter().chain(&request.osts).copied().collect();
    if let MgtSpec::New { volume_id } = request.mgt {
        volumes.push(volume_id);
    }
    let mut seen = HashSet::new();
    for volume_id in &volumes {
        if !seen.insert(*volume_id) {
            return Err(invalid(format!("volume {volume_id} is named twice")));
        }
        if ctx.cache().volume(*volume_id).is_none() {
            return Err(invalid(format!("volume {volume_id} does not exist")));
        }
        if ctx.cache().volume_in_use(*volume_id) {
            return Err(invalid(format!("volume {volume_id} is already in use")));
        }
    }

    let mut writes = WriteSet::new();
    let mount_point = format!("/mnt/{name}");
    let mgs_id = match request.mgt {
        MgtSpec::Existing { mgs_id } => match ctx.cache().target(mgs_id) {
            Some(t) if t.header.not_deleted && matches!(t.role, TargetRole::Mgs { .. }) => mgs_id,
            _ => return Err(invalid(format!("MGS {mgs_id} does not exist"))),
        },
        MgtSpec::New { volume_id } => {
            let role = TargetRole::Mgs {
                conf_param_version: 0,
                conf_param_version_applied: 0,
            };
            target_records(ctx, "MGS".to_string(), volume_id, role, &mount_point, &mut writes)?
                .header
                .id
        }
    };

    let mut filesystem = Filesystem {
        header: StatefulHeader::new(next_entity_id(ctx)?, classes::initial_state(ClassTag::Filesystem)),
        name: name.to_string(),
        mgs_id,
        mdt_next_index: 0,
        ost_next_index: 0,
    };
    let filesystem_id = filesystem.header.id;

    for volume_id in &request.mdts {
        let index = filesystem.mdt_next_index;
        filesystem.mdt_next_index += 1;
        let role = TargetRole::Mdt {
            filesystem_id,
            index,
        };
        target_records(ctx, format!("{name}-MDT{index:04x}"), *volume_id, role, &mount_point, &mut writes)?;
    }
    for volume_id in &request.osts {
        let index = filesystem.ost_next_index;
        filesystem.ost_next_index += 1;
        let role = TargetRole::Ost {
            filesystem_id,
            index,
        };
        target_records(ctx, format!("{name}-OST{index:04x}"), *volume_id, role, &mount_point, &mut writes)?;
    }

    writes.put_entity(filesystem.clone().into());
    Ok((filesystem, writes))
}

/// Build a client mount.
///
/// # Errors
///
/// Returns `InvalidRequest` if the host or filesystem does not exist, or
/// the host already mounts the filesystem.
pub fn client_mount_record(ctx: &SchedulerContext, request: &CreateClientMount) -> Result<ClientMount> {
    let cache = ctx.cache();
    if !cache.host(request.host_id).is_some_and(|h| h.header.not_deleted) {
        return Err(invalid(format!("host {} does not exist", request.host_id)));
    }
    let Some(filesystem) = cache
        .filesystem(request.filesystem_id)
        .filter(|f| f.header.not_deleted)
    else {
        return Err(invalid(format!("filesystem {} does not exist", request.filesystem_id)));
    };
    if cache
        .host_client_mounts(request.host_id)
        .iter()
        .any(|m| m.filesystem_id == request.filesystem_id && m.header.not_deleted)
    {
        return Err(invalid(format!(
            "host {} already mounts {}",
            request.host_id, filesystem.name
        )));
    }

    Ok(ClientMount {
        header: StatefulHeader::new(next_entity_id(ctx)?, classes::initial_state(ClassTag::ClientMount)),
        host_id: request.host_id,
        filesystem_id: request.filesystem_id,
        mountpoint: request
            .mountpoint
            .clone()
            .unwrap_or_else(|| format!("/mnt/{}", filesystem.name)),
    })
}

/// Build a copytool.
///
/// # Errors
///
/// Returns `InvalidRequest` if the host or client mount does not exist, the
/// mount belongs to another host, or the binary path is empty.
pub fn copytool_record(ctx: &SchedulerContext, request: &CreateCopytool) -> Result<Copytool> {
    let cache = ctx.cache();
    if !cache.host(request.host_id).is_some_and(|h| h.header.not_deleted) {
        return Err(invalid(format!("host {} does not exist", request.host_id)));
    }
    if request.bin_path.trim().is_empty() {
        return Err(invalid("bin_path must not be empty"));
    }
    if let Some(mount_id) = request.client_mount_id {
        match cache.client_mount(mount_id) {
            Some(m) if m.host_id == request.host_id && m.header.not_deleted => {}
            Some(_) => {
                return Err(invalid(format!(
                    "client mount {mount_id} is not on host {}",
                    request.host_id
                )))
            }
            None => return Err(invalid(format!("client mount {mount_id} does not exist"))),
        }
    }

    Ok(Copytool {
        header: StatefulHeader::new(next_entity_id(ctx)?, classes::initial_state(ClassTag::Copytool)),
        host_id: request.host_id,
        client_mount_id: request.client_mount_id,
        bin_path: request.bin_path.trim().to_string(),
        archive: request.archive,
        uuid: None,
    })
}

/// MGS owning the filesystem a parameter scope refers to.
fn scope_mgs(ctx: &SchedulerContext, scope: &ConfParamScope) -> Result<EntityId> {
    let cache = ctx.cache();
    let filesystem_id = match scope {
        ConfParamScope::Filesystem { filesystem_id }
        | ConfParamScope::FilesystemClient { filesystem_id } => *filesystem_id,
        ConfParamScope::Mdt { target_id } => match cache.target(*target_id).map(|t| t.role) {
            Some(TargetRole::Mdt { filesystem_id, .. }) => filesystem_id,
            _ => return Err(invalid(format!("target {target_id} is not an MDT"))),
        },
        ConfParamScope::Ost { target_id } => match cache.target(*target_id).map(|t| t.role) {
            Some(TargetRole::Ost { filesystem_id, .. }) => filesystem_id,
            _ => return Err(invalid(format!("target {target_id} is not an OST"))),
        },
    };
    cache
        .filesystem(filesystem_id)
        .filter(|f| f.header.not_deleted)
        .map(|f| f.mgs_id)
        .ok_or_else(|| invalid(format!("filesystem {filesystem_id} does not exist")))
}

/// Build parameter records, bumping each touched MGS's version once per
/// parameter.
///
/// # Errors
///
/// Returns `InvalidRequest` for an empty key or a scope that does not
/// resolve to a filesystem.
pub fn conf_param_records(
    ctx: &SchedulerContext,
    updates: &[ConfParamUpdate],
) -> Result<(Vec<ConfParam>, WriteSet)> {
    if updates.is_empty() {
        return Err(invalid("no parameters given"));
    }
    let mut mgs_targets: BTreeMap<EntityId, Target> = BTreeMap::new();
    let mut params = Vec::with_capacity(updates.len());

    for update in updates {
        let key = update.key.trim();
        if key.is_empty() {
            return Err(invalid("parameter key must not be empty"));
        }
        let mgs_id = scope_mgs(ctx, &update.scope)?;
        let mgs = match mgs_targets.get_mut(&mgs_id) {
            Some(mgs) => mgs,
            None => {
                let target = ctx
                    .cache()
                    .target(mgs_id)
                    .ok_or_else(|| invalid(format!("MGS {mgs_id} does not exist")))?;
                mgs_targets.entry(mgs_id).or_insert(target)
            }
        };
        let TargetRole::Mgs {
            conf_param_version, ..
        } = &mut mgs.role
        else {
            return Err(invalid(format!("target {mgs_id} is not an MGS")));
        };
        *conf_param_version += 1;

        params.push(ConfParam {
            id: next_entity_id(ctx)?,
            mgs_id,
            scope: update.scope.clone(),
            key: key.to_string(),
            value: update.value.clone(),
            version: *conf_param_version,
        });
    }

    let mut writes = WriteSet::new();
    for mgs in mgs_targets.into_values() {
        writes.put_entity(Entity::from(mgs));
    }
    for param in &params {
        writes.put_entity(param.clone().into());
    }
    Ok((params, writes))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lustre_manager_store::{RocksStore, Store};
    use tempfile::TempDir;

    use super::*;
    use crate::config::SchedulerConfig;
    use crate::mock::{fixtures, mock_context};

    fn context(volumes: usize) -> (TempDir, SchedulerContext, fixtures::ServerLayout) {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn Store> = Arc::new(RocksStore::open(dir.path()).unwrap());
        let server = fixtures::managed_server(store.as_ref(), "oss1.example.com", volumes).unwrap();
        let (ctx, _, _) = mock_context(store, SchedulerConfig::default()).unwrap();
        (dir, ctx, server)
    }

    fn commit(ctx: &SchedulerContext, writes: WriteSet) {
        ctx.write(writes).unwrap();
    }

    #[test]
    fn new_host_gets_unconfigured_services() {
        let (_dir, ctx, _) = context(0);
        let request = CreateHost {
            fqdn: "mds1.example.com".to_string(),
            address: None,
            nodename: None,
            server_profile: ServerProfile::Managed,
            install_method: default_install_method(),
        };
        let (host, writes) = host_records(&ctx, &request).unwrap();
        commit(&ctx, writes);

        assert_eq!(host.header.state, "undeployed");
        assert_eq!(host.nodename, "mds1");
        let lnet = ctx.cache().host_config(host.header.id, ClassTag::LnetConfiguration).unwrap();
        assert_eq!(ctx.cache().state(lnet).as_deref(), Some("unconfigured"));
        assert_eq!(ctx.cache().host_configs(host.header.id).len(), 4);

        let err = host_records(&ctx, &request).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }

    #[test]
    fn filesystem_targets_are_named_and_mounted() {
        let (_dir, ctx, server) = context(4);
        let request = CreateFilesystem {
            name: "testfs".to_string(),
            mgt: MgtSpec::New {
                volume_id: server.volume_ids[0],
            },
            mdts: vec![server.volume_ids[1]],
            osts: vec![server.volume_ids[2], server.volume_ids[3]],
        };
        let (fs, writes) = filesystem_records(&ctx, &request).unwrap();
        commit(&ctx, writes);

        let mut names: Vec<_> = ctx
            .cache()
            .fs_targets(fs.header.id)
            .into_iter()
            .map(|t| t.name)
            .collect();
        names.sort();
        assert_eq!(names, ["testfs-MDT0000", "testfs-OST0000", "testfs-OST0001"]);
        let mgs = ctx.cache().target(fs.mgs_id).unwrap();
        assert_eq!(mgs.name, "MGS");
        assert_eq!(mgs.ha_label, format!("MGS_{}", fs.mgs_id));
        assert_eq!(fs.ost_next_index, 2);
        for target in ctx.cache().fs_targets(fs.header.id).into_iter().chain([mgs]) {
            let mounts = ctx.cache().target_mounts(target.header.id);
            assert_eq!(mounts.len(), 1);
            assert_eq!(mounts[0].mount_point, "/mnt/testfs");
            assert!(mounts[0].primary);
            assert_eq!(target.header.state, "unformatted");
        }
        assert!(ctx.cache().volume_in_use(server.volume_ids[2]));
    }

    #[test]
    fn filesystem_rejects_bad_names_and_used_volumes() {
        let (_dir, ctx, server) = context(4);
        let mut request = CreateFilesystem {
            name: "much_too_long".to_string(),
            mgt: MgtSpec::New {
                volume_id: server.volume_ids[0],
            },
            mdts: vec![server.volume_ids[1]],
            osts: vec![server.volume_ids[2]],
        };
        assert!(filesystem_records(&ctx, &request).is_err());

        request.name = "fs-1".to_string();
        assert!(filesystem_records(&ctx, &request).is_err());

        request.name = "fs1".to_string();
        let (fs, writes) = filesystem_records(&ctx, &request).unwrap();
        commit(&ctx, writes);

        let reuse = CreateFilesystem {
            name: "fs2".to_string(),
            mgt: MgtSpec::Existing { mgs_id: fs.mgs_id },
            mdts: vec![server.volume_ids[1]],
            osts: vec![server.volume_ids[3]],
        };
        let err = filesystem_records(&ctx, &reuse).unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn conf_params_bump_the_mgs_version() {
        let (_dir, ctx, server) = context(3);
        let request = CreateFilesystem {
            name: "testfs".to_string(),
            mgt: MgtSpec::New {
                volume_id: server.volume_ids[0],
            },
            mdts: vec![server.volume_ids[1]],
            osts: vec![server.volume_ids[2]],
        };
        let (fs, writes) = filesystem_records(&ctx, &request).unwrap();
        commit(&ctx, writes);

        let updates = [
            ConfParamUpdate {
                scope: ConfParamScope::Filesystem {
                    filesystem_id: fs.header.id,
                },
                key: "llite.max_cached_mb".to_string(),
                value: Some("512".to_string()),
            },
            ConfParamUpdate {
                scope: ConfParamScope::FilesystemClient {
                    filesystem_id: fs.header.id,
                },
                key: "osc.max_dirty_mb".to_string(),
                value: None,
            },
        ];
        let (params, writes) = conf_param_records(&ctx, &updates).unwrap();
        commit(&ctx, writes);

        assert_eq!(params.iter().map(|p| p.version).collect::<Vec<_>>(), [1, 2]);
        let mgs = ctx.cache().target(fs.mgs_id).unwrap();
        assert_eq!(
            mgs.role,
            TargetRole::Mgs {
                conf_param_version: 2,
                conf_param_version_applied: 0,
            }
        );
    }
}
