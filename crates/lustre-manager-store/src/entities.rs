//! The entity model.
//!
//! Stateful entities share a [`StatefulHeader`]; polymorphic targets are a
//! tagged [`TargetRole`] rather than a class hierarchy. Relationships are
//! stored as ids on the owning side only (a configuration knows its host, a
//! host does not own its configurations); the object cache resolves the
//! reverse direction.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use serde::{Deserialize, Serialize};

/// Terminal state: destroyed with remote teardown.
pub const STATE_REMOVED: &str = "removed";

/// Terminal state: disowned without remote teardown.
pub const STATE_FORGOTTEN: &str = "forgotten";

/// Whether `state` is one of the terminal deletion states.
#[must_use]
pub fn is_terminal_state(state: &str) -> bool {
    state == STATE_REMOVED || state == STATE_FORGOTTEN
}

/// Fields shared by every scheduler-managed entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatefulHeader {
    /// Entity id within its class.
    pub id: EntityId,
    /// Current state, drawn from the class's declared state set.
    pub state: String,
    /// When `state` last changed. Advances monotonically.
    pub state_modified_at: DateTime<Utc>,
    /// When true, only decommissioning transitions are permitted.
    pub immutable_state: bool,
    /// Soft-delete flag; false once the entity reaches a terminal state.
    pub not_deleted: bool,
}

impl StatefulHeader {
    /// A live header in `initial_state`.
    #[must_use]
    pub fn new(id: EntityId, initial_state: &str) -> Self {
        Self {
            id,
            state: initial_state.to_string(),
            state_modified_at: Utc::now(),
            immutable_state: false,
            not_deleted: true,
        }
    }

    /// Move to `state`, stamping the modification time.
    ///
    /// The stamp never moves backwards even if the clock does. Entering a
    /// terminal state clears `not_deleted`.
    pub fn set_state(&mut self, state: &str, at: DateTime<Utc>) {
        self.state = state.to_string();
        self.state_modified_at = at.max(self.state_modified_at);
        if is_terminal_state(state) {
            self.not_deleted = false;
        }
    }
}

/// The role a host was provisioned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServerProfile {
    /// A Lustre server under full management (HA, targets).
    #[default]
    Managed,
    /// A server whose state is only observed.
    Monitored,
    /// A client/worker node.
    Worker,
}

impl ServerProfile {
    /// The host state reached once setup completes.
    #[must_use]
    pub const fn setup_state(self) -> &'static str {
        match self {
            Self::Managed => "managed",
            Self::Monitored => "monitored",
            Self::Worker => "working",
        }
    }

    /// Packages installed for this profile.
    #[must_use]
    pub const fn packages(self) -> &'static [&'static str] {
        match self {
            Self::Managed => &["lustre", "lustre-modules", "corosync", "pacemaker", "chrony"],
            Self::Monitored => &["lustre", "lustre-modules"],
            Self::Worker => &["lustre-client"],
        }
    }
}

/// A managed server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Common header.
    pub header: StatefulHeader,
    /// Fully qualified domain name; unique among live hosts.
    pub fqdn: String,
    /// Address used to reach the host for deployment.
    pub address: String,
    /// Short node name as reported by the host.
    pub nodename: String,
    /// Provisioning profile.
    pub server_profile: ServerProfile,
    /// Last boot time reported by the agent.
    pub boot_time: Option<DateTime<Utc>>,
    /// How the agent gets installed (`existing_keys`, `root_password`, ...).
    pub install_method: String,
    /// Free-form properties reported by the agent.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Hosts sharing an HA cluster with this one.
    #[serde(default)]
    pub ha_cluster_peers: Vec<EntityId>,
}

/// LNet configuration of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnetConfiguration {
    /// Common header.
    pub header: StatefulHeader,
    /// Owning host.
    pub host_id: EntityId,
    /// NIDs last reported, e.g. `192.168.0.1@tcp0`.
    #[serde(default)]
    pub nids: Vec<String>,
}

/// Corosync configuration of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorosyncConfiguration {
    /// Common header.
    pub header: StatefulHeader,
    /// Owning host.
    pub host_id: EntityId,
    /// Multicast port used by the ring.
    pub mcast_port: Option<u16>,
    /// Whether corosync last reported itself up.
    #[serde(default)]
    pub corosync_reported_up: bool,
}

/// Pacemaker configuration of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacemakerConfiguration {
    /// Common header.
    pub header: StatefulHeader,
    /// Owning host.
    pub host_id: EntityId,
}

/// NTP configuration of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NtpConfiguration {
    /// Common header.
    pub header: StatefulHeader,
    /// Owning host.
    pub host_id: EntityId,
    /// Server the host synchronizes against.
    pub server: Option<String>,
}

/// Variant-specific target fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetRole {
    /// Management server.
    Mgs {
        /// Highest conf param version written against this MGS.
        conf_param_version: u64,
        /// Highest conf param version applied to the MGS.
        conf_param_version_applied: u64,
    },
    /// Metadata target.
    Mdt {
        /// Owning filesystem.
        filesystem_id: EntityId,
        /// Dense index within the filesystem.
        index: u32,
    },
    /// Object storage target.
    Ost {
        /// Owning filesystem.
        filesystem_id: EntityId,
        /// Dense index within the filesystem.
        index: u32,
    },
}

impl TargetRole {
    /// Filesystem the target belongs to; `None` for an MGS.
    #[must_use]
    pub const fn filesystem_id(&self) -> Option<EntityId> {
        match self {
            Self::Mgs { .. } => None,
            Self::Mdt { filesystem_id, .. } | Self::Ost { filesystem_id, .. } => {
                Some(*filesystem_id)
            }
        }
    }

    /// Short role name used in labels and mkfs arguments.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Mgs { .. } => "mgs",
            Self::Mdt { .. } => "mdt",
            Self::Ost { .. } => "ost",
        }
    }
}

/// A Lustre target on a block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Common header.
    pub header: StatefulHeader,
    /// Lustre name, e.g. `testfs-OST0000`; assigned at registration.
    pub name: String,
    /// Filesystem UUID reported by mkfs.
    pub uuid: Option<String>,
    /// Cluster-manager resource name.
    pub ha_label: String,
    /// Backing volume.
    pub volume_id: EntityId,
    /// Mount currently serving the target, if any.
    pub active_mount_id: Option<EntityId>,
    /// Format even if the device already holds a filesystem.
    pub reformat: bool,
    /// Inode size reported by mkfs.
    pub inode_size: Option<u32>,
    /// Variant-specific fields.
    pub role: TargetRole,
}

/// Association of a target with a host that can mount it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMount {
    /// Record id.
    pub id: EntityId,
    /// Mounted target.
    pub target_id: EntityId,
    /// Host that can mount it.
    pub host_id: EntityId,
    /// Device as seen from that host.
    pub volume_node_id: EntityId,
    /// Mount point on the host.
    pub mount_point: Option<String>,
    /// Whether this is the target's primary mount.
    pub primary: bool,
    /// Soft-delete flag.
    pub not_deleted: bool,
}

/// A block device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Record id.
    pub id: EntityId,
    /// Human readable label.
    pub label: String,
    /// Size in bytes.
    pub size: Option<u64>,
    /// Filesystem type found on the device.
    pub filesystem_type: Option<String>,
    /// Soft-delete flag.
    pub not_deleted: bool,
}

/// The per-host view of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeNode {
    /// Record id.
    pub id: EntityId,
    /// Volume this node exposes.
    pub volume_id: EntityId,
    /// Host the path is valid on.
    pub host_id: EntityId,
    /// Device path; `(host, path)` is unique among live nodes.
    pub path: String,
    /// Preferred node for the volume.
    pub primary: bool,
    /// Whether the node may be used for target mounts.
    #[serde(rename = "use")]
    pub use_for_mounts: bool,
    /// Soft-delete flag.
    pub not_deleted: bool,
}

/// A Lustre filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    /// Common header.
    pub header: StatefulHeader,
    /// Filesystem name, at most eight characters.
    pub name: String,
    /// Management server.
    pub mgs_id: EntityId,
    /// Next MDT index to hand out.
    pub mdt_next_index: u32,
    /// Next OST index to hand out.
    pub ost_next_index: u32,
}

/// Where a conf param applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ConfParamScope {
    /// Filesystem-wide server tunable.
    Filesystem {
        /// Target filesystem.
        filesystem_id: EntityId,
    },
    /// Filesystem-wide client tunable.
    FilesystemClient {
        /// Target filesystem.
        filesystem_id: EntityId,
    },
    /// Tunable of one MDT.
    Mdt {
        /// Target MDT.
        target_id: EntityId,
    },
    /// Tunable of one OST.
    Ost {
        /// Target OST.
        target_id: EntityId,
    },
}

/// A versioned Lustre tunable set through the MGS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfParam {
    /// Record id.
    pub id: EntityId,
    /// MGS holding the parameter.
    pub mgs_id: EntityId,
    /// Where the parameter applies.
    pub scope: ConfParamScope,
    /// Parameter key, e.g. `llite.max_cached_mb`.
    pub key: String,
    /// New value; `None` deletes the parameter.
    pub value: Option<String>,
    /// MGS-wide monotone version.
    pub version: u64,
}

/// A filesystem mounted on a client host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMount {
    /// Common header.
    pub header: StatefulHeader,
    /// Client host.
    pub host_id: EntityId,
    /// Mounted filesystem.
    pub filesystem_id: EntityId,
    /// Mount point on the client.
    pub mountpoint: String,
}

/// An HSM copytool attached to a client mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Copytool {
    /// Common header.
    pub header: StatefulHeader,
    /// Host running the copytool.
    pub host_id: EntityId,
    /// Client mount the copytool serves.
    pub client_mount_id: Option<EntityId>,
    /// Copytool binary.
    pub bin_path: String,
    /// HSM archive number.
    pub archive: u32,
    /// UUID reported by the copytool once registered.
    pub uuid: Option<String>,
}

/// Any persisted entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class_tag", rename_all = "snake_case")]
pub enum Entity {
    /// See [`Host`].
    Host(Host),
    /// See [`LnetConfiguration`].
    LnetConfiguration(LnetConfiguration),
    /// See [`CorosyncConfiguration`].
    CorosyncConfiguration(CorosyncConfiguration),
    /// See [`PacemakerConfiguration`].
    PacemakerConfiguration(PacemakerConfiguration),
    /// See [`NtpConfiguration`].
    NtpConfiguration(NtpConfiguration),
    /// See [`Target`].
    Target(Target),
    /// See [`Filesystem`].
    Filesystem(Filesystem),
    /// See [`ClientMount`].
    ClientMount(ClientMount),
    /// See [`Copytool`].
    Copytool(Copytool),
    /// See [`TargetMount`].
    TargetMount(TargetMount),
    /// See [`Volume`].
    Volume(Volume),
    /// See [`VolumeNode`].
    VolumeNode(VolumeNode),
    /// See [`ConfParam`].
    ConfParam(ConfParam),
}

macro_rules! entity_accessors {
    ($($variant:ident => $as_ref:ident, $as_mut:ident;)*) => {
        impl Entity {
            $(
                #[doc = concat!("Borrow as a [`", stringify!($variant), "`].")]
                #[must_use]
                pub const fn $as_ref(&self) -> Option<&$variant> {
                    match self {
                        Self::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }

                #[doc = concat!("Mutably borrow as a [`", stringify!($variant), "`].")]
                pub fn $as_mut(&mut self) -> Option<&mut $variant> {
                    match self {
                        Self::$variant(inner) => Some(inner),
                        _ => None,
                    }
                }
            )*
        }

        $(
            impl From<$variant> for Entity {
                fn from(inner: $variant) -> Self {
                    Self::$variant(inner)
                }
            }
        )*
    };
}

entity_accessors! {
    Host => as_host, as_host_mut;
    LnetConfiguration => as_lnet, as_lnet_mut;
    CorosyncConfiguration => as_corosync, as_corosync_mut;
    PacemakerConfiguration => as_pacemaker, as_pacemaker_mut;
    NtpConfiguration => as_ntp, as_ntp_mut;
    Target => as_target, as_target_mut;
    Filesystem => as_filesystem, as_filesystem_mut;
    ClientMount => as_client_mount, as_client_mount_mut;
    Copytool => as_copytool, as_copytool_mut;
    TargetMount => as_target_mount, as_target_mount_mut;
    Volume => as_volume, as_volume_mut;
    VolumeNode => as_volume_node, as_volume_node_mut;
    ConfParam => as_conf_param, as_conf_param_mut;
}

impl Entity {
    /// Class of the entity.
    #[must_use]
    pub const fn class(&self) -> ClassTag {
        match self {
            Self::Host(_) => ClassTag::Host,
            Self::LnetConfiguration(_) => ClassTag::LnetConfiguration,
            Self::CorosyncConfiguration(_) => ClassTag::CorosyncConfiguration,
            Self::PacemakerConfiguration(_) => ClassTag::PacemakerConfiguration,
            Self::NtpConfiguration(_) => ClassTag::NtpConfiguration,
            Self::Target(_) => ClassTag::Target,
            Self::Filesystem(_) => ClassTag::Filesystem,
            Self::ClientMount(_) => ClassTag::ClientMount,
            Self::Copytool(_) => ClassTag::Copytool,
            Self::TargetMount(_) => ClassTag::TargetMount,
            Self::Volume(_) => ClassTag::Volume,
            Self::VolumeNode(_) => ClassTag::VolumeNode,
            Self::ConfParam(_) => ClassTag::ConfParam,
        }
    }

    /// Stateful header, for scheduler-managed classes.
    #[must_use]
    pub const fn header(&self) -> Option<&StatefulHeader> {
        match self {
            Self::Host(e) => Some(&e.header),
            Self::LnetConfiguration(e) => Some(&e.header),
            Self::CorosyncConfiguration(e) => Some(&e.header),
            Self::PacemakerConfiguration(e) => Some(&e.header),
            Self::NtpConfiguration(e) => Some(&e.header),
            Self::Target(e) => Some(&e.header),
            Self::Filesystem(e) => Some(&e.header),
            Self::ClientMount(e) => Some(&e.header),
            Self::Copytool(e) => Some(&e.header),
            Self::TargetMount(_) | Self::Volume(_) | Self::VolumeNode(_) | Self::ConfParam(_) => {
                None
            }
        }
    }

    /// Mutable stateful header.
    pub fn header_mut(&mut self) -> Option<&mut StatefulHeader> {
        match self {
            Self::Host(e) => Some(&mut e.header),
            Self::LnetConfiguration(e) => Some(&mut e.header),
            Self::CorosyncConfiguration(e) => Some(&mut e.header),
            Self::PacemakerConfiguration(e) => Some(&mut e.header),
            Self::NtpConfiguration(e) => Some(&mut e.header),
            Self::Target(e) => Some(&mut e.header),
            Self::Filesystem(e) => Some(&mut e.header),
            Self::ClientMount(e) => Some(&mut e.header),
            Self::Copytool(e) => Some(&mut e.header),
            Self::TargetMount(_) | Self::Volume(_) | Self::VolumeNode(_) | Self::ConfParam(_) => {
                None
            }
        }
    }

    /// Entity id within its class.
    #[must_use]
    pub fn id(&self) -> EntityId {
        match self {
            Self::TargetMount(e) => e.id,
            Self::Volume(e) => e.id,
            Self::VolumeNode(e) => e.id,
            Self::ConfParam(e) => e.id,
            other => other.header().map_or(EntityId::new(0), |h| h.id),
        }
    }

    /// `(class_tag, id)` reference.
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.class(), self.id())
    }

    /// Current state of a stateful entity.
    #[must_use]
    pub fn state(&self) -> Option<&str> {
        self.header().map(|h| h.state.as_str())
    }

    /// Whether the entity is live.
    #[must_use]
    pub const fn not_deleted(&self) -> bool {
        match self {
            Self::TargetMount(e) => e.not_deleted,
            Self::Volume(e) => e.not_deleted,
            Self::VolumeNode(e) => e.not_deleted,
            Self::ConfParam(_) => true,
            other => match other.header() {
                Some(h) => h.not_deleted,
                None => true,
            },
        }
    }

    /// Mark the entity deleted without touching its state.
    pub fn mark_deleted(&mut self) {
        match self {
            Self::TargetMount(e) => e.not_deleted = false,
            Self::Volume(e) => e.not_deleted = false,
            Self::VolumeNode(e) => e.not_deleted = false,
            Self::ConfParam(_) => {}
            other => {
                if let Some(h) = other.header_mut() {
                    h.not_deleted = false;
                }
            }
        }
    }

    /// Human readable label used in job descriptions.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Host(h) => h.fqdn.clone(),
            Self::LnetConfiguration(e) => format!("LNet configuration of host {}", e.host_id),
            Self::CorosyncConfiguration(e) => {
                format!("Corosync configuration of host {}", e.host_id)
            }
            Self::PacemakerConfiguration(e) => {
                format!("Pacemaker configuration of host {}", e.host_id)
            }
            Self::NtpConfiguration(e) => format!("NTP configuration of host {}", e.host_id),
            Self::Target(t) if !t.name.is_empty() => t.name.clone(),
            Self::Target(t) => t.ha_label.clone(),
            Self::Filesystem(f) => f.name.clone(),
            Self::ClientMount(c) => c.mountpoint.clone(),
            Self::Copytool(c) => format!("{}-{}", c.bin_path, c.archive),
            Self::TargetMount(m) => format!("mount of target {} on host {}", m.target_id, m.host_id),
            Self::Volume(v) => v.label.clone(),
            Self::VolumeNode(n) => n.path.clone(),
            Self::ConfParam(p) => p.key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: u64) -> Host {
        Host {
            header: StatefulHeader::new(EntityId::new(id), "undeployed"),
            fqdn: "h1.example.com".to_string(),
            address: "10.0.0.1".to_string(),
            nodename: "h1".to_string(),
            server_profile: ServerProfile::Managed,
            boot_time: None,
            install_method: "existing_keys".to_string(),
            properties: BTreeMap::new(),
            ha_cluster_peers: Vec::new(),
        }
    }

    #[test]
    fn terminal_state_clears_not_deleted() {
        let mut header = StatefulHeader::new(EntityId::new(1), "managed");
        header.set_state("removed", Utc::now());
        assert!(!header.not_deleted);
        assert_eq!(header.state, "removed");
    }

    #[test]
    fn state_modified_at_is_monotonic() {
        let mut header = StatefulHeader::new(EntityId::new(1), "a");
        let before = header.state_modified_at;
        header.set_state("b", before - chrono::Duration::seconds(60));
        assert_eq!(header.state_modified_at, before);
    }

    #[test]
    fn entity_accessors() {
        let entity = Entity::from(host(5));
        assert_eq!(entity.class(), ClassTag::Host);
        assert_eq!(entity.id(), EntityId::new(5));
        assert_eq!(entity.state(), Some("undeployed"));
        assert!(entity.as_host().is_some());
        assert!(entity.as_target().is_none());
        assert_eq!(entity.label(), "h1.example.com");
    }

    #[test]
    fn associations_have_no_state() {
        let mount = Entity::TargetMount(TargetMount {
            id: EntityId::new(3),
            target_id: EntityId::new(1),
            host_id: EntityId::new(2),
            volume_node_id: EntityId::new(4),
            mount_point: None,
            primary: true,
            not_deleted: true,
        });
        assert_eq!(mount.state(), None);
        assert_eq!(mount.entity_ref().to_string(), "target_mount:3");
    }

    #[test]
    fn mark_deleted_keeps_state() {
        let mut entity = Entity::from(host(1));
        entity.mark_deleted();
        assert!(!entity.not_deleted());
        assert_eq!(entity.state(), Some("undeployed"));
    }

    #[test]
    fn target_role_filesystem() {
        let mgs = TargetRole::Mgs {
            conf_param_version: 0,
            conf_param_version_applied: 0,
        };
        assert_eq!(mgs.filesystem_id(), None);
        let ost = TargetRole::Ost {
            filesystem_id: EntityId::new(9),
            index: 0,
        };
        assert_eq!(ost.filesystem_id(), Some(EntityId::new(9)));
        assert_eq!(ost.kind(), "ost");
    }
}
