//! Write-through, in-memory copy of the live entity model.
//!
//! Planning and dependency evaluation read entities from here rather than
//! from the store. Every scheduler write updates the cache after the store
//! commit succeeds, so the two never disagree about committed state.
//!
//! Conf params are not cached; they are only needed when applying them and
//! are read from the store on demand.

use std::collections::{BTreeMap, HashMap};

use lustre_manager_core::{ClassTag, EntityId, EntityRef};
use lustre_manager_store::{
    ClientMount, ConfParam, Copytool, Entity, Filesystem, Host, Store, Target, TargetMount,
    Volume, VolumeNode,
};
use parking_lot::RwLock;

use crate::error::Result;

/// Classes kept in the cache.
pub const CACHED_CLASSES: [ClassTag; 12] = [
    ClassTag::Host,
    ClassTag::LnetConfiguration,
    ClassTag::CorosyncConfiguration,
    ClassTag::PacemakerConfiguration,
    ClassTag::NtpConfiguration,
    ClassTag::Target,
    ClassTag::Filesystem,
    ClassTag::ClientMount,
    ClassTag::Copytool,
    ClassTag::TargetMount,
    ClassTag::Volume,
    ClassTag::VolumeNode,
];

/// Live entities, indexed by class then id.
#[derive(Debug, Default)]
pub struct ObjectCache {
    objects: RwLock<HashMap<ClassTag, BTreeMap<EntityId, Entity>>>,
}

impl ObjectCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate a cache with every live entity of the cached classes.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the store fails.
    pub fn seed(store: &dyn Store) -> Result<Self> {
        let cache = Self::new();
        for class in CACHED_CLASSES {
            for entity in store.list_entities(class)? {
                if entity.not_deleted() {
                    cache.add(entity);
                }
            }
        }
        Ok(cache)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Insert or replace an entity.
    pub fn add(&self, entity: Entity) {
        if !CACHED_CLASSES.contains(&entity.class()) {
            return;
        }
        self.objects
            .write()
            .entry(entity.class())
            .or_default()
            .insert(entity.id(), entity);
    }

    /// Apply a committed entity write; deleted entities are purged.
    pub fn update(&self, entity: Entity) {
        if entity.not_deleted() {
            self.add(entity);
        } else {
            self.purge(entity.entity_ref());
        }
    }

    /// Drop an entity.
    pub fn purge(&self, item: EntityRef) {
        if let Some(class) = self.objects.write().get_mut(&item.class) {
            class.remove(&item.id);
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Get a live entity.
    #[must_use]
    pub fn get(&self, item: EntityRef) -> Option<Entity> {
        self.objects
            .read()
            .get(&item.class)
            .and_then(|class| class.get(&item.id))
            .cloned()
    }

    /// Current state of a live stateful entity.
    #[must_use]
    pub fn state(&self, item: EntityRef) -> Option<String> {
        self.objects
            .read()
            .get(&item.class)
            .and_then(|class| class.get(&item.id))
            .and_then(|e| e.state().map(str::to_string))
    }

    /// Whether a live entity exists.
    #[must_use]
    pub fn contains(&self, item: EntityRef) -> bool {
        self.objects
            .read()
            .get(&item.class)
            .is_some_and(|class| class.contains_key(&item.id))
    }

    /// All live entities of a class, in id order.
    #[must_use]
    pub fn list(&self, class: ClassTag) -> Vec<Entity> {
        self.objects
            .read()
            .get(&class)
            .map(|class| class.values().cloned().collect())
            .unwrap_or_default()
    }

    fn filter<T>(&self, class: ClassTag, f: impl Fn(&Entity) -> Option<T>) -> Vec<T> {
        self.objects
            .read()
            .get(&class)
            .map(|class| class.values().filter_map(&f).collect())
            .unwrap_or_default()
    }

    fn find<T>(&self, class: ClassTag, f: impl Fn(&Entity) -> Option<T>) -> Option<T> {
        self.objects
            .read()
            .get(&class)
            .and_then(|class| class.values().find_map(f))
    }

    /// Get a live host.
    #[must_use]
    pub fn host(&self, id: EntityId) -> Option<Host> {
        self.get(EntityRef::new(ClassTag::Host, id))
            .and_then(|e| e.as_host().cloned())
    }

    /// Get a live target.
    #[must_use]
    pub fn target(&self, id: EntityId) -> Option<Target> {
        self.get(EntityRef::new(ClassTag::Target, id))
            .and_then(|e| e.as_target().cloned())
    }

    /// Get a live filesystem.
    #[must_use]
    pub fn filesystem(&self, id: EntityId) -> Option<Filesystem> {
        self.get(EntityRef::new(ClassTag::Filesystem, id))
            .and_then(|e| e.as_filesystem().cloned())
    }

    /// Get a live target mount.
    #[must_use]
    pub fn target_mount(&self, id: EntityId) -> Option<TargetMount> {
        self.get(EntityRef::new(ClassTag::TargetMount, id))
            .and_then(|e| e.as_target_mount().cloned())
    }

    /// Get a live volume node.
    #[must_use]
    pub fn volume_node(&self, id: EntityId) -> Option<VolumeNode> {
        self.get(EntityRef::new(ClassTag::VolumeNode, id))
            .and_then(|e| e.as_volume_node().cloned())
    }

    /// Get a live volume.
    #[must_use]
    pub fn volume(&self, id: EntityId) -> Option<Volume> {
        self.get(EntityRef::new(ClassTag::Volume, id))
            .and_then(|e| e.as_volume().cloned())
    }

    /// Get a live client mount.
    #[must_use]
    pub fn client_mount(&self, id: EntityId) -> Option<ClientMount> {
        self.get(EntityRef::new(ClassTag::ClientMount, id))
            .and_then(|e| e.as_client_mount().cloned())
    }

    /// Get a live copytool.
    #[must_use]
    pub fn copytool(&self, id: EntityId) -> Option<Copytool> {
        self.get(EntityRef::new(ClassTag::Copytool, id))
            .and_then(|e| e.as_copytool().cloned())
    }

    // =========================================================================
    // Derived Queries
    // =========================================================================

    /// The live host with this FQDN.
    #[must_use]
    pub fn host_by_fqdn(&self, fqdn: &str) -> Option<Host> {
        self.find(ClassTag::Host, |e| {
            e.as_host().filter(|h| h.fqdn == fqdn).cloned()
        })
    }

    /// The configuration of `class` owned by a host.
    #[must_use]
    pub fn host_config(&self, host_id: EntityId, class: ClassTag) -> Option<EntityRef> {
        self.find(class, |e| {
            let owner = match e {
                Entity::LnetConfiguration(c) => c.host_id,
                Entity::CorosyncConfiguration(c) => c.host_id,
                Entity::PacemakerConfiguration(c) => c.host_id,
                Entity::NtpConfiguration(c) => c.host_id,
                _ => return None,
            };
            (owner == host_id).then(|| e.entity_ref())
        })
    }

    /// Every configuration owned by a host.
    #[must_use]
    pub fn host_configs(&self, host_id: EntityId) -> Vec<EntityRef> {
        [
            ClassTag::NtpConfiguration,
            ClassTag::CorosyncConfiguration,
            ClassTag::PacemakerConfiguration,
            ClassTag::LnetConfiguration,
        ]
        .into_iter()
        .filter_map(|class| self.host_config(host_id, class))
        .collect()
    }

    /// MDTs and OSTs of a filesystem, MDTs first, each in index order.
    #[must_use]
    pub fn fs_targets(&self, filesystem_id: EntityId) -> Vec<Target> {
        let mut targets = self.filter(ClassTag::Target, |e| {
            e.as_target()
                .filter(|t| t.role.filesystem_id() == Some(filesystem_id))
                .cloned()
        });
        targets.sort_by_key(|t| match t.role {
            lustre_manager_store::TargetRole::Mdt { index, .. } => (0, index),
            lustre_manager_store::TargetRole::Ost { index, .. } => (1, index),
            lustre_manager_store::TargetRole::Mgs { .. } => (2, 0),
        });
        targets
    }

    /// Live mounts of a target, primary first.
    #[must_use]
    pub fn target_mounts(&self, target_id: EntityId) -> Vec<TargetMount> {
        let mut mounts = self.filter(ClassTag::TargetMount, |e| {
            e.as_target_mount()
                .filter(|m| m.target_id == target_id)
                .cloned()
        });
        mounts.sort_by_key(|m| (!m.primary, m.id));
        mounts
    }

    /// Live target mounts on a host.
    #[must_use]
    pub fn host_target_mounts(&self, host_id: EntityId) -> Vec<TargetMount> {
        self.filter(ClassTag::TargetMount, |e| {
            e.as_target_mount().filter(|m| m.host_id == host_id).cloned()
        })
    }

    /// Targets that can be mounted on a host.
    #[must_use]
    pub fn host_targets(&self, host_id: EntityId) -> Vec<Target> {
        let mut ids: Vec<EntityId> = self
            .host_target_mounts(host_id)
            .into_iter()
            .map(|m| m.target_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids.into_iter().filter_map(|id| self.target(id)).collect()
    }

    /// Host of the target's primary mount.
    #[must_use]
    pub fn target_primary_host(&self, target_id: EntityId) -> Option<Host> {
        self.target_mounts(target_id)
            .into_iter()
            .find(|m| m.primary)
            .and_then(|m| self.host(m.host_id))
    }

    /// Host currently serving the target, if it is mounted somewhere.
    #[must_use]
    pub fn target_active_host(&self, target_id: EntityId) -> Option<Host> {
        self.target(target_id)
            .and_then(|t| t.active_mount_id)
            .and_then(|id| self.target_mount(id))
            .and_then(|m| self.host(m.host_id))
    }

    /// Filesystems served by an MGS.
    #[must_use]
    pub fn mgs_filesystems(&self, mgs_id: EntityId) -> Vec<Filesystem> {
        self.filter(ClassTag::Filesystem, |e| {
            e.as_filesystem().filter(|f| f.mgs_id == mgs_id).cloned()
        })
    }

    /// Client mounts of a filesystem.
    #[must_use]
    pub fn fs_client_mounts(&self, filesystem_id: EntityId) -> Vec<ClientMount> {
        self.filter(ClassTag::ClientMount, |e| {
            e.as_client_mount()
                .filter(|c| c.filesystem_id == filesystem_id)
                .cloned()
        })
    }

    /// Client mounts on a host.
    #[must_use]
    pub fn host_client_mounts(&self, host_id: EntityId) -> Vec<ClientMount> {
        self.filter(ClassTag::ClientMount, |e| {
            e.as_client_mount()
                .filter(|c| c.host_id == host_id)
                .cloned()
        })
    }

    /// Copytools attached to a client mount.
    #[must_use]
    pub fn client_mount_copytools(&self, client_mount_id: EntityId) -> Vec<Copytool> {
        self.filter(ClassTag::Copytool, |e| {
            e.as_copytool()
                .filter(|c| c.client_mount_id == Some(client_mount_id))
                .cloned()
        })
    }

    /// Copytools running on a host.
    #[must_use]
    pub fn host_copytools(&self, host_id: EntityId) -> Vec<Copytool> {
        self.filter(ClassTag::Copytool, |e| {
            e.as_copytool().filter(|c| c.host_id == host_id).cloned()
        })
    }

    /// Volume nodes on a host.
    #[must_use]
    pub fn host_volume_nodes(&self, host_id: EntityId) -> Vec<VolumeNode> {
        self.filter(ClassTag::VolumeNode, |e| {
            e.as_volume_node().filter(|n| n.host_id == host_id).cloned()
        })
    }

    /// Volume nodes of a volume, primary first.
    #[must_use]
    pub fn volume_nodes(&self, volume_id: EntityId) -> Vec<VolumeNode> {
        let mut nodes = self.filter(ClassTag::VolumeNode, |e| {
            e.as_volume_node()
                .filter(|n| n.volume_id == volume_id)
                .cloned()
        });
        nodes.sort_by_key(|n| (!n.primary, n.id));
        nodes
    }

    /// The live volume node with this path on a host.
    #[must_use]
    pub fn volume_node_by_path(&self, host_id: EntityId, path: &str) -> Option<VolumeNode> {
        self.find(ClassTag::VolumeNode, |e| {
            e.as_volume_node()
                .filter(|n| n.host_id == host_id && n.path == path)
                .cloned()
        })
    }

    /// Whether a volume backs any live target.
    #[must_use]
    pub fn volume_in_use(&self, volume_id: EntityId) -> bool {
        self.find(ClassTag::Target, |e| {
            e.as_target().filter(|t| t.volume_id == volume_id).map(|_| ())
        })
        .is_some()
    }

    /// The live filesystem with this name.
    #[must_use]
    pub fn filesystem_by_name(&self, name: &str) -> Option<Filesystem> {
        self.find(ClassTag::Filesystem, |e| {
            e.as_filesystem().filter(|f| f.name == name).cloned()
        })
    }

    /// Conf params of an MGS newer than `after_version`, in version order.
    ///
    /// Read from the store, as conf params are not cached.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the store fails.
    pub fn conf_params_after(
        store: &dyn Store,
        mgs_id: EntityId,
        after_version: u64,
    ) -> Result<Vec<ConfParam>> {
        let mut params: Vec<ConfParam> = store
            .list_entities(ClassTag::ConfParam)?
            .into_iter()
            .filter_map(|e| match e {
                Entity::ConfParam(p) if p.mgs_id == mgs_id && p.version > after_version => {
                    Some(p)
                }
                _ => None,
            })
            .collect();
        params.sort_by_key(|p| (p.version, p.id));
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::fixtures;
    use lustre_manager_store::RocksStore;
    use tempfile::TempDir;

    #[test]
    fn seed_skips_deleted_entities() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        let live = fixtures::host(1, "h1.example.com", "managed");
        let mut gone = fixtures::host(2, "h2.example.com", "removed");
        gone.header.not_deleted = false;
        store.put_entity(&live.clone().into()).unwrap();
        store.put_entity(&gone.into()).unwrap();

        let cache = ObjectCache::seed(&store).unwrap();
        assert_eq!(cache.list(ClassTag::Host).len(), 1);
        assert_eq!(cache.host_by_fqdn("h1.example.com").unwrap().header.id, live.header.id);
        assert!(cache.host_by_fqdn("h2.example.com").is_none());
    }

    #[test]
    fn update_purges_deleted() {
        let cache = ObjectCache::new();
        let mut host = fixtures::host(1, "h1.example.com", "managed");
        cache.add(host.clone().into());
        let item = EntityRef::new(ClassTag::Host, EntityId::new(1));
        assert_eq!(cache.state(item).as_deref(), Some("managed"));

        host.header.set_state("removed", chrono::Utc::now());
        cache.update(host.into());
        assert!(!cache.contains(item));
    }

    #[test]
    fn derived_queries() {
        let cache = ObjectCache::new();
        let layout = fixtures::single_server_filesystem(&cache);

        let targets = cache.fs_targets(layout.filesystem_id);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].header.id, layout.mdt_id);
        assert_eq!(targets[1].header.id, layout.ost_id);
        assert_eq!(cache.host_targets(layout.host_id).len(), 3);
        assert_eq!(
            cache.target_primary_host(layout.mgs_id).unwrap().header.id,
            layout.host_id
        );
        assert!(cache.target_active_host(layout.mgs_id).is_none());
        assert_eq!(cache.mgs_filesystems(layout.mgs_id).len(), 1);
        assert_eq!(cache.host_configs(layout.host_id).len(), 4);
        assert!(cache
            .host_config(layout.host_id, ClassTag::LnetConfiguration)
            .is_some());
    }
}
