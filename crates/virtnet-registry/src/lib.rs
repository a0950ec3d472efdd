//! The network object registry (spec §5/§C2): one `Arc<Mutex<NetworkObject>>`
//! per admitted network, reachable through a coarse structural lock that
//! guards the name/uuid/bridge indices, plus a hand-off lookup that returns
//! the object already locked so callers never re-acquire the structural
//! lock to reach it.

use std::collections::HashMap;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex, RwLock};
use uuid::Uuid;
use virtnet_model::{NetworkDef, NetworkError};

/// The mutable, per-network state guarded by the object's own mutex.
#[derive(Debug, Clone)]
pub struct NetworkObject {
    pub live_def: NetworkDef,
    /// Set by `redefine` while `active`; published into `live_def` on the
    /// next `stop` (spec §5's ordering guarantee).
    pub pending_def: Option<NetworkDef>,
    pub active: bool,
    pub autostart: bool,
    pub dhcp_pid: Option<i32>,
}

impl NetworkObject {
    fn new(def: NetworkDef) -> Self {
        Self {
            live_def: def,
            pending_def: None,
            active: false,
            autostart: false,
            dhcp_pid: None,
        }
    }
}

/// A network object locked for the caller's exclusive use, obtained without
/// a second trip through the registry's structural lock.
pub type LockedObject = ArcMutexGuard<RawMutex, NetworkObject>;

#[derive(Debug, Clone)]
struct Meta {
    name: String,
    bridge_name: Option<String>,
}

struct Inner {
    objects: HashMap<Uuid, std::sync::Arc<Mutex<NetworkObject>>>,
    meta: HashMap<Uuid, Meta>,
    name_to_uuid: HashMap<String, Uuid>,
    bridge_to_uuid: HashMap<String, Uuid>,
}

impl Inner {
    fn new() -> Self {
        Self {
            objects: HashMap::new(),
            meta: HashMap::new(),
            name_to_uuid: HashMap::new(),
            bridge_to_uuid: HashMap::new(),
        }
    }
}

pub struct Registry {
    inner: RwLock<Inner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    /// If `def.name` already names an object, redefines it in place (spec
    /// §4.2): overwrites `live_def` when inactive, else queues `def` into
    /// `pending_def` to take effect on the next `stop`. Otherwise admits
    /// `def` as a brand-new object. Fails with `UuidConflict` if `def.uuid`
    /// is already taken by a differently-named object, or `BridgeInUse` if
    /// its bridge name belongs to a different network (spec §8 invariants
    /// 1-3).
    pub fn assign(&self, mut def: NetworkDef) -> Result<Uuid, NetworkError> {
        let mut inner = self.inner.write();
        if let Some(&uuid) = inner.name_to_uuid.get(&def.name) {
            if let Some(bridge) = &def.bridge_name {
                if let Some(owner) = inner.bridge_to_uuid.get(bridge) {
                    if *owner != uuid {
                        let other_network = inner.meta.get(owner).map(|m| m.name.clone()).unwrap_or_default();
                        return Err(NetworkError::BridgeInUse {
                            bridge: bridge.clone(),
                            other_network,
                        });
                    }
                }
            }
            // Redefinition preserves the object's identity regardless of
            // what `def.uuid` carries in from the caller.
            def.uuid = uuid;
            let arc = inner.objects.get(&uuid).cloned().expect("name index without a backing object");
            let old_bridge = inner.meta.get(&uuid).and_then(|m| m.bridge_name.clone());
            if old_bridge.as_deref() != def.bridge_name.as_deref() {
                if let Some(old) = &old_bridge {
                    inner.bridge_to_uuid.remove(old);
                }
                if let Some(bridge) = &def.bridge_name {
                    inner.bridge_to_uuid.insert(bridge.clone(), uuid);
                }
            }
            if let Some(meta) = inner.meta.get_mut(&uuid) {
                meta.bridge_name = def.bridge_name.clone();
            }
            drop(inner);
            let mut locked = arc.lock();
            if locked.active {
                locked.pending_def = Some(def);
            } else {
                locked.live_def = def;
            }
            return Ok(uuid);
        }
        if inner.meta.contains_key(&def.uuid) {
            let existing_name = inner.meta.get(&def.uuid).map(|m| m.name.clone()).unwrap_or_default();
            return Err(NetworkError::UuidConflict {
                uuid: def.uuid,
                existing_name,
            });
        }
        if let Some(bridge) = &def.bridge_name {
            if let Some(owner) = inner.bridge_to_uuid.get(bridge) {
                let other_network = inner.meta.get(owner).map(|m| m.name.clone()).unwrap_or_default();
                return Err(NetworkError::BridgeInUse {
                    bridge: bridge.clone(),
                    other_network,
                });
            }
        }

        let uuid = def.uuid;
        let meta = Meta {
            name: def.name.clone(),
            bridge_name: def.bridge_name.clone(),
        };
        inner.name_to_uuid.insert(def.name.clone(), uuid);
        if let Some(bridge) = &def.bridge_name {
            inner.bridge_to_uuid.insert(bridge.clone(), uuid);
        }
        inner.meta.insert(uuid, meta);
        inner.objects.insert(uuid, std::sync::Arc::new(Mutex::new(NetworkObject::new(def))));
        Ok(uuid)
    }

    /// True if `name` or `uuid` is already held by some object other than
    /// `uuid` itself — the pre-check `define` runs before building a new
    /// definition, mirrored by `assign`'s own atomic check.
    pub fn is_duplicate(&self, name: &str, uuid: Uuid) -> bool {
        let inner = self.inner.read();
        let name_taken_elsewhere = inner.name_to_uuid.get(name).is_some_and(|owner| *owner != uuid);
        let uuid_registered_under_other_name =
            inner.meta.get(&uuid).is_some_and(|meta| meta.name != name);
        name_taken_elsewhere || uuid_registered_under_other_name
    }

    /// `Some(other_network)` if `bridge` is already owned by a network other
    /// than `excluding`.
    pub fn bridge_in_use(&self, bridge: &str, excluding: Option<Uuid>) -> Option<String> {
        let inner = self.inner.read();
        let owner = *inner.bridge_to_uuid.get(bridge)?;
        if Some(owner) == excluding {
            return None;
        }
        inner.meta.get(&owner).map(|m| m.name.clone())
    }

    pub fn lock_by_uuid(&self, uuid: Uuid) -> Option<LockedObject> {
        let inner = self.inner.read();
        let arc = inner.objects.get(&uuid)?.clone();
        drop(inner);
        Some(arc.lock_arc())
    }

    pub fn lock_by_name(&self, name: &str) -> Option<LockedObject> {
        let inner = self.inner.read();
        let uuid = *inner.name_to_uuid.get(name)?;
        let arc = inner.objects.get(&uuid)?.clone();
        drop(inner);
        Some(arc.lock_arc())
    }

    pub fn uuid_for_name(&self, name: &str) -> Option<Uuid> {
        self.inner.read().name_to_uuid.get(name).copied()
    }

    /// Removes `uuid` from the registry. Callers must hold the object's own
    /// lock across the `active` check and this call to avoid a start racing
    /// in between (spec §5's start/stop mutual exclusion).
    pub fn remove_inactive(&self, uuid: Uuid, locked: &NetworkObject) -> Result<(), NetworkError> {
        if locked.active {
            return Err(NetworkError::StillActive {
                name: locked.live_def.name.clone(),
            });
        }
        let mut inner = self.inner.write();
        if let Some(meta) = inner.meta.remove(&uuid) {
            inner.name_to_uuid.remove(&meta.name);
            if let Some(bridge) = &meta.bridge_name {
                inner.bridge_to_uuid.remove(bridge);
            }
        }
        inner.objects.remove(&uuid);
        Ok(())
    }

    /// Updates the registry's denormalized name/bridge indices after a
    /// caller mutates `live_def.name`/`bridge_name` under its own object
    /// lock (used by the lifecycle engine when a `pending_def` is published).
    pub fn resync_meta(&self, uuid: Uuid, name: &str, bridge_name: Option<&str>) {
        let mut inner = self.inner.write();
        if let Some(meta) = inner.meta.get(&uuid).cloned() {
            inner.name_to_uuid.remove(&meta.name);
            if let Some(old_bridge) = &meta.bridge_name {
                inner.bridge_to_uuid.remove(old_bridge);
            }
        }
        inner.name_to_uuid.insert(name.to_string(), uuid);
        if let Some(bridge) = bridge_name {
            inner.bridge_to_uuid.insert(bridge.to_string(), uuid);
        }
        inner.meta.insert(
            uuid,
            Meta {
                name: name.to_string(),
                bridge_name: bridge_name.map(str::to_string),
            },
        );
    }

    /// All uuids currently registered, for startup/reload traversals that
    /// log and skip per-entry failures (spec §7).
    pub fn list_uuids(&self) -> Vec<Uuid> {
        self.inner.read().objects.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtnet_model::ForwardMode;

    fn def(name: &str, bridge: &str) -> NetworkDef {
        NetworkDef {
            name: name.to_string(),
            uuid: Uuid::new_v4(),
            bridge_name: Some(bridge.to_string()),
            stp_enabled: true,
            forward_delay: 0,
            ip_address: Some("192.168.100.1".parse().unwrap()),
            netmask: Some("255.255.255.0".parse().unwrap()),
            dns_domain: None,
            dhcp_ranges: vec![],
            dhcp_hosts: vec![],
            tftp_root: None,
            bootp_file: None,
            bootp_server: None,
            forward_mode: ForwardMode::Nat,
            forward_dev: None,
            adjust_firewall: true,
        }
    }

    #[test]
    fn assign_then_lock_by_name() {
        let registry = Registry::new();
        let uuid = registry.assign(def("net0", "virbr0")).unwrap();
        let locked = registry.lock_by_name("net0").unwrap();
        assert_eq!(locked.live_def.uuid, uuid);
    }

    #[test]
    fn assign_with_an_existing_name_redefines_rather_than_conflicts() {
        let registry = Registry::new();
        let uuid = registry.assign(def("net0", "virbr0")).unwrap();
        let redef_uuid = registry.assign(def("net0", "virbr1")).unwrap();
        assert_eq!(redef_uuid, uuid);
        let locked = registry.lock_by_uuid(uuid).unwrap();
        assert_eq!(locked.live_def.bridge_name.as_deref(), Some("virbr1"));
        assert!(registry.bridge_in_use("virbr0", None).is_none());
        assert_eq!(registry.bridge_in_use("virbr1", None).as_deref(), Some("net0"));
    }

    #[test]
    fn assign_rejects_duplicate_uuid() {
        let registry = Registry::new();
        let first = def("net0", "virbr0");
        let mut second = def("net1", "virbr1");
        second.uuid = first.uuid;
        registry.assign(first).unwrap();
        let err = registry.assign(second).unwrap_err();
        assert!(matches!(err, NetworkError::UuidConflict { .. }));
    }

    #[test]
    fn assign_rejects_shared_bridge() {
        let registry = Registry::new();
        registry.assign(def("net0", "virbr0")).unwrap();
        let err = registry.assign(def("net1", "virbr0")).unwrap_err();
        assert!(matches!(err, NetworkError::BridgeInUse { .. }));
    }

    #[test]
    fn bridge_in_use_excludes_self() {
        let registry = Registry::new();
        let uuid = registry.assign(def("net0", "virbr0")).unwrap();
        assert!(registry.bridge_in_use("virbr0", Some(uuid)).is_none());
        assert_eq!(registry.bridge_in_use("virbr0", None).as_deref(), Some("net0"));
    }

    #[test]
    fn remove_inactive_rejects_active_network() {
        let registry = Registry::new();
        let uuid = registry.assign(def("net0", "virbr0")).unwrap();
        let mut locked = registry.lock_by_uuid(uuid).unwrap();
        locked.active = true;
        let err = registry.remove_inactive(uuid, &locked).unwrap_err();
        assert!(matches!(err, NetworkError::StillActive { .. }));
    }

    #[test]
    fn remove_inactive_frees_the_name_and_bridge() {
        let registry = Registry::new();
        let uuid = registry.assign(def("net0", "virbr0")).unwrap();
        {
            let locked = registry.lock_by_uuid(uuid).unwrap();
            registry.remove_inactive(uuid, &locked).unwrap();
        }
        assert!(registry.lock_by_name("net0").is_none());
        registry.assign(def("net0", "virbr0")).unwrap();
    }

    #[test]
    fn assign_redefines_an_inactive_network_in_place() {
        let registry = Registry::new();
        let uuid = registry.assign(def("net0", "virbr0")).unwrap();
        let mut redef = def("net0", "virbr0");
        redef.stp_enabled = false;
        let redef_uuid = registry.assign(redef.clone()).unwrap();
        assert_eq!(redef_uuid, uuid);
        let locked = registry.lock_by_uuid(uuid).unwrap();
        assert!(!locked.live_def.stp_enabled);
        assert!(locked.pending_def.is_none());
    }

    #[test]
    fn assign_queues_pending_def_while_active() {
        let registry = Registry::new();
        let uuid = registry.assign(def("net0", "virbr0")).unwrap();
        {
            let mut locked = registry.lock_by_uuid(uuid).unwrap();
            locked.active = true;
        }
        let mut redef = def("net0", "virbr0");
        redef.stp_enabled = false;
        registry.assign(redef.clone()).unwrap();
        let locked = registry.lock_by_uuid(uuid).unwrap();
        assert!(locked.live_def.stp_enabled);
        redef.uuid = locked.live_def.uuid;
        assert_eq!(locked.pending_def.as_ref(), Some(&redef));
    }

    #[test]
    fn assign_redefinition_rejects_a_bridge_owned_by_another_network() {
        let registry = Registry::new();
        registry.assign(def("net0", "virbr0")).unwrap();
        registry.assign(def("net1", "virbr1")).unwrap();
        let mut redef = def("net0", "virbr1");
        redef.uuid = uuid::Uuid::new_v4();
        let err = registry.assign(redef).unwrap_err();
        assert!(matches!(err, NetworkError::BridgeInUse { .. }));
    }

    #[test]
    fn resync_meta_moves_the_name_index() {
        let registry = Registry::new();
        let uuid = registry.assign(def("net0", "virbr0")).unwrap();
        registry.resync_meta(uuid, "net0-renamed", Some("virbr0"));
        assert!(registry.lock_by_name("net0").is_none());
        assert!(registry.lock_by_name("net0-renamed").is_some());
    }
}
