//! Instance managers and the render context
//!
//! An [`InstanceManager`] owns a list of prototypes and caches only the
//! render key each one was registered under. The registry itself lives in a
//! [`RenderContext`] that is passed explicitly to whoever needs it.
//!
//! `prototype_index(key)` and `render_key(index)` are inverses while a
//! prototype is registered; after disposal they return `None` and
//! `RenderKey::NONE`.

use std::collections::HashMap;

use super::prototype::Prototype;
use super::registry::{
    OwnerId, OwnerNotification, RenderKey, RenderSourceRegistry, RendererRegistration,
    TransformBufferType,
};
use super::visibility_buffer::{CameraDataRegistry, VisibilityStorage};
use crate::error::RegistryError;

/// One prototype as a manager wants it registered.
#[derive(Clone, Debug, PartialEq)]
pub struct ManagedPrototype {
    pub prototype: Prototype,
    pub grouping_key: u64,
    pub transform_buffer_type: TransformBufferType,
    pub keywords: Vec<String>,
    pub instance_count: u32,
}

impl ManagedPrototype {
    pub fn new(prototype: Prototype, instance_count: u32) -> Self {
        Self {
            prototype,
            grouping_key: 0,
            transform_buffer_type: TransformBufferType::default(),
            keywords: Vec::new(),
            instance_count,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstanceManager {
    owner: OwnerId,
    prototypes: Vec<ManagedPrototype>,
    /// Parallel to `prototypes`
    render_keys: Vec<RenderKey>,
}

impl InstanceManager {
    pub fn new(owner: OwnerId) -> Self {
        Self {
            owner,
            prototypes: Vec::new(),
            render_keys: Vec::new(),
        }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Add a prototype; it is registered on the next `register_all`.
    pub fn add_prototype(&mut self, prototype: ManagedPrototype) -> usize {
        self.prototypes.push(prototype);
        self.render_keys.push(RenderKey::NONE);
        self.prototypes.len() - 1
    }

    pub fn prototypes(&self) -> &[ManagedPrototype] {
        &self.prototypes
    }

    pub fn prototype_index(&self, key: RenderKey) -> Option<usize> {
        if key.is_none() {
            return None;
        }
        self.render_keys.iter().position(|&k| k == key)
    }

    pub fn render_key(&self, index: usize) -> RenderKey {
        self.render_keys
            .get(index)
            .copied()
            .unwrap_or(RenderKey::NONE)
    }

    pub fn registered_count(&self) -> usize {
        self.render_keys.iter().filter(|k| !k.is_none()).count()
    }

    /// Register every prototype that has no key yet. Failures leave the key
    /// at `NONE` and are returned with their prototype index.
    pub fn register_all(
        &mut self,
        registry: &mut RenderSourceRegistry,
    ) -> Vec<(usize, RegistryError)> {
        let mut failures = Vec::new();
        for (index, managed) in self.prototypes.iter().enumerate() {
            if !self.render_keys[index].is_none() {
                continue;
            }
            let registration = RendererRegistration {
                owner: self.owner,
                prototype: managed.prototype.clone(),
                grouping_key: managed.grouping_key,
                transform_buffer_type: managed.transform_buffer_type,
                keywords: managed.keywords.clone(),
                instance_count: managed.instance_count,
            };
            match registry.register_renderer(registration) {
                Ok(key) => self.render_keys[index] = key,
                Err(e) => {
                    log::warn!(
                        "[InstanceManager] `{}` not registered: {e}",
                        managed.prototype.name
                    );
                    failures.push((index, e));
                }
            }
        }
        failures
    }

    /// Dispose every registered prototype and clear the cached keys.
    pub fn dispose_all(&mut self, registry: &mut RenderSourceRegistry) {
        for key in self.render_keys.iter_mut() {
            if key.is_none() {
                continue;
            }
            if let Err(e) = registry.dispose_owned(*key, self.owner) {
                log::warn!("[InstanceManager] dispose of key {key} failed: {e}");
            }
            *key = RenderKey::NONE;
        }
    }

    /// Null keys that were disposed behind this manager's back. Returns how
    /// many keys were cleared.
    pub fn apply_owner_notifications(&mut self, notifications: &[OwnerNotification]) -> usize {
        let mut cleared = 0;
        for note in notifications.iter().filter(|n| n.owner == self.owner) {
            for key in self.render_keys.iter_mut().filter(|k| **k == note.key) {
                *key = RenderKey::NONE;
                cleared += 1;
            }
        }
        cleared
    }
}

/// Everything the instanced renderer shares: the registry and the per-camera
/// visibility buffers.
pub struct RenderContext<S: VisibilityStorage> {
    pub registry: RenderSourceRegistry,
    pub cameras: CameraDataRegistry<S>,
}

impl<S: VisibilityStorage> RenderContext<S> {
    pub fn new(registry: RenderSourceRegistry, cameras: CameraDataRegistry<S>) -> Self {
        Self { registry, cameras }
    }

    /// Route queued disposal notifications to their managers.
    pub fn dispatch_owner_notifications(&mut self, managers: &mut [&mut InstanceManager]) -> usize {
        let notes = self.registry.drain_owner_notifications();
        if notes.is_empty() {
            return 0;
        }
        let mut by_owner: HashMap<OwnerId, Vec<OwnerNotification>> = HashMap::new();
        for note in notes {
            by_owner.entry(note.owner).or_default().push(note);
        }
        managers
            .iter_mut()
            .map(|m| {
                by_owner
                    .get(&m.owner())
                    .map_or(0, |notes| m.apply_owner_notifications(notes))
            })
            .sum()
    }

    pub fn begin_frame(&mut self) {
        self.cameras.begin_frame(&self.registry);
    }

    pub fn end_frame(&mut self) {
        self.cameras.end_frame();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instancing::prototype::{LodLevel, MaterialInfo, MeshInfo};
    use crate::instancing::visibility_buffer::CpuVisibilityStorage;

    fn managed(id: u32) -> ManagedPrototype {
        ManagedPrototype::new(
            Prototype::new(
                id,
                format!("p{id}"),
                vec![LodLevel::new(
                    MeshInfo {
                        name: "m".into(),
                        vertex_count: 4,
                        submesh_count: 1,
                    },
                    MaterialInfo::new("mat", "lit"),
                    false,
                )],
            ),
            3,
        )
    }

    #[test]
    fn test_keys_and_indices_are_inverse() {
        let mut registry = RenderSourceRegistry::default();
        let mut manager = InstanceManager::new(OwnerId(1));
        manager.add_prototype(managed(1));
        manager.add_prototype(managed(2));
        assert!(manager.register_all(&mut registry).is_empty());

        for index in 0..2 {
            let key = manager.render_key(index);
            assert!(!key.is_none());
            assert_eq!(manager.prototype_index(key), Some(index));
        }

        let first = manager.render_key(0);
        manager.dispose_all(&mut registry);
        assert_eq!(manager.render_key(0), RenderKey::NONE);
        assert_eq!(manager.prototype_index(first), None);
        assert!(registry.is_empty());
        assert_eq!(registry.pending_owner_notifications(), 0);
    }

    #[test]
    fn test_dispose_all_only_notifies_other_owners() {
        let mut registry = RenderSourceRegistry::default();
        let mut manager = InstanceManager::new(OwnerId(1));
        manager.add_prototype(managed(1));
        manager.add_prototype(managed(2));
        manager.register_all(&mut registry);

        for _ in 0..3 {
            manager.dispose_all(&mut registry);
            manager.register_all(&mut registry);
        }
        assert_eq!(registry.pending_owner_notifications(), 0);

        let key = manager.render_key(1);
        registry.dispose_owned(key, OwnerId(2)).unwrap();
        assert_eq!(
            registry.drain_owner_notifications(),
            vec![OwnerNotification {
                owner: OwnerId(1),
                key
            }]
        );
    }

    #[test]
    fn test_failed_registration_keeps_sentinel() {
        let mut registry = RenderSourceRegistry::default();
        let mut manager = InstanceManager::new(OwnerId(1));
        let mut broken = managed(1);
        broken.prototype.lods.clear();
        manager.add_prototype(broken);
        let failures = manager.register_all(&mut registry);
        assert_eq!(failures.len(), 1);
        assert_eq!(manager.render_key(0), RenderKey::NONE);
        assert_eq!(manager.render_key(99), RenderKey::NONE);
    }

    #[test]
    fn test_external_dispose_reaches_owner() {
        let mut context = RenderContext::new(
            RenderSourceRegistry::default(),
            CameraDataRegistry::<CpuVisibilityStorage>::cpu(),
        );
        let mut a = InstanceManager::new(OwnerId(1));
        let mut b = InstanceManager::new(OwnerId(2));
        a.add_prototype(managed(1));
        b.add_prototype(managed(1));
        a.register_all(&mut context.registry);
        b.register_all(&mut context.registry);

        let key = a.render_key(0);
        context.registry.dispose_renderer(key).unwrap();
        let cleared = context.dispatch_owner_notifications(&mut [&mut a, &mut b]);
        assert_eq!(cleared, 1);
        assert_eq!(a.render_key(0), RenderKey::NONE);
        assert!(!b.render_key(0).is_none());
    }
}
