//! Render Source Registry
//!
//! Renderers that share a prototype and a grouping key are drawn together as
//! one [`RenderSourceGroup`]. Each registered renderer becomes a
//! [`RenderSource`] inside its group, owns one region of the shared instance
//! buffer, and is identified by a non-zero [`RenderKey`].
//!
//! Invariants after every operation:
//! - `group.buffer_size() == Σ source.buffer_size()` for every group
//! - groups are never empty
//! - every live key maps to exactly one source
//!
//! Disposal by anyone other than the owner queues an [`OwnerNotification`]
//! so the owning manager can null its cached key. Drain them once per frame.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::allocator::{BufferAllocator, BufferRegion};
use super::lod_stats::{LodRenderStatistics, compute_lod_statistics};
use super::prototype::{LodLevel, Prototype, PrototypeId, ShaderConversionCache};
use crate::error::RegistryError;

/// Handle of a registered renderer. `RenderKey::NONE` means unregistered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RenderKey(pub u32);

impl RenderKey {
    pub const NONE: RenderKey = RenderKey(0);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for RenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the component that registered a renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

/// Group ids grow monotonically and are never reused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u32);

/// Per-instance transform layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformBufferType {
    #[default]
    Matrix4x4,
    /// Affine rows only
    Matrix3x4,
}

impl TransformBufferType {
    /// Bytes per instance.
    pub fn stride(self) -> u64 {
        match self {
            TransformBufferType::Matrix4x4 => 64,
            TransformBufferType::Matrix3x4 => 48,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RendererRegistration {
    pub owner: OwnerId,
    pub prototype: Prototype,
    pub grouping_key: u64,
    pub transform_buffer_type: TransformBufferType,
    pub keywords: Vec<String>,
    pub instance_count: u32,
}

/// A renderer's share of its group.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderSource {
    pub key: RenderKey,
    pub owner: OwnerId,
    pub instance_count: u32,
    pub transform_buffer_type: TransformBufferType,
    pub keywords: Vec<String>,
    region: Option<BufferRegion>,
}

impl RenderSource {
    /// Bytes of instance buffer held by this source.
    pub fn buffer_size(&self) -> u64 {
        self.region.map_or(0, |r| r.size)
    }

    pub fn region(&self) -> Option<BufferRegion> {
        self.region
    }
}

/// Renderers sharing a prototype and grouping key.
#[derive(Clone, Debug)]
pub struct RenderSourceGroup {
    id: GroupId,
    prototype: Prototype,
    grouping_key: u64,
    sources: Vec<RenderSource>,
    buffer_size: u64,
    instance_count: u32,
    lod_stats: Vec<LodRenderStatistics>,
}

impl RenderSourceGroup {
    fn new(id: GroupId, prototype: Prototype, grouping_key: u64) -> Self {
        Self {
            id,
            prototype,
            grouping_key,
            sources: Vec::new(),
            buffer_size: 0,
            instance_count: 0,
            lod_stats: Vec::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn prototype(&self) -> &Prototype {
        &self.prototype
    }

    pub fn grouping_key(&self) -> u64 {
        self.grouping_key
    }

    pub fn sources(&self) -> &[RenderSource] {
        &self.sources
    }

    pub fn source(&self, key: RenderKey) -> Option<&RenderSource> {
        self.sources.iter().find(|s| s.key == key)
    }

    pub fn buffer_size(&self) -> u64 {
        self.buffer_size
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn lod_count(&self) -> usize {
        self.prototype.lods.len()
    }

    pub fn lod_render_statistics(&self) -> &[LodRenderStatistics] {
        &self.lod_stats
    }

    /// `buffer_size` equals the sum over sources.
    pub fn is_consistent(&self) -> bool {
        self.buffer_size == self.sources.iter().map(RenderSource::buffer_size).sum::<u64>()
    }

    fn recompute(&mut self) {
        self.buffer_size = self.sources.iter().map(RenderSource::buffer_size).sum();
        self.instance_count = self
            .sources
            .iter()
            .fold(0u32, |acc, s| acc.saturating_add(s.instance_count));
        self.lod_stats = compute_lod_statistics(&self.prototype.lods, self.instance_count);
    }
}

/// A renderer owned by `owner` was disposed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerNotification {
    pub owner: OwnerId,
    pub key: RenderKey,
}

pub struct RenderSourceRegistry {
    groups: BTreeMap<GroupId, RenderSourceGroup>,
    by_prototype: HashMap<(PrototypeId, u64), GroupId>,
    key_to_group: HashMap<RenderKey, GroupId>,
    allocator: BufferAllocator,
    shaders: ShaderConversionCache,
    platform: wgpu::Backend,
    next_key: u32,
    next_group: u32,
    generation: u64,
    notifications: Vec<OwnerNotification>,
}

impl Default for RenderSourceRegistry {
    fn default() -> Self {
        Self::new(ShaderConversionCache::default(), wgpu::Backend::Vulkan)
    }
}

impl RenderSourceRegistry {
    pub fn new(shaders: ShaderConversionCache, platform: wgpu::Backend) -> Self {
        Self {
            groups: BTreeMap::new(),
            by_prototype: HashMap::new(),
            key_to_group: HashMap::new(),
            allocator: BufferAllocator::new(),
            shaders,
            platform,
            next_key: 1,
            next_group: 1,
            generation: 0,
            notifications: Vec::new(),
        }
    }

    /// Registry whose instance buffer holds at most `capacity` bytes.
    pub fn with_buffer_capacity(mut self, capacity: u64) -> Self {
        self.allocator = BufferAllocator::with_capacity(capacity);
        self
    }

    pub fn platform(&self) -> wgpu::Backend {
        self.platform
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    pub fn shader_cache(&self) -> &ShaderConversionCache {
        &self.shaders
    }

    /// Changes whenever a group is created or removed, or a group's LOD
    /// count changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.key_to_group.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_to_group.is_empty()
    }

    pub fn contains(&self, key: RenderKey) -> bool {
        self.key_to_group.contains_key(&key)
    }

    pub fn group(&self, id: GroupId) -> Option<&RenderSourceGroup> {
        self.groups.get(&id)
    }

    pub fn group_of(&self, key: RenderKey) -> Option<&RenderSourceGroup> {
        self.key_to_group.get(&key).and_then(|id| self.groups.get(id))
    }

    /// Groups in id order.
    pub fn groups(&self) -> impl Iterator<Item = &RenderSourceGroup> + '_ {
        self.groups.values()
    }

    /// Register a renderer, creating its group on first use.
    pub fn register_renderer(
        &mut self,
        registration: RendererRegistration,
    ) -> Result<RenderKey, RegistryError> {
        registration
            .prototype
            .validate(&mut self.shaders, self.platform)?;
        if self.next_key == u32::MAX {
            return Err(RegistryError::KeysExhausted);
        }

        let region = self.allocate(registration.transform_buffer_type, registration.instance_count)?;
        let key = RenderKey(self.next_key);
        self.next_key += 1;

        let group_key = (registration.prototype.id, registration.grouping_key);
        let group_id = match self.by_prototype.get(&group_key) {
            Some(&id) => id,
            None => {
                let id = GroupId(self.next_group);
                self.next_group += 1;
                self.groups.insert(
                    id,
                    RenderSourceGroup::new(
                        id,
                        registration.prototype.clone(),
                        registration.grouping_key,
                    ),
                );
                self.by_prototype.insert(group_key, id);
                self.generation += 1;
                log::debug!(
                    "[Registry] created group {} for `{}`",
                    id.0,
                    registration.prototype.name
                );
                id
            }
        };

        let Some(group) = self.groups.get_mut(&group_id) else {
            if let Some(region) = region {
                self.allocator.free(region);
            }
            return Err(RegistryError::UnknownKey(key.0));
        };
        group.sources.push(RenderSource {
            key,
            owner: registration.owner,
            instance_count: registration.instance_count,
            transform_buffer_type: registration.transform_buffer_type,
            keywords: registration.keywords,
            region,
        });
        group.recompute();
        self.key_to_group.insert(key, group_id);
        Ok(key)
    }

    /// Remove a renderer and free its buffer region. An emptied group is
    /// removed; otherwise its bookkeeping shrinks. The owner is notified.
    pub fn dispose_renderer(&mut self, key: RenderKey) -> Result<(), RegistryError> {
        self.remove_source(key, None)
    }

    /// Dispose on behalf of `owner`. No notification is queued when `owner`
    /// owns the renderer, since it already knows.
    pub fn dispose_owned(&mut self, key: RenderKey, owner: OwnerId) -> Result<(), RegistryError> {
        self.remove_source(key, Some(owner))
    }

    fn remove_source(
        &mut self,
        key: RenderKey,
        disposer: Option<OwnerId>,
    ) -> Result<(), RegistryError> {
        let group_id = self
            .key_to_group
            .remove(&key)
            .ok_or(RegistryError::UnknownKey(key.0))?;
        let Some(group) = self.groups.get_mut(&group_id) else {
            return Err(RegistryError::UnknownKey(key.0));
        };
        let Some(at) = group.sources.iter().position(|s| s.key == key) else {
            return Err(RegistryError::UnknownKey(key.0));
        };
        let source = group.sources.remove(at);
        if let Some(region) = source.region {
            self.allocator.free(region);
        }
        if disposer != Some(source.owner) {
            self.notifications.push(OwnerNotification {
                owner: source.owner,
                key,
            });
        }

        if group.sources.is_empty() {
            let prototype_key = (group.prototype.id, group.grouping_key);
            self.groups.remove(&group_id);
            self.by_prototype.remove(&prototype_key);
            self.generation += 1;
            log::debug!("[Registry] removed empty group {}", group_id.0);
        } else {
            group.recompute();
        }
        Ok(())
    }

    /// Resize a renderer's instance region.
    pub fn set_instance_count(&mut self, key: RenderKey, count: u32) -> Result<(), RegistryError> {
        let group_id = *self
            .key_to_group
            .get(&key)
            .ok_or(RegistryError::UnknownKey(key.0))?;
        let (old_region, buffer_type) = {
            let source = self
                .groups
                .get(&group_id)
                .and_then(|g| g.source(key))
                .ok_or(RegistryError::UnknownKey(key.0))?;
            if source.instance_count == count {
                return Ok(());
            }
            (source.region, source.transform_buffer_type)
        };

        if let Some(region) = old_region {
            self.allocator.free(region);
        }
        let new_region = match self.allocate(buffer_type, count) {
            Ok(region) => region,
            Err(e) => {
                // Put the old region back; it was just freed so it fits again.
                let restored = old_region.and_then(|r| self.allocator.allocate(r.size));
                if let Some(source) = self.source_mut(group_id, key) {
                    source.region = restored;
                }
                if let Some(group) = self.groups.get_mut(&group_id) {
                    group.recompute();
                }
                return Err(e);
            }
        };

        if let Some(source) = self.source_mut(group_id, key) {
            source.region = new_region;
            source.instance_count = count;
        }
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.recompute();
        }
        Ok(())
    }

    /// Replace the LOD levels of every group built from `prototype`.
    /// Returns the number of groups updated.
    pub fn update_prototype_lods(
        &mut self,
        prototype: PrototypeId,
        lods: Vec<LodLevel>,
    ) -> Result<usize, RegistryError> {
        let ids: Vec<GroupId> = self
            .by_prototype
            .iter()
            .filter(|((p, _), _)| *p == prototype)
            .map(|(_, &id)| id)
            .collect();
        let Some(first) = ids.first().and_then(|id| self.groups.get(id)) else {
            return Err(RegistryError::UnknownPrototype(prototype.0));
        };
        let mut candidate = first.prototype.clone();
        candidate.lods = lods;
        candidate.validate(&mut self.shaders, self.platform)?;

        let mut layout_changed = false;
        for id in &ids {
            if let Some(group) = self.groups.get_mut(id) {
                layout_changed |= group.prototype.lods.len() != candidate.lods.len();
                group.prototype.lods = candidate.lods.clone();
                group.recompute();
            }
        }
        if layout_changed {
            self.generation += 1;
        }
        Ok(ids.len())
    }

    /// Notifications waiting for the next drain.
    pub fn pending_owner_notifications(&self) -> usize {
        self.notifications.len()
    }

    /// Take the disposal notifications queued since the last drain.
    pub fn drain_owner_notifications(&mut self) -> Vec<OwnerNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// Every group consistent and the allocator consistent.
    pub fn is_consistent(&self) -> bool {
        self.allocator.is_consistent()
            && self
                .groups
                .values()
                .all(|g| !g.sources.is_empty() && g.is_consistent())
    }

    fn allocate(
        &mut self,
        buffer_type: TransformBufferType,
        instance_count: u32,
    ) -> Result<Option<BufferRegion>, RegistryError> {
        let size = buffer_type.stride() * u64::from(instance_count);
        if size == 0 {
            return Ok(None);
        }
        self.allocator
            .allocate(size)
            .map(Some)
            .ok_or(RegistryError::AllocationFailed(size))
    }

    fn source_mut(&mut self, group: GroupId, key: RenderKey) -> Option<&mut RenderSource> {
        self.groups
            .get_mut(&group)
            .and_then(|g| g.sources.iter_mut().find(|s| s.key == key))
    }
}
