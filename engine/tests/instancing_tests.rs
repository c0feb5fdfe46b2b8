//! Instancing Tests - Registry Bookkeeping, Managers and Visibility Buffers
//!
//! Exercises the render source registry through instance managers the way a
//! renderer would drive it frame to frame.

use std::cell::RefCell;
use std::rc::Rc;

use occlusion_bake_engine::error::{PrototypeError, RegistryError};
use occlusion_bake_engine::instancing::{
    BufferAllocator, CameraDataRegistry, CameraId, CameraVisibilityBuffer, CpuVisibilityStorage,
    InstanceManager, LodLevel, ManagedPrototype, MaterialInfo, MeshInfo, OwnerId, Prototype,
    PrototypeId, RenderContext, RenderKey, RenderSourceRegistry, RendererRegistration,
    ShaderConversionCache, ShaderConverter, TransformBufferType, VisibilitySnapshot,
};

// ============================================================================
// Fixtures
// ============================================================================

fn lod(vertices: u32, shader: &str, shadows: bool) -> LodLevel {
    LodLevel::new(
        MeshInfo {
            name: format!("mesh_{vertices}"),
            vertex_count: vertices,
            submesh_count: 1,
        },
        MaterialInfo::new("material", shader),
        shadows,
    )
}

fn prototype(id: u32) -> Prototype {
    Prototype::new(
        id,
        format!("tree_{id}"),
        vec![lod(300, "foliage", true), lod(40, "foliage", false)],
    )
}

fn registration(owner: u64, proto: Prototype, count: u32) -> RendererRegistration {
    RendererRegistration {
        owner: OwnerId(owner),
        prototype: proto,
        grouping_key: 0,
        transform_buffer_type: TransformBufferType::Matrix4x4,
        keywords: Vec::new(),
        instance_count: count,
    }
}

/// Rejects one shader name and counts every conversion attempt.
struct RejectShader {
    rejected: &'static str,
    attempts: Rc<RefCell<usize>>,
}

impl ShaderConverter for RejectShader {
    fn convert(&mut self, shader: &str, _platform: wgpu::Backend) -> Result<(), String> {
        *self.attempts.borrow_mut() += 1;
        if shader == self.rejected {
            Err("unsupported intrinsic".into())
        } else {
            Ok(())
        }
    }
}

// ============================================================================
// Registry bookkeeping
// ============================================================================

#[test]
fn test_group_buffer_size_tracks_sources() {
    let mut registry = RenderSourceRegistry::default();
    let stride = TransformBufferType::Matrix4x4.stride();
    let mut keys = Vec::new();

    for count in [4u32, 10, 1, 7] {
        keys.push(
            registry
                .register_renderer(registration(1, prototype(1), count))
                .unwrap(),
        );
        let group = registry.group_of(keys[0]).unwrap();
        let expected: u64 = group.sources().iter().map(|s| s.buffer_size()).sum();
        assert_eq!(group.buffer_size(), expected);
        assert!(registry.is_consistent());
    }
    assert_eq!(registry.group_of(keys[0]).unwrap().buffer_size(), 22 * stride);

    registry.dispose_renderer(keys[1]).unwrap();
    let group = registry.group_of(keys[0]).unwrap();
    assert_eq!(group.buffer_size(), 12 * stride);
    assert_eq!(group.instance_count(), 12);
    assert!(registry.is_consistent());

    registry.set_instance_count(keys[2], 5).unwrap();
    assert_eq!(registry.group_of(keys[0]).unwrap().buffer_size(), 16 * stride);
    assert!(registry.is_consistent());
}

#[test]
fn test_regions_never_overlap() {
    let mut registry = RenderSourceRegistry::default();
    let a = registry
        .register_renderer(registration(1, prototype(1), 8))
        .unwrap();
    let b = registry
        .register_renderer(registration(1, prototype(2), 3))
        .unwrap();
    registry.set_instance_count(a, 20).unwrap();
    let c = registry
        .register_renderer(registration(2, prototype(1), 6))
        .unwrap();

    let regions: Vec<_> = [a, b, c]
        .iter()
        .filter_map(|&k| registry.group_of(k)?.source(k)?.region())
        .collect();
    assert_eq!(regions.len(), 3);
    for (i, x) in regions.iter().enumerate() {
        for y in &regions[i + 1..] {
            assert!(!x.overlaps(y), "{x:?} overlaps {y:?}");
        }
    }
}

#[test]
fn test_full_buffer_keeps_old_region() {
    let stride = TransformBufferType::Matrix3x4.stride();
    let mut registry = RenderSourceRegistry::default().with_buffer_capacity(10 * stride);
    let mut reg = registration(1, prototype(1), 4);
    reg.transform_buffer_type = TransformBufferType::Matrix3x4;
    let key = registry.register_renderer(reg).unwrap();

    let err = registry.set_instance_count(key, 11).unwrap_err();
    assert_eq!(err, RegistryError::AllocationFailed(11 * stride));
    let source = registry.group_of(key).unwrap().source(key).unwrap();
    assert_eq!(source.instance_count, 4);
    assert_eq!(source.buffer_size(), 4 * stride);
    assert!(registry.is_consistent());
}

#[test]
fn test_lod_update_reaches_every_group_of_prototype() {
    let mut registry = RenderSourceRegistry::default();
    let plain = registry
        .register_renderer(registration(1, prototype(1), 2))
        .unwrap();
    let mut grouped = registration(1, prototype(1), 2);
    grouped.grouping_key = 9;
    let keyed = registry.register_renderer(grouped).unwrap();
    assert_ne!(
        registry.group_of(plain).unwrap().id(),
        registry.group_of(keyed).unwrap().id()
    );

    let generation = registry.generation();
    let updated = registry
        .update_prototype_lods(PrototypeId(1), vec![lod(500, "foliage", true)])
        .unwrap();
    assert_eq!(updated, 2);
    assert!(registry.generation() > generation);
    for key in [plain, keyed] {
        let group = registry.group_of(key).unwrap();
        assert_eq!(group.lod_count(), 1);
        assert_eq!(group.lod_render_statistics()[0].vertex_count, 1000);
    }

    assert_eq!(
        registry.update_prototype_lods(PrototypeId(77), Vec::new()),
        Err(RegistryError::UnknownPrototype(77))
    );
}

#[test]
fn test_shader_failure_is_cached_per_platform() {
    let attempts = Rc::new(RefCell::new(0));
    let cache = ShaderConversionCache::new(RejectShader {
        rejected: "broken",
        attempts: attempts.clone(),
    });
    let mut registry = RenderSourceRegistry::new(cache, wgpu::Backend::Metal);
    let broken = Prototype::new(5, "broken", vec![lod(10, "broken", false)]);

    for _ in 0..3 {
        let err = registry
            .register_renderer(registration(1, broken.clone(), 1))
            .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Prototype(PrototypeError::ShaderConversionFailed { .. })
        ));
    }
    assert_eq!(*attempts.borrow(), 1);
    assert!(
        registry
            .shader_cache()
            .is_known_failure("broken", wgpu::Backend::Metal)
    );
    assert!(registry.is_empty());
}

// ============================================================================
// Instance managers
// ============================================================================

#[test]
fn test_manager_keys_round_trip_and_reset() {
    let mut registry = RenderSourceRegistry::default();
    let mut manager = InstanceManager::new(OwnerId(3));
    for id in 1..=4 {
        manager.add_prototype(ManagedPrototype::new(prototype(id), id * 2));
    }
    assert!(manager.register_all(&mut registry).is_empty());
    assert_eq!(manager.registered_count(), 4);

    for index in 0..4 {
        let key = manager.render_key(index);
        assert!(registry.contains(key));
        assert_eq!(manager.prototype_index(key), Some(index));
    }
    assert_eq!(manager.prototype_index(RenderKey::NONE), None);
    assert_eq!(manager.render_key(4), RenderKey::NONE);

    manager.dispose_all(&mut registry);
    assert_eq!(manager.registered_count(), 0);
    assert!((0..4).all(|i| manager.render_key(i).is_none()));
    assert!(registry.is_empty());
    assert_eq!(registry.allocator().used_bytes(), 0);
}

#[test]
fn test_registry_dispose_notifies_owning_manager() {
    let mut context = RenderContext::new(
        RenderSourceRegistry::default(),
        CameraDataRegistry::<CpuVisibilityStorage>::cpu(),
    );
    let mut forest = InstanceManager::new(OwnerId(1));
    let mut village = InstanceManager::new(OwnerId(2));
    forest.add_prototype(ManagedPrototype::new(prototype(1), 10));
    forest.add_prototype(ManagedPrototype::new(prototype(2), 10));
    village.add_prototype(ManagedPrototype::new(prototype(1), 3));
    forest.register_all(&mut context.registry);
    village.register_all(&mut context.registry);

    let doomed = forest.render_key(1);
    context.registry.dispose_renderer(doomed).unwrap();
    let cleared = context.dispatch_owner_notifications(&mut [&mut forest, &mut village]);

    assert_eq!(cleared, 1);
    assert_eq!(forest.render_key(1), RenderKey::NONE);
    assert_eq!(forest.prototype_index(doomed), None);
    assert!(!forest.render_key(0).is_none());
    assert!(!village.render_key(0).is_none());
}

// ============================================================================
// Allocator
// ============================================================================

#[test]
fn test_allocator_reuses_coalesced_holes() {
    let mut alloc = BufferAllocator::new();
    let a = alloc.allocate(64).unwrap();
    let b = alloc.allocate(64).unwrap();
    let c = alloc.allocate(64).unwrap();
    let _d = alloc.allocate(64).unwrap();

    assert!(alloc.free(a));
    assert!(alloc.free(b));
    assert_eq!(alloc.free_regions().len(), 1);

    let big = alloc.allocate(128).unwrap();
    assert_eq!(big.offset, 0);
    assert!(alloc.free(c));
    assert!(!alloc.free(c));
    assert!(alloc.is_consistent());
}

// ============================================================================
// Visibility buffers
// ============================================================================

fn drawn_registry() -> (RenderSourceRegistry, RenderKey) {
    let mut registry = RenderSourceRegistry::default();
    let key = registry
        .register_renderer(registration(1, prototype(1), 16))
        .unwrap();
    (registry, key)
}

#[test]
fn test_counts_arrive_one_frame_late() {
    let (registry, key) = drawn_registry();
    let group = registry.group_of(key).unwrap().id();
    let mut buffer = CameraVisibilityBuffer::new(CpuVisibilityStorage::new());
    let seen: Rc<RefCell<Vec<(u64, u32)>>> = Rc::default();

    buffer.begin_frame(&registry);
    assert!(buffer.record(group, 0, false, 5));
    assert!(buffer.record(group, 0, true, 2));
    let sink = seen.clone();
    buffer.async_data_request(
        move |snap: &VisibilitySnapshot| {
            sink.borrow_mut()
                .push((snap.frame, snap.visible_count(group, 0, false).unwrap_or(0)));
        },
        false,
    );
    buffer.end_frame();
    assert!(seen.borrow().is_empty());
    assert_eq!(buffer.pending_requests(), 1);

    buffer.begin_frame(&registry);
    buffer.record(group, 1, false, 9);
    buffer.end_frame();
    assert_eq!(*seen.borrow(), vec![(1, 5)]);
    assert_eq!(buffer.pending_requests(), 0);
}

#[test]
fn test_blocking_request_answers_immediately() {
    let (registry, key) = drawn_registry();
    let group = registry.group_of(key).unwrap().id();
    let mut buffer = CameraVisibilityBuffer::new(CpuVisibilityStorage::new());
    buffer.begin_frame(&registry);
    buffer.record(group, 1, false, 4);
    buffer.end_frame();

    let total = Rc::new(RefCell::new(None));
    let sink = total.clone();
    buffer.async_data_request(
        move |snap: &VisibilitySnapshot| *sink.borrow_mut() = Some(snap.total_visible(false)),
        true,
    );
    assert_eq!(*total.borrow(), Some(4));
    assert_eq!(buffer.pending_requests(), 0);
}

#[test]
fn test_layout_follows_registry_generation() {
    let (mut registry, key) = drawn_registry();
    let mut cameras = CameraDataRegistry::<CpuVisibilityStorage>::cpu();
    cameras.track_camera(CameraId(1));
    cameras.begin_frame(&registry);
    let first = registry.group_of(key).unwrap().id();
    let buffer = cameras.get(CameraId(1)).unwrap();
    assert_eq!(buffer.try_get_visibility_buffer_index(first), Some(0));
    cameras.end_frame();

    let other = registry
        .register_renderer(registration(1, prototype(2), 2))
        .unwrap();
    let second = registry.group_of(other).unwrap().id();
    cameras.begin_frame(&registry);
    let buffer = cameras.get_mut(CameraId(1)).unwrap();
    assert!(buffer.try_get_visibility_buffer_index(second).is_some());
    assert!(buffer.record(second, 1, true, 1));
    // Unknown LOD
    assert!(!buffer.record(second, 5, false, 1));
    cameras.end_frame();

    registry.dispose_renderer(key).unwrap();
    cameras.begin_frame(&registry);
    let buffer = cameras.get(CameraId(1)).unwrap();
    assert_eq!(buffer.try_get_visibility_buffer_index(first), None);
    assert!(cameras.untrack_camera(CameraId(1)));
    assert!(cameras.is_empty());
}
