//! Visibility Tests - Staleness, Persistence and Runtime Lookup
//!
//! Bakes a small scene, persists it and checks how the result is accepted
//! or refused once the scene changes.

use glam::Vec3;
use occlusion_bake_engine::bake::{
    BakeContext, BakeOrchestrator, BakeRequest, BakeScope, GroupSpec, RaycastVisibilityQuery,
};
use occlusion_bake_engine::config::BakeSettings;
use occlusion_bake_engine::error::ArtifactError;
use occlusion_bake_engine::scene::{MemorySceneHost, MeshStats, RendererId, RendererRef, ScenePath};
use occlusion_bake_engine::visibility::{
    BakeData, BakeGroup, BakeHash, BakeStatus, NotBakedReason, OcclusionLookup, decode_artifact,
    encode_artifact, load_artifact, save_artifact,
};
use occlusion_bake_engine::world::{Aabb, BakeVolume, GridLayout, SamplingGrid};

// ============================================================================
// Fixtures
// ============================================================================

const MAX_DISTANCE: f32 = 500.0;

fn cube(id: u64, center: Vec3, size: Vec3) -> RendererRef {
    RendererRef::mesh(
        id,
        Aabb::from_center_size(center, size),
        MeshStats {
            vertex_count: 24,
            submesh_count: 1,
        },
    )
}

fn scene() -> Vec<RendererRef> {
    vec![
        cube(1, Vec3::ZERO, Vec3::new(0.5, 20.0, 20.0)),
        cube(2, Vec3::new(6.0, 0.0, 0.0), Vec3::ONE),
        cube(3, Vec3::new(-6.0, 0.0, 0.0), Vec3::ONE),
    ]
}

fn grid() -> SamplingGrid {
    SamplingGrid::new(
        BakeVolume::new(Vec3::ZERO, Vec3::new(8.0, 2.0, 2.0)),
        GridLayout::Regular {
            cell_size: Vec3::splat(2.0),
        },
    )
}

/// Groups as a loader would rebuild them from the current scene.
fn current_groups(renderers: &[RendererRef]) -> Vec<BakeGroup> {
    let pick = |ids: &[u64]| -> Vec<RendererRef> {
        renderers
            .iter()
            .filter(|r| ids.contains(&r.id.0))
            .cloned()
            .collect()
    };
    vec![
        BakeGroup::new("walls", pick(&[1])),
        BakeGroup::new("props", pick(&[2, 3])),
    ]
}

fn bake() -> BakeData {
    let mut host = MemorySceneHost::new();
    host.add_scene(ScenePath::new("level"), scene());
    let grid = grid();
    let request = BakeRequest {
        name: "level".into(),
        scope: BakeScope::Single(ScenePath::new("level")),
        volume: grid.volume,
        layout: Some(grid.layout),
        groups: vec![
            GroupSpec {
                name: "walls".into(),
                renderers: vec![RendererId(1)],
            },
            GroupSpec {
                name: "props".into(),
                renderers: vec![RendererId(2), RendererId(3)],
            },
        ],
        providers: Vec::new(),
        output_path: None,
    };
    let settings = BakeSettings {
        batch_count: 2,
        max_sample_distance: MAX_DISTANCE,
        ..BakeSettings::default()
    };
    let mut orch = BakeOrchestrator::new(RaycastVisibilityQuery::new(), BakeContext::new(settings));
    orch.start(request).unwrap();
    orch.run_to_completion(&mut host)
        .unwrap()
        .result
        .unwrap()
        .data
}

// ============================================================================
// Staleness
// ============================================================================

#[test]
fn test_unchanged_scene_is_baked() {
    let data = bake();
    let current = BakeHash::for_raw_groups(&current_groups(&scene()), &grid(), MAX_DISTANCE);
    assert_eq!(data.status(current), BakeStatus::Baked);
    assert!(OcclusionLookup::new(data, current).is_ok());
}

#[test]
fn test_moved_renderer_makes_bake_stale() {
    let data = bake();
    let mut renderers = scene();
    renderers[1].bounds = Aabb::from_center_size(Vec3::new(7.0, 0.0, 0.0), Vec3::ONE);
    let current = BakeHash::for_raw_groups(&current_groups(&renderers), &grid(), MAX_DISTANCE);

    assert_eq!(
        data.status(current),
        BakeStatus::NotBaked(NotBakedReason::StaleHash)
    );
    let (returned, status) = OcclusionLookup::new(data, current).unwrap_err();
    assert_eq!(status, BakeStatus::NotBaked(NotBakedReason::StaleHash));
    assert!(returned.bake_completed);
}

#[test]
fn test_changed_settings_make_bake_stale() {
    let data = bake();
    let groups = current_groups(&scene());
    assert_ne!(
        data.bake_hash,
        BakeHash::for_raw_groups(&groups, &grid(), MAX_DISTANCE * 2.0)
    );
    let finer = SamplingGrid::new(
        grid().volume,
        GridLayout::Regular {
            cell_size: Vec3::ONE,
        },
    );
    assert_ne!(
        data.bake_hash,
        BakeHash::for_raw_groups(&groups, &finer, MAX_DISTANCE)
    );
}

#[test]
fn test_excluded_renderer_does_not_invalidate() {
    let data = bake();
    let mut groups = current_groups(&scene());
    groups[1]
        .renderers
        .push(cube(4, Vec3::new(0.0, 5.0, 0.0), Vec3::ONE).excluded());
    let current = BakeHash::for_raw_groups(&groups, &grid(), MAX_DISTANCE);
    assert_eq!(data.status(current), BakeStatus::Baked);
}

#[test]
fn test_incomplete_data_is_refused() {
    let mut data = bake();
    let hash = data.bake_hash;
    data.bake_completed = false;
    let (_, status) = OcclusionLookup::new(data, hash).unwrap_err();
    assert_eq!(status, BakeStatus::NotBaked(NotBakedReason::Incomplete));
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_artifact_file_reloads() {
    let data = bake();
    let path = std::env::temp_dir().join("occlusion_bake_visibility_tests.ocvb");
    save_artifact(&path, &data).unwrap();
    let loaded = load_artifact(&path).unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(loaded.bake_hash, data.bake_hash);
    assert_eq!(loaded.store, data.store);
    assert_eq!(loaded.renderers, data.renderers);
    assert_eq!(loaded.grid, data.grid);
    assert_eq!(loaded.render_date, data.render_date);
}

#[test]
fn test_truncated_artifact_is_rejected() {
    let bytes = encode_artifact(&bake()).unwrap();
    let truncated = &bytes[..bytes.len() - 8];
    assert!(matches!(
        decode_artifact(truncated),
        Err(ArtifactError::FileTooShort)
    ));
    assert!(matches!(
        decode_artifact(&bytes[..10]),
        Err(ArtifactError::FileTooShort)
    ));
}

#[test]
fn test_foreign_file_is_rejected() {
    let mut bytes = encode_artifact(&bake()).unwrap();
    bytes[0..4].copy_from_slice(b"GLB2");
    assert!(matches!(
        decode_artifact(&bytes),
        Err(ArtifactError::InvalidMagic)
    ));
}

#[test]
fn test_missing_file_is_io_error() {
    let path = std::env::temp_dir().join("occlusion_bake_does_not_exist.ocvb");
    assert!(matches!(load_artifact(&path), Err(ArtifactError::Io(_))));
}

// ============================================================================
// Runtime lookup
// ============================================================================

#[test]
fn test_lookup_answers_per_side_of_wall() {
    let data = bake();
    let hash = data.bake_hash;
    let lookup = OcclusionLookup::new(data, hash).unwrap();

    // Renderer table order: wall 0, east 1, west 2
    let west_side = Vec3::new(-2.5, 0.2, 0.0);
    let east_side = Vec3::new(2.5, -0.3, 0.4);
    assert_eq!(lookup.visible_renderers(west_side), Some(&[0u16, 2][..]));
    assert_eq!(lookup.visible_renderers(east_side), Some(&[0u16, 1][..]));
    assert!(!lookup.is_visible(west_side, 1));
    assert!(lookup.is_visible(east_side, 1));
}

#[test]
fn test_lookup_outside_grid_sees_everything() {
    let data = bake();
    let hash = data.bake_hash;
    let lookup = OcclusionLookup::new(data, hash).unwrap();
    let outside = Vec3::new(50.0, 0.0, 0.0);
    assert_eq!(lookup.visible_renderers(outside), None);
    assert!(lookup.is_visible(outside, 2));
}
