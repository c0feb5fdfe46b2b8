//! LOD render statistics
//!
//! Point-in-time draw and vertex counts per LOD of a render source group.
//! Recomputed whenever the group's instance count or LOD configuration
//! changes, never streamed.

use serde::{Deserialize, Serialize};

use super::prototype::LodLevel;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LodRenderStatistics {
    pub draw_count: u32,
    pub shadow_draw_count: u32,
    pub vertex_count: u64,
    pub shadow_vertex_count: u64,
}

/// Statistics for each LOD when `instance_count` instances are drawn.
pub fn compute_lod_statistics(lods: &[LodLevel], instance_count: u32) -> Vec<LodRenderStatistics> {
    lods.iter()
        .map(|lod| {
            if instance_count == 0 {
                return LodRenderStatistics::default();
            }
            let draws = lod.submesh_count();
            let vertices = u64::from(lod.vertex_count()) * u64::from(instance_count);
            let (shadow_draws, shadow_vertices) = if lod.casts_shadows {
                (draws, vertices)
            } else {
                (0, 0)
            };
            LodRenderStatistics {
                draw_count: draws,
                shadow_draw_count: shadow_draws,
                vertex_count: vertices,
                shadow_vertex_count: shadow_vertices,
            }
        })
        .collect()
}

/// Sum over LODs.
pub fn total(stats: &[LodRenderStatistics]) -> LodRenderStatistics {
    stats.iter().fold(LodRenderStatistics::default(), |acc, s| LodRenderStatistics {
        draw_count: acc.draw_count + s.draw_count,
        shadow_draw_count: acc.shadow_draw_count + s.shadow_draw_count,
        vertex_count: acc.vertex_count + s.vertex_count,
        shadow_vertex_count: acc.shadow_vertex_count + s.shadow_vertex_count,
    })
}
