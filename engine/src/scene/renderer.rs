//! Renderer references
//!
//! The engine's renderer objects reduced to what visibility sampling needs:
//! a stable identity, world bounds and mesh statistics.

use serde::{Deserialize, Serialize};

use crate::world::Aabb;

/// Stable identity of a renderer inside its host scene.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RendererId(pub u64);

/// Renderer kind, standing in for the engine's renderer class hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RendererKind {
    Mesh,
    Skinned,
    /// Camera-facing quads. Never treated as occluders.
    Billboard,
}

impl RendererKind {
    /// Whether this renderer blocks visibility of others.
    pub fn is_occluder(self) -> bool {
        !matches!(self, RendererKind::Billboard)
    }

    pub(crate) fn hash_tag(self) -> u8 {
        match self {
            RendererKind::Mesh => 0,
            RendererKind::Skinned => 1,
            RendererKind::Billboard => 2,
        }
    }
}

/// Mesh statistics reported by the host for one renderer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStats {
    pub vertex_count: u32,
    pub submesh_count: u32,
}

/// One renderer as seen by the bake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RendererRef {
    pub id: RendererId,
    pub kind: RendererKind,
    /// World-space bounds
    pub bounds: Aabb,
    pub stats: MeshStats,
    /// User-set flag removing the renderer from bakes
    #[serde(default)]
    pub bake_excluded: bool,
}

impl RendererRef {
    pub fn mesh(id: u64, bounds: Aabb, stats: MeshStats) -> Self {
        Self {
            id: RendererId(id),
            kind: RendererKind::Mesh,
            bounds,
            stats,
            bake_excluded: false,
        }
    }

    pub fn with_kind(mut self, kind: RendererKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn excluded(mut self) -> Self {
        self.bake_excluded = true;
        self
    }

    /// A renderer can take part in a bake only if it has geometry and sane bounds.
    pub fn is_bakeable(&self) -> bool {
        !self.bake_excluded
            && self.bounds.is_valid()
            && self.stats.vertex_count > 0
            && self.stats.submesh_count > 0
    }
}
