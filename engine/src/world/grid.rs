//! Sampling Grid
//!
//! Describes where inside a bake volume visibility is sampled. The grid is the
//! serializable half of the sampling location table: the bake writes it into
//! the artifact metadata, and the runtime uses it to map a world position back
//! to the cell whose visibility set applies.
//!
//! ## Index order
//! Regular grids are indexed `x + nx * (y + ny * z)` with X varying fastest.
//! Custom grids keep the order in which positions were supplied.

use glam::{Quat, UVec3, Vec3};
use serde::{Deserialize, Serialize};

use super::bounds::Aabb;

/// Oriented box that bounds a bake.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BakeVolume {
    /// World-space center of the volume
    pub center: Vec3,
    /// Full extents along the volume's local axes
    pub size: Vec3,
    /// Orientation of the volume's local axes
    pub rotation: Quat,
}

impl Default for BakeVolume {
    fn default() -> Self {
        Self {
            center: Vec3::ZERO,
            size: Vec3::splat(20.0),
            rotation: Quat::IDENTITY,
        }
    }
}

impl BakeVolume {
    pub fn new(center: Vec3, size: Vec3) -> Self {
        Self {
            center,
            size,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Finite, strictly positive extents and a normalized rotation.
    pub fn is_valid(&self) -> bool {
        self.center.is_finite()
            && self.size.is_finite()
            && self.size.cmpgt(Vec3::ZERO).all()
            && self.rotation.is_normalized()
    }

    #[inline]
    pub fn to_world(&self, local: Vec3) -> Vec3 {
        self.center + self.rotation * local
    }

    #[inline]
    pub fn to_local(&self, world: Vec3) -> Vec3 {
        self.rotation.inverse() * (world - self.center)
    }

    /// World-space AABB enclosing the (possibly rotated) volume.
    pub fn world_aabb(&self) -> Aabb {
        let half = self.size * 0.5;
        let mut aabb = Aabb::empty();
        for sx in [-1.0, 1.0] {
            for sy in [-1.0, 1.0] {
                for sz in [-1.0, 1.0] {
                    aabb.include_point(self.to_world(half * Vec3::new(sx, sy, sz)));
                }
            }
        }
        aabb
    }
}

/// How sampling positions are laid out inside a [`BakeVolume`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum GridLayout {
    /// Evenly spaced cell centers; `cell_size` is the requested spacing, the
    /// effective spacing is stretched so cells tile the volume exactly.
    Regular { cell_size: Vec3 },
    /// User-supplied positions in volume-local space.
    Custom { local_positions: Vec<Vec3> },
}

impl Default for GridLayout {
    fn default() -> Self {
        GridLayout::Regular {
            cell_size: Vec3::splat(2.0),
        }
    }
}

/// Fully resolved sampling grid (volume + layout + derived dimensions).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplingGrid {
    pub volume: BakeVolume,
    pub layout: GridLayout,
    /// Cells per axis for regular layouts; `(n, 1, 1)` for custom layouts.
    pub dims: UVec3,
}

impl SamplingGrid {
    pub fn new(volume: BakeVolume, layout: GridLayout) -> Self {
        let dims = match &layout {
            GridLayout::Regular { cell_size } => {
                let safe = cell_size.max(Vec3::splat(f32::EPSILON));
                let counts = (volume.size / safe).ceil().max(Vec3::ONE);
                UVec3::new(counts.x as u32, counts.y as u32, counts.z as u32)
            }
            GridLayout::Custom { local_positions } => {
                UVec3::new(local_positions.len() as u32, 1, 1)
            }
        };
        Self {
            volume,
            layout,
            dims,
        }
    }

    pub fn location_count(&self) -> usize {
        match &self.layout {
            GridLayout::Regular { .. } => {
                self.dims.x as usize * self.dims.y as usize * self.dims.z as usize
            }
            GridLayout::Custom { local_positions } => local_positions.len(),
        }
    }

    /// Effective cell spacing of a regular grid (volume size / cell counts).
    pub fn effective_cell_size(&self) -> Vec3 {
        self.volume.size / self.dims.as_vec3()
    }

    /// Volume-local position of location `index`.
    pub fn local_position(&self, index: usize) -> Option<Vec3> {
        match &self.layout {
            GridLayout::Regular { .. } => {
                if index >= self.location_count() {
                    return None;
                }
                let nx = self.dims.x as usize;
                let ny = self.dims.y as usize;
                let x = index % nx;
                let y = (index / nx) % ny;
                let z = index / (nx * ny);
                let cell = self.effective_cell_size();
                let cell_coord = Vec3::new(x as f32, y as f32, z as f32) + Vec3::splat(0.5);
                Some(cell_coord * cell - self.volume.size * 0.5)
            }
            GridLayout::Custom { local_positions } => local_positions.get(index).copied(),
        }
    }

    pub fn world_position(&self, index: usize) -> Option<Vec3> {
        self.local_position(index).map(|p| self.volume.to_world(p))
    }

    /// Map a world position to the location whose visibility set applies.
    ///
    /// Regular grids return `None` outside the volume. Custom grids return the
    /// nearest supplied position (`None` only when there are no positions).
    pub fn cell_index_for_position(&self, world: Vec3) -> Option<usize> {
        let local = self.volume.to_local(world);
        match &self.layout {
            GridLayout::Regular { .. } => {
                let half = self.volume.size * 0.5;
                if local.cmplt(-half).any() || local.cmpgt(half).any() {
                    return None;
                }
                let cell = self.effective_cell_size();
                let coord = ((local + half) / cell).floor();
                let max = (self.dims - UVec3::ONE).as_vec3();
                let coord = coord.clamp(Vec3::ZERO, max);
                let (x, y, z) = (coord.x as usize, coord.y as usize, coord.z as usize);
                Some(x + self.dims.x as usize * (y + self.dims.y as usize * z))
            }
            GridLayout::Custom { local_positions } => local_positions
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.distance_squared(local)
                        .total_cmp(&b.distance_squared(local))
                })
                .map(|(i, _)| i),
        }
    }
}
