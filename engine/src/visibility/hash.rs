//! Bake hash
//!
//! Fingerprint of every input that changes bake results: grid, distance,
//! group membership and where each occluder sits. Computed once when a
//! bake finishes and again at load time; a mismatch marks the data stale.
//!
//! The hash is FNV-1a 64 over explicitly little-endian bytes so it is stable
//! across processes, builds and platforms. `std`'s `DefaultHasher` is not.

use std::fmt;
use std::hash::Hasher;

use fnv::FnvHasher;
use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::groups::{BakeGroup, strip_groups};
use crate::world::{GridLayout, SamplingGrid};

/// Bumped whenever the hashed byte stream changes shape.
const HASH_FORMAT_VERSION: u32 = 2;

/// Stable 64-bit bake fingerprint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BakeHash(pub u64);

impl fmt::Display for BakeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl BakeHash {
    /// Hash the stripped groups together with the settings that affect results.
    ///
    /// `groups` must already be stripped (see
    /// [`strip_groups`](super::groups::strip_groups)); hashing raw groups would
    /// make excluded renderers invalidate bakes.
    pub fn compute(groups: &[BakeGroup], grid: &SamplingGrid, max_sample_distance: f32) -> Self {
        let mut h = LeHasher::default();
        h.u32(HASH_FORMAT_VERSION);

        // Grid
        h.vec3(grid.volume.center);
        h.vec3(grid.volume.size);
        let q = grid.volume.rotation;
        for c in [q.x, q.y, q.z, q.w] {
            h.f32(c);
        }
        match &grid.layout {
            GridLayout::Regular { cell_size } => {
                h.u8(0);
                h.vec3(*cell_size);
            }
            GridLayout::Custom { local_positions } => {
                h.u8(1);
                h.u32(local_positions.len() as u32);
                for p in local_positions {
                    h.vec3(*p);
                }
            }
        }
        h.u32(grid.dims.x);
        h.u32(grid.dims.y);
        h.u32(grid.dims.z);
        h.f32(max_sample_distance);

        // Membership
        h.u32(groups.len() as u32);
        for group in groups {
            h.u32(group.renderers.len() as u32);
            for r in &group.renderers {
                h.u64(r.id.0);
                h.u8(r.kind.hash_tag());
                h.vec3(r.bounds.min);
                h.vec3(r.bounds.max);
            }
        }

        BakeHash(h.finish())
    }

    /// Strip `raw_groups` the way a bake does, then hash. Use this at load
    /// time to check persisted data against the current scene.
    pub fn for_raw_groups(
        raw_groups: &[BakeGroup],
        grid: &SamplingGrid,
        max_sample_distance: f32,
    ) -> Self {
        let (stripped, _) = strip_groups(raw_groups);
        Self::compute(&stripped, grid, max_sample_distance)
    }
}

#[derive(Default)]
struct LeHasher(FnvHasher);

impl LeHasher {
    fn u8(&mut self, v: u8) {
        self.0.write(&[v]);
    }

    fn u32(&mut self, v: u32) {
        self.0.write(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.write(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        // -0.0 and 0.0 hash alike
        let v = if v == 0.0 { 0.0 } else { v };
        self.u32(v.to_bits());
    }

    fn vec3(&mut self, v: Vec3) {
        self.f32(v.x);
        self.f32(v.y);
        self.f32(v.z);
    }

    fn finish(&self) -> u64 {
        self.0.finish()
    }
}
