//! Axis-Aligned Bounds
//!
//! World-space bounding boxes used for renderer bounds, bake volumes and the
//! segment tests behind point-visibility sampling.

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Entry parameters closer than this to the segment origin do not count as
/// blocking: a sample taken inside a box is not occluded by that box.
pub const SEGMENT_EPSILON: f32 = 1e-4;

/// Axis-aligned bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Box centered at `center` with full extents `size`.
    pub fn from_center_size(center: Vec3, size: Vec3) -> Self {
        let half = size * 0.5;
        Self {
            min: center - half,
            max: center + half,
        }
    }

    /// Empty box that absorbs the first point passed to [`Aabb::include_point`].
    pub fn empty() -> Self {
        Self {
            min: Vec3::splat(f32::INFINITY),
            max: Vec3::splat(f32::NEG_INFINITY),
        }
    }

    #[inline]
    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    #[inline]
    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    /// Finite and not inverted. Zero-thickness boxes (quads, billboards) are valid.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min.cmple(self.max).all()
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn include_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    /// Euclidean distance from `p` to the closest point of the box (0 inside).
    pub fn distance_to_point(&self, p: Vec3) -> f32 {
        let closest = p.clamp(self.min, self.max);
        closest.distance(p)
    }

    /// Center plus the eight corners pulled toward the center by `shrink`
    /// (0.0 = exact corners). Used as probe points for visibility tests.
    pub fn probe_points(&self, shrink: f32) -> [Vec3; 9] {
        let c = self.center();
        let lo = self.min.lerp(c, shrink);
        let hi = self.max.lerp(c, shrink);
        [
            c,
            Vec3::new(lo.x, lo.y, lo.z),
            Vec3::new(hi.x, lo.y, lo.z),
            Vec3::new(lo.x, hi.y, lo.z),
            Vec3::new(hi.x, hi.y, lo.z),
            Vec3::new(lo.x, lo.y, hi.z),
            Vec3::new(hi.x, lo.y, hi.z),
            Vec3::new(lo.x, hi.y, hi.z),
            Vec3::new(hi.x, hi.y, hi.z),
        ]
    }

    /// Slab test for the segment `origin -> target`.
    ///
    /// Returns the entry parameter `t` (fraction of the segment, may be negative
    /// when `origin` is inside the box) or `None` if the segment misses.
    pub fn segment_entry(&self, origin: Vec3, target: Vec3) -> Option<f32> {
        let dir = target - origin;
        let mut t_enter = f32::NEG_INFINITY;
        let mut t_exit = f32::INFINITY;

        for axis in 0..3 {
            let o = origin[axis];
            let d = dir[axis];
            let (lo, hi) = (self.min[axis], self.max[axis]);
            if d.abs() < f32::EPSILON {
                if o < lo || o > hi {
                    return None;
                }
                continue;
            }
            let inv = 1.0 / d;
            let mut t0 = (lo - o) * inv;
            let mut t1 = (hi - o) * inv;
            if t0 > t1 {
                std::mem::swap(&mut t0, &mut t1);
            }
            t_enter = t_enter.max(t0);
            t_exit = t_exit.min(t1);
            if t_enter > t_exit {
                return None;
            }
        }

        if t_exit < 0.0 || t_enter > 1.0 {
            return None;
        }
        Some(t_enter)
    }

    /// True if the segment enters this box strictly between its endpoints.
    pub fn blocks_segment(&self, origin: Vec3, target: Vec3) -> bool {
        matches!(
            self.segment_entry(origin, target),
            Some(t) if t > SEGMENT_EPSILON && t < 1.0 - SEGMENT_EPSILON
        )
    }
}

impl Default for Aabb {
    fn default() -> Self {
        Self::from_center_size(Vec3::ZERO, Vec3::ONE)
    }
}
