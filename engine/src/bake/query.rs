//! Point Visibility Query
//!
//! The swappable primitive behind the sampler: "which renderers are visible
//! from this point". Backends issue a query without blocking, and the sampler
//! later completes a whole batch of them at once. Results may come back in any
//! order; the caller matches them by handle.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::scene::RendererRef;
use crate::world::Aabb;

/// Opaque id of an issued query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryHandle(pub u64);

/// One renderer as seen by a query backend.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleTarget {
    /// Index in the bake's renderer table
    pub index: u16,
    pub bounds: Aabb,
    /// Whether this target blocks visibility of other targets
    pub occluder: bool,
}

impl SampleTarget {
    /// Targets in renderer-table order (`renderers[i]` becomes index `i`).
    pub fn from_renderers(renderers: &[RendererRef]) -> Vec<SampleTarget> {
        renderers
            .iter()
            .enumerate()
            .map(|(i, r)| SampleTarget {
                index: i as u16,
                bounds: r.bounds,
                occluder: r.kind.is_occluder(),
            })
            .collect()
    }
}

/// Parameters shared by every query of one bake.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QueryParams {
    pub max_sample_distance: f32,
    pub probe_shrink: f32,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            max_sample_distance: 500.0,
            probe_shrink: 0.05,
        }
    }
}

/// Result of completing one handle.
pub type QueryResult = (QueryHandle, Result<Vec<u16>, QueryError>);

pub trait PointVisibilityQuery {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Upload the renderer set. Must be called before `sample`.
    fn prepare(&mut self, targets: &[SampleTarget], params: QueryParams)
        -> Result<(), QueryError>;

    /// Issue a query without waiting for its result.
    fn sample(&mut self, world_pos: Vec3) -> Result<QueryHandle, QueryError>;

    /// Block until every handle in `handles` has a result.
    ///
    /// Each result is a sorted, duplicate-free list of renderer indices. The
    /// returned order is unspecified.
    fn complete(&mut self, handles: &[QueryHandle]) -> Vec<QueryResult>;

    /// Free the resources behind `handle`. Unknown handles are ignored.
    fn release(&mut self, handle: QueryHandle);

    /// Handles issued and not yet released.
    fn in_flight(&self) -> usize;

    /// Most queries that may be in flight at once, if the backend is bounded.
    fn slot_capacity(&self) -> Option<usize> {
        None
    }
}

impl<Q: PointVisibilityQuery + ?Sized> PointVisibilityQuery for Box<Q> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn prepare(
        &mut self,
        targets: &[SampleTarget],
        params: QueryParams,
    ) -> Result<(), QueryError> {
        (**self).prepare(targets, params)
    }

    fn sample(&mut self, world_pos: Vec3) -> Result<QueryHandle, QueryError> {
        (**self).sample(world_pos)
    }

    fn complete(&mut self, handles: &[QueryHandle]) -> Vec<QueryResult> {
        (**self).complete(handles)
    }

    fn release(&mut self, handle: QueryHandle) {
        (**self).release(handle)
    }

    fn in_flight(&self) -> usize {
        (**self).in_flight()
    }

    fn slot_capacity(&self) -> Option<usize> {
        (**self).slot_capacity()
    }
}
