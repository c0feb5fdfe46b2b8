//! CPU point-visibility backend
//!
//! Segment tests against renderer bounds. The same rule runs in
//! `point_visibility.wgsl` for the GPU backend:
//!
//! A target is visible from `p` when its bounds are within the sample
//! distance and at least one of its nine probe points can be reached from
//! `p` without entering another occluder's bounds. An occluder containing `p`
//! does not block (its entry parameter is not past the segment origin).

use std::collections::HashMap;

use glam::Vec3;

use super::query::{PointVisibilityQuery, QueryHandle, QueryParams, QueryResult, SampleTarget};
use crate::error::QueryError;

/// Visible target indices from `p`, sorted ascending.
pub fn evaluate_visibility(p: Vec3, targets: &[SampleTarget], params: QueryParams) -> Vec<u16> {
    let mut visible = Vec::new();
    for (j, target) in targets.iter().enumerate() {
        if target.bounds.distance_to_point(p) > params.max_sample_distance {
            continue;
        }
        let reachable = target
            .bounds
            .probe_points(params.probe_shrink)
            .iter()
            .any(|&probe| {
                !targets.iter().enumerate().any(|(k, other)| {
                    k != j && other.occluder && other.bounds.blocks_segment(p, probe)
                })
            });
        if reachable {
            visible.push(target.index);
        }
    }
    visible.sort_unstable();
    visible.dedup();
    visible
}

/// CPU backend. Queries are recorded on `sample` and evaluated on `complete`.
#[derive(Debug, Default)]
pub struct RaycastVisibilityQuery {
    targets: Vec<SampleTarget>,
    params: QueryParams,
    prepared: bool,
    next_handle: u64,
    /// Live queries: position plus the cached result once completed
    live: HashMap<u64, (Vec3, Option<Vec<u16>>)>,
}

impl RaycastVisibilityQuery {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PointVisibilityQuery for RaycastVisibilityQuery {
    fn name(&self) -> &'static str {
        "cpu-raycast"
    }

    fn prepare(&mut self, targets: &[SampleTarget], params: QueryParams) -> Result<(), QueryError> {
        if !self.live.is_empty() {
            log::warn!(
                "[RaycastQuery] prepare with {} live queries; dropping them",
                self.live.len()
            );
            self.live.clear();
        }
        self.targets = targets.to_vec();
        self.params = params;
        self.prepared = true;
        Ok(())
    }

    fn sample(&mut self, world_pos: Vec3) -> Result<QueryHandle, QueryError> {
        if !self.prepared {
            return Err(QueryError::NotPrepared);
        }
        self.next_handle += 1;
        let id = self.next_handle;
        self.live.insert(id, (world_pos, None));
        Ok(QueryHandle(id))
    }

    fn complete(&mut self, handles: &[QueryHandle]) -> Vec<QueryResult> {
        handles
            .iter()
            .map(|&handle| {
                let Some((pos, cached)) = self.live.get_mut(&handle.0) else {
                    return (handle, Err(QueryError::UnknownHandle(handle.0)));
                };
                let result = cached
                    .get_or_insert_with(|| evaluate_visibility(*pos, &self.targets, self.params))
                    .clone();
                (handle, Ok(result))
            })
            .collect()
    }

    fn release(&mut self, handle: QueryHandle) {
        self.live.remove(&handle.0);
    }

    fn in_flight(&self) -> usize {
        self.live.len()
    }
}
