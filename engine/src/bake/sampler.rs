//! Batched Occluder Sampler
//!
//! Keeps at most `batch_count` visibility queries in flight, never more than
//! the backend has slots for. `sample_position`
//! refuses once the batch is full; `complete_pending` is the only point that
//! blocks on the backend. Results are written to the store by the sample
//! index recorded at issue time, so completion order never matters.
//!
//! Every issued handle is released exactly once, whether its batch completes,
//! is aborted, or the sampler is dropped mid-batch.

use std::collections::HashMap;

use glam::Vec3;

use super::query::{PointVisibilityQuery, QueryHandle, QueryParams, SampleTarget};
use crate::error::{BakeError, QueryError};
use crate::visibility::CompactVisibilityStore;

/// Issued query together with the location it belongs to.
#[derive(Clone, Copy, Debug)]
struct PendingBakeHandle {
    sample_index: usize,
    query: QueryHandle,
}

/// Lifetime counters. `issued == released` whenever nothing is pending.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SamplerCounters {
    pub issued: usize,
    pub completed: usize,
    pub released: usize,
    pub max_pending: usize,
}

pub struct BatchedOccluderSampler<Q: PointVisibilityQuery> {
    backend: Q,
    batch_count: usize,
    validate: bool,
    pending: Vec<PendingBakeHandle>,
    counters: SamplerCounters,
}

impl<Q: PointVisibilityQuery> BatchedOccluderSampler<Q> {
    pub fn new(backend: Q, batch_count: usize, validate: bool) -> Self {
        let mut sampler = Self {
            backend,
            batch_count: 1,
            validate,
            pending: Vec::new(),
            counters: SamplerCounters::default(),
        };
        sampler.set_batch_count(batch_count);
        sampler
    }

    pub fn backend(&self) -> &Q {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Q {
        &mut self.backend
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// Set the batch size, clamped to the backend's slot capacity.
    pub fn set_batch_count(&mut self, batch_count: usize) {
        let mut batch_count = batch_count.max(1);
        if let Some(capacity) = self.backend.slot_capacity()
            && batch_count > capacity
        {
            log::warn!(
                "[Sampler] batch count {batch_count} exceeds {} slot capacity {capacity}; clamping",
                self.backend.name()
            );
            batch_count = capacity.max(1);
        }
        self.batch_count = batch_count;
    }

    pub fn set_validate(&mut self, validate: bool) {
        self.validate = validate;
    }

    pub fn counters(&self) -> SamplerCounters {
        self.counters
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.batch_count
    }

    /// Hand the renderer set to the backend.
    pub fn prepare(&mut self, targets: &[SampleTarget], params: QueryParams) -> Result<(), BakeError> {
        if self.has_pending() {
            self.abort();
        }
        self.backend.prepare(targets, params)?;
        Ok(())
    }

    /// Issue a query for location `sample_index`.
    pub fn sample_position(&mut self, sample_index: usize, position: Vec3) -> Result<(), BakeError> {
        if self.is_full() {
            return Err(BakeError::BatchFull(self.pending.len()));
        }
        let query = self.backend.sample(position)?;
        self.pending.push(PendingBakeHandle {
            sample_index,
            query,
        });
        self.counters.issued += 1;
        self.counters.max_pending = self.counters.max_pending.max(self.pending.len());
        Ok(())
    }

    /// Wait for the pending batch, store each result at its sample index and
    /// release every handle. Returns the number of results written.
    ///
    /// All handles are released even when some results fail; the first error
    /// is returned afterwards.
    pub fn complete_pending(&mut self, store: &mut CompactVisibilityStore) -> Result<usize, BakeError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let batch = std::mem::take(&mut self.pending);
        let by_handle: HashMap<QueryHandle, usize> =
            batch.iter().map(|p| (p.query, p.sample_index)).collect();
        let handles: Vec<QueryHandle> = batch.iter().map(|p| p.query).collect();

        let mut first_error: Option<BakeError> = None;
        let mut written = 0;
        let results = self.backend.complete(&handles);
        if results.len() < handles.len() {
            first_error = Some(BakeError::Query(QueryError::Readback(format!(
                "backend returned {} of {} results",
                results.len(),
                handles.len()
            ))));
        }
        for (handle, result) in results {
            let Some(&sample_index) = by_handle.get(&handle) else {
                log::warn!("[Sampler] backend returned unrequested handle {handle:?}");
                continue;
            };
            let outcome = result
                .map_err(BakeError::from)
                .and_then(|visible| {
                    store
                        .set_raw_data(sample_index, &visible, self.validate)
                        .map_err(BakeError::from)
                });
            match outcome {
                Ok(()) => {
                    written += 1;
                    self.counters.completed += 1;
                }
                Err(e) => {
                    log::error!("[Sampler] sample {sample_index} failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }

        for pending in &batch {
            self.backend.release(pending.query);
            self.counters.released += 1;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Complete and release every pending query, discarding results.
    pub fn abort(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        let handles: Vec<QueryHandle> = batch.iter().map(|p| p.query).collect();
        let discarded = self.backend.complete(&handles);
        log::debug!(
            "[Sampler] aborted batch: discarded {} results",
            discarded.len()
        );
        for handle in handles {
            self.backend.release(handle);
            self.counters.released += 1;
        }
    }
}

impl<Q: PointVisibilityQuery> Drop for BatchedOccluderSampler<Q> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bake::raycast::RaycastVisibilityQuery;
    use crate::world::Aabb;

    fn targets() -> Vec<SampleTarget> {
        vec![SampleTarget {
            index: 0,
            bounds: Aabb::from_center_size(Vec3::ZERO, Vec3::ONE),
            occluder: true,
        }]
    }

    fn sampler(batch: usize) -> BatchedOccluderSampler<RaycastVisibilityQuery> {
        let mut s = BatchedOccluderSampler::new(RaycastVisibilityQuery::new(), batch, true);
        s.prepare(&targets(), QueryParams::default()).unwrap();
        s
    }

    #[test]
    fn test_refuses_when_full() {
        let mut s = sampler(2);
        s.sample_position(0, Vec3::ZERO).unwrap();
        s.sample_position(1, Vec3::ZERO).unwrap();
        assert!(s.is_full());
        assert!(matches!(
            s.sample_position(2, Vec3::ZERO),
            Err(BakeError::BatchFull(2))
        ));
        assert_eq!(s.counters().issued, 2);
    }

    #[test]
    fn test_complete_writes_and_releases() {
        let mut s = sampler(4);
        let mut store = CompactVisibilityStore::new(3, 1);
        s.sample_position(2, Vec3::new(3.0, 0.0, 0.0)).unwrap();
        s.sample_position(0, Vec3::ZERO).unwrap();
        assert_eq!(s.complete_pending(&mut store).unwrap(), 2);
        assert_eq!(store.visible(0), Some(&[0u16][..]));
        assert_eq!(store.visible(1), Some(&[][..]));
        assert_eq!(store.visible(2), Some(&[0u16][..]));
        assert_eq!(s.backend().in_flight(), 0);
        let c = s.counters();
        assert_eq!((c.issued, c.completed, c.released), (2, 2, 2));
    }

    #[test]
    fn test_abort_releases_everything() {
        let mut s = sampler(4);
        s.sample_position(0, Vec3::ZERO).unwrap();
        s.sample_position(1, Vec3::ZERO).unwrap();
        s.abort();
        assert!(!s.has_pending());
        assert_eq!(s.backend().in_flight(), 0);
        assert_eq!(s.counters().released, 2);
        assert_eq!(s.counters().completed, 0);
    }

    #[test]
    fn test_bad_location_reported_after_release() {
        let mut s = sampler(2);
        let mut store = CompactVisibilityStore::new(1, 1);
        s.sample_position(5, Vec3::ZERO).unwrap();
        assert!(matches!(
            s.complete_pending(&mut store),
            Err(BakeError::Store(_))
        ));
        assert_eq!(s.backend().in_flight(), 0);
    }
}
