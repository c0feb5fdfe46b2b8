//! Compact Visibility Store
//!
//! Per-location visibility sets. While a bake is running each location owns a
//! small vector; `complete_bake` packs them into CSR form (one offsets array
//! plus one flat `u16` index array), which is what gets persisted and read at
//! runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::groups::RendererIndexTable;
use super::hash::BakeHash;
use crate::error::StoreError;
use crate::world::SamplingGrid;

/// Visibility sets for every sampling location.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompactVisibilityStore {
    renderer_count: usize,
    /// Per-location sets, only used before completion
    raw: Vec<Vec<u16>>,
    /// CSR: `offsets[i]..offsets[i + 1]` index into `indices`
    offsets: Vec<u32>,
    indices: Vec<u16>,
    completed: bool,
}

impl CompactVisibilityStore {
    pub fn new(location_count: usize, renderer_count: usize) -> Self {
        Self {
            renderer_count,
            raw: vec![Vec::new(); location_count],
            offsets: Vec::new(),
            indices: Vec::new(),
            completed: false,
        }
    }

    /// Rebuild a completed store from persisted CSR arrays.
    pub fn from_compact(
        offsets: Vec<u32>,
        indices: Vec<u16>,
        renderer_count: usize,
    ) -> Result<Self, StoreError> {
        if offsets.first().copied().unwrap_or(0) != 0 {
            return Err(StoreError::Malformed("offsets must start at 0".into()));
        }
        if offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(StoreError::Malformed("offsets are not monotonic".into()));
        }
        let end = offsets.last().copied().unwrap_or(0) as usize;
        if end != indices.len() {
            return Err(StoreError::Malformed(format!(
                "last offset {end} does not match {} indices",
                indices.len()
            )));
        }
        if let Some(bad) = indices.iter().find(|&&i| i as usize >= renderer_count) {
            return Err(StoreError::Malformed(format!(
                "renderer index {bad} out of range ({renderer_count} renderers)"
            )));
        }
        let offsets = if offsets.is_empty() { vec![0] } else { offsets };
        Ok(Self {
            renderer_count,
            raw: Vec::new(),
            offsets,
            indices,
            completed: true,
        })
    }

    pub fn location_count(&self) -> usize {
        if self.completed {
            self.offsets.len().saturating_sub(1)
        } else {
            self.raw.len()
        }
    }

    pub fn renderer_count(&self) -> usize {
        self.renderer_count
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Store the visibility set of `location`.
    ///
    /// The set is sorted and deduplicated. With `validate`, renderer indices
    /// outside the renderer table are dropped with a warning.
    pub fn set_raw_data(
        &mut self,
        location: usize,
        visible: &[u16],
        validate: bool,
    ) -> Result<(), StoreError> {
        if self.completed {
            return Err(StoreError::AlreadyCompleted);
        }
        let len = self.raw.len();
        let renderer_count = self.renderer_count;
        let slot = self
            .raw
            .get_mut(location)
            .ok_or(StoreError::LocationOutOfRange {
                index: location,
                len,
            })?;

        let mut set: Vec<u16> = if validate {
            let (ok, bad): (Vec<u16>, Vec<u16>) = visible
                .iter()
                .partition(|&&i| (i as usize) < renderer_count);
            if !bad.is_empty() {
                log::warn!(
                    "[VisibilityStore] location {location}: dropped {} renderer indices >= {renderer_count}",
                    bad.len()
                );
            }
            ok
        } else {
            visible.to_vec()
        };
        set.sort_unstable();
        set.dedup();
        *slot = set;
        Ok(())
    }

    /// Pack the per-location sets into CSR form. Calling it again is a no-op.
    pub fn complete_bake(&mut self) {
        if self.completed {
            return;
        }
        let total: usize = self.raw.iter().map(Vec::len).sum();
        let mut offsets = Vec::with_capacity(self.raw.len() + 1);
        let mut indices = Vec::with_capacity(total);
        offsets.push(0u32);
        for set in self.raw.drain(..) {
            indices.extend_from_slice(&set);
            offsets.push(indices.len() as u32);
        }
        self.offsets = offsets;
        self.indices = indices;
        self.completed = true;
    }

    /// Visible renderer indices of `location`, sorted ascending.
    pub fn visible(&self, location: usize) -> Option<&[u16]> {
        if self.completed {
            let start = *self.offsets.get(location)? as usize;
            let end = *self.offsets.get(location + 1)? as usize;
            self.indices.get(start..end)
        } else {
            self.raw.get(location).map(Vec::as_slice)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[u16])> + '_ {
        (0..self.location_count()).filter_map(move |i| self.visible(i).map(|v| (i, v)))
    }

    /// CSR offsets (empty until completion).
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    /// CSR indices (empty until completion).
    pub fn indices(&self) -> &[u16] {
        &self.indices
    }
}

/// Why persisted bake data cannot be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotBakedReason {
    /// The bake never reached completion
    Incomplete,
    /// Scene or settings changed since the bake
    StaleHash,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BakeStatus {
    Baked,
    NotBaked(NotBakedReason),
}

/// Everything a finished bake produces.
#[derive(Clone, Debug, PartialEq)]
pub struct BakeData {
    pub bake_completed: bool,
    pub bake_hash: BakeHash,
    pub grid: SamplingGrid,
    pub store: CompactVisibilityStore,
    /// Unix timestamp (seconds) of bake completion
    pub render_date: u64,
    pub render_duration: Duration,
    pub renderers: RendererIndexTable,
}

impl BakeData {
    pub fn status(&self, current_hash: BakeHash) -> BakeStatus {
        if !self.bake_completed || !self.store.is_completed() {
            BakeStatus::NotBaked(NotBakedReason::Incomplete)
        } else if self.bake_hash != current_hash {
            BakeStatus::NotBaked(NotBakedReason::StaleHash)
        } else {
            BakeStatus::Baked
        }
    }
}

/// Serialized form of the bake duration (seconds, fractional).
pub(crate) fn duration_to_secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

pub(crate) fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs >= 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

/// Stats shown alongside a bake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub locations: usize,
    pub empty_locations: usize,
    pub total_entries: usize,
    pub max_entries: usize,
}

impl StoreStats {
    pub fn of(store: &CompactVisibilityStore) -> Self {
        let mut stats = StoreStats {
            locations: store.location_count(),
            ..Default::default()
        };
        for (_, set) in store.iter() {
            if set.is_empty() {
                stats.empty_locations += 1;
            }
            stats.total_entries += set.len();
            stats.max_entries = stats.max_entries.max(set.len());
        }
        stats
    }
}
