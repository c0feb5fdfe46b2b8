//! Bake groups
//!
//! A bake partitions the scene's renderers into groups. Groups are filtered
//! once (excluded, degenerate and duplicate renderers removed) and then
//! flattened into the renderer index table whose `u16` indices appear in the
//! visibility store.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::scene::{RendererId, RendererRef};

/// Largest number of renderers addressable by a `u16` visibility index.
pub const MAX_BAKE_RENDERERS: usize = u16::MAX as usize + 1;

/// One partition of the occluder/occludee set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BakeGroup {
    pub name: String,
    pub renderers: Vec<RendererRef>,
}

impl BakeGroup {
    pub fn new(name: impl Into<String>, renderers: Vec<RendererRef>) -> Self {
        Self {
            name: name.into(),
            renderers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.renderers.is_empty()
    }
}

/// What [`strip_groups`] removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StripReport {
    pub excluded: usize,
    pub invalid: usize,
    pub duplicate: usize,
}

impl StripReport {
    pub fn total(&self) -> usize {
        self.excluded + self.invalid + self.duplicate
    }
}

/// Remove excluded, non-bakeable and duplicate renderers.
///
/// A renderer listed in several groups stays in the first one. Group order and
/// renderer order within a group are preserved, so the result is deterministic.
pub fn strip_groups(groups: &[BakeGroup]) -> (Vec<BakeGroup>, StripReport) {
    let mut report = StripReport::default();
    let mut seen: HashSet<RendererId> = HashSet::new();
    let stripped = groups
        .iter()
        .map(|group| {
            let renderers = group
                .renderers
                .iter()
                .filter(|r| {
                    if r.bake_excluded {
                        report.excluded += 1;
                        return false;
                    }
                    if !r.is_bakeable() {
                        report.invalid += 1;
                        return false;
                    }
                    if !seen.insert(r.id) {
                        report.duplicate += 1;
                        return false;
                    }
                    true
                })
                .cloned()
                .collect();
            BakeGroup {
                name: group.name.clone(),
                renderers,
            }
        })
        .collect();
    (stripped, report)
}

/// Flat, group-major table mapping visibility indices to renderers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RendererIndexTable {
    pub renderer_ids: Vec<RendererId>,
    /// `group_offsets[g]..group_offsets[g + 1]` are the indices of group `g`
    pub group_offsets: Vec<u32>,
}

impl RendererIndexTable {
    pub fn from_groups(groups: &[BakeGroup]) -> Self {
        let mut renderer_ids = Vec::new();
        let mut group_offsets = Vec::with_capacity(groups.len() + 1);
        group_offsets.push(0);
        for group in groups {
            renderer_ids.extend(group.renderers.iter().map(|r| r.id));
            group_offsets.push(renderer_ids.len() as u32);
        }
        Self {
            renderer_ids,
            group_offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.renderer_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.renderer_ids.is_empty()
    }

    pub fn index_of(&self, id: RendererId) -> Option<u16> {
        self.renderer_ids
            .iter()
            .position(|r| *r == id)
            .map(|i| i as u16)
    }

    pub fn renderer(&self, index: u16) -> Option<RendererId> {
        self.renderer_ids.get(index as usize).copied()
    }

    /// Group that owns visibility index `index`.
    pub fn group_of(&self, index: u16) -> Option<usize> {
        let index = index as u32;
        self.group_offsets
            .windows(2)
            .position(|w| index >= w[0] && index < w[1])
    }
}
