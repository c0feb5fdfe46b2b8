//! Runtime lookup of baked visibility.

use glam::Vec3;

use super::hash::BakeHash;
use super::store::{BakeData, BakeStatus};

/// Read-only view over bake data that is known to be current.
#[derive(Debug)]
pub struct OcclusionLookup {
    data: BakeData,
}

impl OcclusionLookup {
    /// Accept `data` only if it is completed and matches `current_hash`.
    /// Otherwise the data is handed back together with its status.
    pub fn new(data: BakeData, current_hash: BakeHash) -> Result<Self, (BakeData, BakeStatus)> {
        match data.status(current_hash) {
            BakeStatus::Baked => Ok(Self { data }),
            status => {
                log::warn!(
                    "[OcclusionLookup] refusing bake data ({status:?}, baked {}, current {current_hash})",
                    data.bake_hash
                );
                Err((data, status))
            }
        }
    }

    pub fn data(&self) -> &BakeData {
        &self.data
    }

    /// Renderer indices visible from `world_pos`, or `None` outside the grid.
    pub fn visible_renderers(&self, world_pos: Vec3) -> Option<&[u16]> {
        let cell = self.data.grid.cell_index_for_position(world_pos)?;
        self.data.store.visible(cell)
    }

    /// Positions outside the grid report everything as visible.
    pub fn is_visible(&self, world_pos: Vec3, renderer_index: u16) -> bool {
        match self.visible_renderers(world_pos) {
            Some(set) => set.binary_search(&renderer_index).is_ok(),
            None => true,
        }
    }
}
