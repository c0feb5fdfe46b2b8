//! Sampling Location Table
//!
//! Generates the ordered list of positions a bake samples from. The index of a
//! location is its identity for the whole bake: results are written by index,
//! never by completion order, so locations are never reordered or dropped.
//! Locations that no provider marks active are kept with `active == false` and
//! baked as empty sets.

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::scene::RendererRef;
use crate::world::{Aabb, BakeVolume, GridLayout, SamplingGrid};

/// Decides whether a candidate location is worth sampling.
pub trait ActiveProvider {
    fn is_active(&self, world_pos: Vec3) -> bool;
}

/// Active inside any of the listed boxes.
#[derive(Clone, Debug, Default)]
pub struct InsideBoundsProvider {
    pub bounds: Vec<Aabb>,
}

impl InsideBoundsProvider {
    pub fn new(bounds: Vec<Aabb>) -> Self {
        Self { bounds }
    }
}

impl ActiveProvider for InsideBoundsProvider {
    fn is_active(&self, world_pos: Vec3) -> bool {
        self.bounds.iter().any(|b| b.contains_point(world_pos))
    }
}

/// Active at or above a world height.
#[derive(Clone, Copy, Debug)]
pub struct AboveHeightProvider {
    pub min_height: f32,
}

impl ActiveProvider for AboveHeightProvider {
    fn is_active(&self, world_pos: Vec3) -> bool {
        world_pos.y >= self.min_height
    }
}

/// Active when the location is not buried inside an occluder.
#[derive(Clone, Debug, Default)]
pub struct OutsideRenderersProvider {
    occluders: Vec<Aabb>,
}

impl OutsideRenderersProvider {
    pub fn from_renderers<'a>(renderers: impl IntoIterator<Item = &'a RendererRef>) -> Self {
        Self {
            occluders: renderers
                .into_iter()
                .filter(|r| r.kind.is_occluder())
                .map(|r| r.bounds)
                .collect(),
        }
    }
}

impl ActiveProvider for OutsideRenderersProvider {
    fn is_active(&self, world_pos: Vec3) -> bool {
        !self.occluders.iter().any(|b| b.contains_point(world_pos))
    }
}

/// Serializable provider selection for bake requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderSpec {
    InsideBounds(Vec<Aabb>),
    AboveHeight(f32),
    /// Skip locations buried inside the bake's occluders
    OutsideRenderers,
}

impl ProviderSpec {
    /// Build the provider; `renderers` feeds [`ProviderSpec::OutsideRenderers`].
    pub fn build(&self, renderers: &[RendererRef]) -> Box<dyn ActiveProvider> {
        match self {
            ProviderSpec::InsideBounds(bounds) => Box::new(InsideBoundsProvider::new(bounds.clone())),
            ProviderSpec::AboveHeight(min_height) => Box::new(AboveHeightProvider {
                min_height: *min_height,
            }),
            ProviderSpec::OutsideRenderers => {
                Box::new(OutsideRenderersProvider::from_renderers(renderers))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingLocation {
    pub position: Vec3,
    pub active: bool,
}

/// Ordered sampling positions for one bake.
#[derive(Clone, Debug)]
pub struct SamplingLocationTable {
    grid: SamplingGrid,
    locations: Vec<SamplingLocation>,
}

impl SamplingLocationTable {
    /// Enumerate every location of `layout` inside `volume`.
    ///
    /// A location is active when any provider says so; with no providers every
    /// location is active.
    pub fn generate(
        volume: BakeVolume,
        layout: GridLayout,
        providers: &[&dyn ActiveProvider],
    ) -> Self {
        Self::from_grid(SamplingGrid::new(volume, layout), providers)
    }

    pub fn from_grid(grid: SamplingGrid, providers: &[&dyn ActiveProvider]) -> Self {
        let locations = (0..grid.location_count())
            .filter_map(|i| grid.world_position(i))
            .map(|position| SamplingLocation {
                position,
                active: providers.is_empty() || providers.iter().any(|p| p.is_active(position)),
            })
            .collect();
        Self { grid, locations }
    }

    pub fn grid(&self) -> &SamplingGrid {
        &self.grid
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    pub fn location(&self, index: usize) -> Option<&SamplingLocation> {
        self.locations.get(index)
    }

    pub fn locations(&self) -> &[SamplingLocation] {
        &self.locations
    }

    pub fn active_count(&self) -> usize {
        self.locations.iter().filter(|l| l.active).count()
    }
}
