//! World Module
//!
//! World-space geometry shared by the bake and runtime halves: bounding boxes,
//! bake volumes and the sampling grid laid out inside them.

pub mod bounds;
pub mod grid;

pub use bounds::{Aabb, SEGMENT_EPSILON};
pub use grid::{BakeVolume, GridLayout, SamplingGrid};
