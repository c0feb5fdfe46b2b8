//! Occlusion Bake Engine Library
//!
//! Offline visibility baking plus the runtime bookkeeping of an instanced
//! renderer.
//!
//! # Modules
//!
//! - [`bake`] - Sampling locations, batched visibility queries, the bake
//!   state machine and the multi-bake queue (feature `bake`)
//! - [`visibility`] - Compact visibility store, bake hash, binary artifact
//!   and the runtime lookup
//! - [`instancing`] - Prototype validation, render source registry, instance
//!   managers and per-camera visibility buffers
//! - [`scene`] - Renderer references and the scene host interface
//! - [`world`] - Bounds, bake volumes and sampling grids
//! - [`gpu`] - Headless wgpu device shared by the GPU backends
//! - [`config`] - Bake settings
//!
//! # Example
//!
//! ```ignore
//! use occlusion_bake_engine::bake::{BakeContext, BakeOrchestrator, RaycastVisibilityQuery};
//! use occlusion_bake_engine::config::BakeSettings;
//!
//! let context = BakeContext::new(BakeSettings::default());
//! let mut orchestrator = BakeOrchestrator::new(RaycastVisibilityQuery::new(), context);
//! orchestrator.start(request)?;
//!
//! // Once per host tick
//! orchestrator.step(&mut host);
//!
//! if let Some(outcome) = orchestrator.take_outcome() {
//!     let report = outcome.result?;
//!     println!("baked {} locations", report.data.store.location_count());
//! }
//! ```

pub mod config;
pub mod error;
pub mod gpu;
pub mod instancing;
pub mod scene;
pub mod visibility;
pub mod world;

#[cfg(feature = "bake")]
pub mod bake;

pub use config::{BakeSettings, SamplerBackendKind};
#[cfg(feature = "bake")]
pub use error::BakeError;
pub use error::{
    ArtifactError, ConfigError, PrototypeError, QueryError, RegistryError, SceneError, StoreError,
};
pub use gpu::{HeadlessGpu, HeadlessGpuConfig};
pub use visibility::{BakeData, BakeHash, BakeStatus, CompactVisibilityStore, OcclusionLookup};
pub use world::{Aabb, BakeVolume, GridLayout, SamplingGrid};
