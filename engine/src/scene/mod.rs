//! Scene Module
//!
//! External collaborators of the bake: renderer references and the scene
//! host that saves, duplicates, merges and restores scenes.

pub mod host;
pub mod memory;
pub mod renderer;

pub use host::{SaveOutcome, SceneHost, ScenePath, SceneState};
pub use memory::{HostCall, MemorySceneHost, SceneDescription, TEMP_SCENE_SUFFIX};
pub use renderer::{MeshStats, RendererId, RendererKind, RendererRef};
