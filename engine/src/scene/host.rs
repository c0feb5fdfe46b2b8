//! Scene host interface
//!
//! The narrow slice of the editor's scene machinery the bake depends on.
//! Everything that touches scene files or the live scene goes through here,
//! so the orchestrator can be driven headless in tests.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::renderer::{RendererId, RendererRef};
use crate::error::SceneError;

/// Scene identity (its asset path).
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScenePath(pub String);

impl ScenePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScenePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of asking the host to save a scene before baking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The user refused to save; the bake must not start.
    Declined,
}

/// Open/loaded state of one scene, used to make merge/split symmetric.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneState {
    pub path: ScenePath,
    pub loaded: bool,
}

/// Scene operations required by the bake orchestrator.
pub trait SceneHost {
    /// Renderers currently present in `scene`.
    fn renderers_in_scene(&self, scene: &ScenePath) -> Result<Vec<RendererRef>, SceneError>;

    /// Persist `scene` before it is replaced by a temporary copy.
    fn save_scene(&mut self, scene: &ScenePath) -> Result<SaveOutcome, SceneError>;

    /// Open an additive duplicate of `scene` and make it the active scene.
    fn duplicate_scene_additive(&mut self, scene: &ScenePath) -> Result<ScenePath, SceneError>;

    /// Merge several scenes into one new temporary scene.
    fn merge_scenes(&mut self, scenes: &[ScenePath]) -> Result<ScenePath, SceneError>;

    fn close_scene(&mut self, scene: &ScenePath, save: bool) -> Result<(), SceneError>;

    fn reopen_scene(&mut self, scene: &ScenePath) -> Result<(), SceneError>;

    /// Every scene the host currently knows about, with its loaded flag.
    fn scene_states(&self) -> Vec<SceneState>;

    fn set_scene_loaded(&mut self, scene: &ScenePath, loaded: bool) -> Result<(), SceneError>;

    /// Put the temporary scene into sampling configuration (e.g. disable every
    /// renderer that is not part of the bake).
    fn prepare_sampling_scene(
        &mut self,
        _scene: &ScenePath,
        _bake_renderers: &[RendererId],
    ) -> Result<(), SceneError> {
        Ok(())
    }
}
