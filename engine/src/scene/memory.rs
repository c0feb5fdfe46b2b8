//! In-memory scene host
//!
//! A [`SceneHost`] backed by plain collections. Used by the headless bake
//! binary and by tests; every call is journaled so callers can check which
//! scenes were touched and in what order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::host::{SaveOutcome, SceneHost, ScenePath, SceneState};
use super::renderer::{RendererId, RendererRef};
use crate::error::SceneError;

/// Suffix appended to temporary scene paths created by duplicate/merge.
pub const TEMP_SCENE_SUFFIX: &str = ".bake-temp";

/// Journal entry for one host call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostCall {
    Save(ScenePath),
    Duplicate(ScenePath),
    Merge(Vec<ScenePath>),
    Close { scene: ScenePath, save: bool },
    Reopen(ScenePath),
    SetLoaded { scene: ScenePath, loaded: bool },
    PrepareSampling(ScenePath),
}

#[derive(Clone, Debug)]
struct MemoryScene {
    renderers: Vec<RendererRef>,
    loaded: bool,
    temporary: bool,
    /// Renderers disabled for sampling (temporary scenes only)
    disabled: Vec<RendererId>,
}

/// Serializable scene description used to seed a [`MemorySceneHost`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SceneDescription {
    pub path: ScenePath,
    pub renderers: Vec<RendererRef>,
    #[serde(default = "default_loaded")]
    pub loaded: bool,
}

fn default_loaded() -> bool {
    true
}

/// In-memory [`SceneHost`].
#[derive(Clone, Debug, Default)]
pub struct MemorySceneHost {
    scenes: BTreeMap<ScenePath, MemoryScene>,
    journal: Vec<HostCall>,
    /// When set, `save_scene` reports [`SaveOutcome::Declined`].
    pub decline_save: bool,
    /// Counts sampling-time manipulation applied to non-temporary scenes.
    live_mutations: usize,
    temp_counter: u32,
}

impl MemorySceneHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptions(descriptions: Vec<SceneDescription>) -> Self {
        let mut host = Self::new();
        for desc in descriptions {
            let loaded = desc.loaded;
            let path = desc.path.clone();
            host.add_scene(desc.path, desc.renderers);
            if let Some(scene) = host.scenes.get_mut(&path) {
                scene.loaded = loaded;
            }
        }
        host
    }

    /// Add (or replace) a loaded, non-temporary scene.
    pub fn add_scene(&mut self, path: ScenePath, renderers: Vec<RendererRef>) {
        self.scenes.insert(
            path,
            MemoryScene {
                renderers,
                loaded: true,
                temporary: false,
                disabled: Vec::new(),
            },
        );
    }

    pub fn journal(&self) -> &[HostCall] {
        &self.journal
    }

    pub fn live_mutations(&self) -> usize {
        self.live_mutations
    }

    /// Temporary scenes still open.
    pub fn temporary_scenes(&self) -> Vec<ScenePath> {
        self.scenes
            .iter()
            .filter(|(_, s)| s.temporary)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn is_loaded(&self, path: &ScenePath) -> bool {
        self.scenes.get(path).is_some_and(|s| s.loaded)
    }

    /// Renderers disabled inside a temporary scene for sampling.
    pub fn disabled_renderers(&self, path: &ScenePath) -> &[RendererId] {
        self.scenes
            .get(path)
            .map(|s| s.disabled.as_slice())
            .unwrap_or(&[])
    }

    fn next_temp_path(&mut self, base: &str) -> ScenePath {
        self.temp_counter += 1;
        ScenePath(format!("{base}{TEMP_SCENE_SUFFIX}{}", self.temp_counter))
    }

    fn scene(&self, path: &ScenePath) -> Result<&MemoryScene, SceneError> {
        self.scenes
            .get(path)
            .ok_or_else(|| SceneError::UnknownScene(path.clone()))
    }

    fn scene_mut(&mut self, path: &ScenePath) -> Result<&mut MemoryScene, SceneError> {
        self.scenes
            .get_mut(path)
            .ok_or_else(|| SceneError::UnknownScene(path.clone()))
    }
}

impl SceneHost for MemorySceneHost {
    fn renderers_in_scene(&self, scene: &ScenePath) -> Result<Vec<RendererRef>, SceneError> {
        let s = self.scene(scene)?;
        if !s.loaded {
            return Err(SceneError::NotLoaded(scene.clone()));
        }
        Ok(s.renderers.clone())
    }

    fn save_scene(&mut self, scene: &ScenePath) -> Result<SaveOutcome, SceneError> {
        self.scene(scene)?;
        self.journal.push(HostCall::Save(scene.clone()));
        if self.decline_save {
            return Ok(SaveOutcome::Declined);
        }
        Ok(SaveOutcome::Saved)
    }

    fn duplicate_scene_additive(&mut self, scene: &ScenePath) -> Result<ScenePath, SceneError> {
        let renderers = self.scene(scene)?.renderers.clone();
        self.journal.push(HostCall::Duplicate(scene.clone()));
        let temp = self.next_temp_path(scene.as_str());
        self.scenes.insert(
            temp.clone(),
            MemoryScene {
                renderers,
                loaded: true,
                temporary: true,
                disabled: Vec::new(),
            },
        );
        Ok(temp)
    }

    fn merge_scenes(&mut self, scenes: &[ScenePath]) -> Result<ScenePath, SceneError> {
        let mut renderers = Vec::new();
        for path in scenes {
            renderers.extend(self.scene(path)?.renderers.iter().cloned());
        }
        self.journal.push(HostCall::Merge(scenes.to_vec()));
        // Merged sources are closed; the temporary scene replaces them.
        for path in scenes {
            self.scene_mut(path)?.loaded = false;
        }
        let base = scenes.first().map(ScenePath::as_str).unwrap_or("merged");
        let temp = self.next_temp_path(base);
        self.scenes.insert(
            temp.clone(),
            MemoryScene {
                renderers,
                loaded: true,
                temporary: true,
                disabled: Vec::new(),
            },
        );
        Ok(temp)
    }

    fn close_scene(&mut self, scene: &ScenePath, save: bool) -> Result<(), SceneError> {
        self.journal.push(HostCall::Close {
            scene: scene.clone(),
            save,
        });
        let temporary = self.scene(scene)?.temporary;
        if temporary {
            self.scenes.remove(scene);
        } else {
            self.scene_mut(scene)?.loaded = false;
        }
        Ok(())
    }

    fn reopen_scene(&mut self, scene: &ScenePath) -> Result<(), SceneError> {
        self.journal.push(HostCall::Reopen(scene.clone()));
        self.scene_mut(scene)?.loaded = true;
        Ok(())
    }

    fn scene_states(&self) -> Vec<SceneState> {
        self.scenes
            .iter()
            .filter(|(_, s)| !s.temporary)
            .map(|(path, s)| SceneState {
                path: path.clone(),
                loaded: s.loaded,
            })
            .collect()
    }

    fn set_scene_loaded(&mut self, scene: &ScenePath, loaded: bool) -> Result<(), SceneError> {
        self.journal.push(HostCall::SetLoaded {
            scene: scene.clone(),
            loaded,
        });
        self.scene_mut(scene)?.loaded = loaded;
        Ok(())
    }

    fn prepare_sampling_scene(
        &mut self,
        scene: &ScenePath,
        bake_renderers: &[RendererId],
    ) -> Result<(), SceneError> {
        self.journal.push(HostCall::PrepareSampling(scene.clone()));
        if !self.scene(scene)?.temporary {
            self.live_mutations += 1;
        }
        let s = self.scene_mut(scene)?;
        s.disabled = s
            .renderers
            .iter()
            .map(|r| r.id)
            .filter(|id| !bake_renderers.contains(id))
            .collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::renderer::MeshStats;
    use crate::world::Aabb;
    use glam::Vec3;

    fn renderer(id: u64) -> RendererRef {
        RendererRef::mesh(
            id,
            Aabb::from_center_size(Vec3::ZERO, Vec3::ONE),
            MeshStats {
                vertex_count: 8,
                submesh_count: 1,
            },
        )
    }

    #[test]
    fn test_duplicate_creates_temporary_copy() {
        let mut host = MemorySceneHost::new();
        let path = ScenePath::new("level.scene");
        host.add_scene(path.clone(), vec![renderer(1), renderer(2)]);

        let temp = host.duplicate_scene_additive(&path).unwrap();
        assert_ne!(temp, path);
        assert_eq!(host.renderers_in_scene(&temp).unwrap().len(), 2);
        assert_eq!(host.temporary_scenes(), vec![temp.clone()]);

        host.close_scene(&temp, false).unwrap();
        assert!(host.temporary_scenes().is_empty());
        assert!(host.is_loaded(&path));
    }

    #[test]
    fn test_merge_closes_sources() {
        let mut host = MemorySceneHost::new();
        let a = ScenePath::new("a.scene");
        let b = ScenePath::new("b.scene");
        host.add_scene(a.clone(), vec![renderer(1)]);
        host.add_scene(b.clone(), vec![renderer(2)]);

        let temp = host.merge_scenes(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(host.renderers_in_scene(&temp).unwrap().len(), 2);
        assert!(!host.is_loaded(&a));
        assert!(!host.is_loaded(&b));
        // Temporary scenes are not reported as user scenes.
        assert_eq!(host.scene_states().len(), 2);
    }

    #[test]
    fn test_prepare_sampling_on_live_scene_is_counted() {
        let mut host = MemorySceneHost::new();
        let path = ScenePath::new("level.scene");
        host.add_scene(path.clone(), vec![renderer(1), renderer(2)]);
        let temp = host.duplicate_scene_additive(&path).unwrap();

        host.prepare_sampling_scene(&temp, &[RendererId(1)]).unwrap();
        assert_eq!(host.live_mutations(), 0);
        assert_eq!(host.disabled_renderers(&temp), &[RendererId(2)]);

        host.prepare_sampling_scene(&path, &[RendererId(1)]).unwrap();
        assert_eq!(host.live_mutations(), 1);
    }

    #[test]
    fn test_declined_save() {
        let mut host = MemorySceneHost::new();
        let path = ScenePath::new("level.scene");
        host.add_scene(path.clone(), vec![]);
        host.decline_save = true;
        assert_eq!(host.save_scene(&path).unwrap(), SaveOutcome::Declined);
    }
}
