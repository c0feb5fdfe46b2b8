//! Instancing prototypes
//!
//! A prototype is the thing being instanced: a list of LOD levels, each with
//! a mesh and one material per submesh. Prototypes are validated before they
//! can be registered. Shader conversion is expensive, so a failed conversion
//! is remembered per (shader, platform) and never retried.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::PrototypeError;

/// Identifies a prototype across registrations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PrototypeId(pub u32);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshInfo {
    pub name: String,
    pub vertex_count: u32,
    pub submesh_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MaterialInfo {
    pub name: String,
    /// Shader name; `None` when the material lost its shader
    pub shader: Option<String>,
}

impl MaterialInfo {
    pub fn new(name: impl Into<String>, shader: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shader: Some(shader.into()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LodLevel {
    pub mesh: Option<MeshInfo>,
    /// One slot per submesh
    pub materials: Vec<Option<MaterialInfo>>,
    pub casts_shadows: bool,
}

impl LodLevel {
    /// LOD with a mesh and one material per submesh.
    pub fn new(mesh: MeshInfo, material: MaterialInfo, casts_shadows: bool) -> Self {
        let slots = mesh.submesh_count.max(1) as usize;
        Self {
            mesh: Some(mesh),
            materials: vec![Some(material); slots],
            casts_shadows,
        }
    }

    pub fn vertex_count(&self) -> u32 {
        self.mesh.as_ref().map_or(0, |m| m.vertex_count)
    }

    pub fn submesh_count(&self) -> u32 {
        self.mesh.as_ref().map_or(0, |m| m.submesh_count)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Prototype {
    pub id: PrototypeId,
    pub name: String,
    pub lods: Vec<LodLevel>,
}

impl Prototype {
    pub fn new(id: u32, name: impl Into<String>, lods: Vec<LodLevel>) -> Self {
        Self {
            id: PrototypeId(id),
            name: name.into(),
            lods,
        }
    }

    /// Check that every LOD has a mesh and every material slot a shader
    /// that converts for `platform`.
    pub fn validate(
        &self,
        shaders: &mut ShaderConversionCache,
        platform: wgpu::Backend,
    ) -> Result<(), PrototypeError> {
        if self.lods.is_empty() {
            return Err(PrototypeError::NoLods {
                prototype: self.name.clone(),
            });
        }
        for (lod, level) in self.lods.iter().enumerate() {
            if level.mesh.is_none() {
                return Err(PrototypeError::MissingMesh {
                    prototype: self.name.clone(),
                    lod,
                });
            }
            for (slot, material) in level.materials.iter().enumerate() {
                let Some(material) = material else {
                    return Err(PrototypeError::MissingMaterial {
                        prototype: self.name.clone(),
                        lod,
                        slot,
                    });
                };
                let Some(shader) = material.shader.as_deref() else {
                    return Err(PrototypeError::MissingShader {
                        material: material.name.clone(),
                    });
                };
                shaders.ensure_converted(shader, platform)?;
            }
        }
        Ok(())
    }
}

/// Converts a shader for a target platform.
pub trait ShaderConverter {
    fn convert(&mut self, shader: &str, platform: wgpu::Backend) -> Result<(), String>;
}

/// Converter that accepts every shader.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassthroughShaderConverter;

impl ShaderConverter for PassthroughShaderConverter {
    fn convert(&mut self, _shader: &str, _platform: wgpu::Backend) -> Result<(), String> {
        Ok(())
    }
}

/// Remembers conversion results per (shader, platform).
pub struct ShaderConversionCache {
    converter: Box<dyn ShaderConverter>,
    results: HashMap<(String, wgpu::Backend), Result<(), String>>,
    conversions: usize,
}

impl Default for ShaderConversionCache {
    fn default() -> Self {
        Self::new(PassthroughShaderConverter)
    }
}

impl ShaderConversionCache {
    pub fn new(converter: impl ShaderConverter + 'static) -> Self {
        Self {
            converter: Box::new(converter),
            results: HashMap::new(),
            conversions: 0,
        }
    }

    /// Number of times the converter actually ran.
    pub fn conversions(&self) -> usize {
        self.conversions
    }

    pub fn is_known_failure(&self, shader: &str, platform: wgpu::Backend) -> bool {
        matches!(
            self.results.get(&(shader.to_string(), platform)),
            Some(Err(_))
        )
    }

    /// Convert `shader` unless a result is already cached.
    pub fn ensure_converted(
        &mut self,
        shader: &str,
        platform: wgpu::Backend,
    ) -> Result<(), PrototypeError> {
        let key = (shader.to_string(), platform);
        let result = match self.results.get(&key) {
            Some(cached) => cached.clone(),
            None => {
                self.conversions += 1;
                let result = self.converter.convert(shader, platform);
                if let Err(reason) = &result {
                    log::warn!("[Shaders] `{shader}` failed to convert for {platform:?}: {reason}");
                }
                self.results.insert(key, result.clone());
                result
            }
        };
        result.map_err(|reason| PrototypeError::ShaderConversionFailed {
            shader: shader.to_string(),
            platform: format!("{platform:?}"),
            reason,
        })
    }

    /// Forget cached results, e.g. after shaders were edited.
    pub fn clear(&mut self) {
        self.results.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectNamed(&'static str);

    impl ShaderConverter for RejectNamed {
        fn convert(&mut self, shader: &str, _platform: wgpu::Backend) -> Result<(), String> {
            if shader == self.0 {
                Err("unsupported keyword".into())
            } else {
                Ok(())
            }
        }
    }

    fn mesh() -> MeshInfo {
        MeshInfo {
            name: "tree".into(),
            vertex_count: 300,
            submesh_count: 2,
        }
    }

    #[test]
    fn test_valid_prototype() {
        let proto = Prototype::new(
            1,
            "tree",
            vec![LodLevel::new(mesh(), MaterialInfo::new("bark", "lit"), true)],
        );
        let mut cache = ShaderConversionCache::default();
        assert!(proto.validate(&mut cache, wgpu::Backend::Vulkan).is_ok());
        assert_eq!(proto.lods[0].materials.len(), 2);
    }

    #[test]
    fn test_missing_pieces() {
        let mut cache = ShaderConversionCache::default();
        let vk = wgpu::Backend::Vulkan;

        let empty = Prototype::new(1, "empty", Vec::new());
        assert!(matches!(
            empty.validate(&mut cache, vk),
            Err(PrototypeError::NoLods { .. })
        ));

        let mut no_mesh = LodLevel::new(mesh(), MaterialInfo::new("bark", "lit"), false);
        no_mesh.mesh = None;
        let proto = Prototype::new(2, "no_mesh", vec![no_mesh]);
        assert!(matches!(
            proto.validate(&mut cache, vk),
            Err(PrototypeError::MissingMesh { lod: 0, .. })
        ));

        let mut hole = LodLevel::new(mesh(), MaterialInfo::new("bark", "lit"), false);
        hole.materials[1] = None;
        let proto = Prototype::new(3, "hole", vec![hole]);
        assert!(matches!(
            proto.validate(&mut cache, vk),
            Err(PrototypeError::MissingMaterial { slot: 1, .. })
        ));

        let shaderless = MaterialInfo {
            name: "broken".into(),
            shader: None,
        };
        let proto = Prototype::new(4, "shaderless", vec![LodLevel::new(mesh(), shaderless, false)]);
        assert!(matches!(
            proto.validate(&mut cache, vk),
            Err(PrototypeError::MissingShader { .. })
        ));
    }

    #[test]
    fn test_conversion_failure_is_cached_per_platform() {
        let mut cache = ShaderConversionCache::new(RejectNamed("fancy"));
        let vk = wgpu::Backend::Vulkan;
        let metal = wgpu::Backend::Metal;

        assert!(cache.ensure_converted("fancy", vk).is_err());
        assert!(cache.ensure_converted("fancy", vk).is_err());
        assert_eq!(cache.conversions(), 1);
        assert!(cache.is_known_failure("fancy", vk));

        // Another platform is a separate entry.
        assert!(!cache.is_known_failure("fancy", metal));
        assert!(cache.ensure_converted("fancy", metal).is_err());
        assert_eq!(cache.conversions(), 2);

        assert!(cache.ensure_converted("plain", vk).is_ok());
        assert!(cache.ensure_converted("plain", vk).is_ok());
        assert_eq!(cache.conversions(), 3);
    }
}
