//! Bake Configuration
//!
//! Centralized settings for a visibility bake. `Default` returns the values
//! used by the editor tooling; JSON files may override any subset of fields.

use std::path::{Path, PathBuf};

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which point-visibility backend samples the scene.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerBackendKind {
    /// GPU when an adapter is available, CPU otherwise
    #[default]
    Auto,
    /// CPU ray casting against renderer bounds
    Cpu,
    /// wgpu compute queries
    Gpu,
}

/// Settings for one bake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BakeSettings {
    /// Maximum number of unresolved sampler queries before a batch is completed
    pub batch_count: usize,
    /// Requested spacing of regular sampling grids (meters)
    pub cell_size: Vec3,
    /// Renderers farther than this from a sampling location are never visible
    pub max_sample_distance: f32,
    /// How far probe points are pulled toward the bounds center (0 = corners)
    pub probe_shrink: f32,
    /// Smoothing factor of the per-sample cost moving average
    pub ema_smoothing: f32,
    pub backend: SamplerBackendKind,
    /// Ask the host to save the authored scene before duplicating it
    pub save_scene_before_bake: bool,
    /// Bounds-check renderer indices written into the visibility store
    pub validate_raw_data: bool,
    /// Where the finished artifact is written (in-memory only when `None`)
    pub output_path: Option<PathBuf>,
}

impl Default for BakeSettings {
    fn default() -> Self {
        Self {
            batch_count: 32,
            cell_size: Vec3::splat(2.0),
            max_sample_distance: 500.0,
            probe_shrink: 0.05,
            ema_smoothing: 0.005,
            backend: SamplerBackendKind::Auto,
            save_scene_before_bake: true,
            validate_raw_data: true,
            output_path: None,
        }
    }
}

impl BakeSettings {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let settings: BakeSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_count == 0 {
            return Err(ConfigError::Invalid {
                field: "batch_count",
                reason: "must be at least 1".into(),
            });
        }
        if !self.cell_size.is_finite() || !self.cell_size.cmpgt(Vec3::ZERO).all() {
            return Err(ConfigError::Invalid {
                field: "cell_size",
                reason: format!("must be positive on every axis, got {}", self.cell_size),
            });
        }
        if !(self.max_sample_distance.is_finite() && self.max_sample_distance > 0.0) {
            return Err(ConfigError::Invalid {
                field: "max_sample_distance",
                reason: format!("must be positive, got {}", self.max_sample_distance),
            });
        }
        if !(0.0..1.0).contains(&self.probe_shrink) {
            return Err(ConfigError::Invalid {
                field: "probe_shrink",
                reason: format!("must be in [0, 1), got {}", self.probe_shrink),
            });
        }
        if !(self.ema_smoothing > 0.0 && self.ema_smoothing <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "ema_smoothing",
                reason: format!("must be in (0, 1], got {}", self.ema_smoothing),
            });
        }
        Ok(())
    }
}
