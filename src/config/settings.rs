use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::world::terrain::{TerrainError, TerrainResult};

const CONFIG_FILE: &str = "terrain.toml";
const ENV_PREFIX: &str = "SLV_TERRAIN";

// =============================================================================
// Terrain Configuration System
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PerformanceProfile {
    Low,      // Small streaming window, few uploads per frame
    #[default]
    Balanced, // Default for mid-range systems
    High,     // Wide streaming window for high-end hardware
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSettings {
    /// Lattice quads per block side, a power of two
    pub block_size: u32,
    /// Zones per block side
    pub zone_grid: u32,
    /// World units between lattice points
    pub sample_spacing: f32,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            block_size: 512,
            zone_grid: 8,
            sample_spacing: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodSettings {
    /// Number of discrete zone levels, level 0 being the finest
    pub levels: u8,
    /// Distance at which each level after the first begins
    pub thresholds: Vec<f32>,
    /// Reduction detail dropped per zone level
    pub detail_step: u32,
    pub continuous_tolerance: f32,
    pub continuous_detail_scale: f32,
}

impl Default for LodSettings {
    fn default() -> Self {
        Self {
            levels: 3,
            thresholds: vec![128.0, 256.0],
            detail_step: 1,
            continuous_tolerance: 0.05,
            continuous_detail_scale: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    pub prefetch_radius: f32,
    pub rescan_interval_secs: f32,
    pub uploads_per_frame: usize,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            prefetch_radius: 768.0,
            rescan_interval_secs: 1.0,
            uploads_per_frame: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub frustum_culling: bool,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self { frustum_culling: true }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainSettings {
    pub profile: PerformanceProfile,
    pub grid: GridSettings,
    pub lod: LodSettings,
    pub streaming: StreamingSettings,
    pub rendering: RenderSettings,
}

impl TerrainSettings {
    pub fn for_profile(profile: PerformanceProfile) -> Self {
        let streaming = match profile {
            PerformanceProfile::Low => StreamingSettings {
                prefetch_radius: 512.0,
                rescan_interval_secs: 2.0,
                uploads_per_frame: 2,
            },
            PerformanceProfile::Balanced => StreamingSettings::default(),
            PerformanceProfile::High => StreamingSettings {
                prefetch_radius: 1024.0,
                rescan_interval_secs: 0.5,
                uploads_per_frame: 16,
            },
        };
        let lod = match profile {
            PerformanceProfile::Low => LodSettings {
                thresholds: vec![96.0, 192.0],
                detail_step: 2,
                ..LodSettings::default()
            },
            _ => LodSettings::default(),
        };

        Self {
            profile,
            grid: GridSettings::default(),
            lod,
            streaming,
            rendering: RenderSettings::default(),
        }
    }

    pub fn validate(&self) -> TerrainResult<()> {
        let grid = &self.grid;
        if grid.block_size == 0 || !grid.block_size.is_power_of_two() {
            return Err(TerrainError::InvalidBlockSize(grid.block_size));
        }
        if grid.zone_grid == 0 || !grid.zone_grid.is_power_of_two() || grid.zone_grid > grid.block_size {
            return Err(config_error(format!(
                "zone grid {} does not divide block size {}",
                grid.zone_grid, grid.block_size
            )));
        }
        if !(grid.sample_spacing.is_finite() && grid.sample_spacing > 0.0) {
            return Err(config_error("sample spacing must be positive"));
        }
        if self.lod.levels == 0 || self.lod.thresholds.len() + 1 != self.lod.levels as usize {
            return Err(config_error(format!(
                "{} LOD levels need {} thresholds, got {}",
                self.lod.levels,
                self.lod.levels.saturating_sub(1),
                self.lod.thresholds.len()
            )));
        }
        if self.lod.thresholds.iter().any(|t| !t.is_finite()) {
            return Err(config_error("LOD thresholds must be finite"));
        }
        if self.lod.thresholds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(config_error("LOD thresholds must be strictly increasing"));
        }
        let streaming = &self.streaming;
        if !(streaming.prefetch_radius.is_finite() && streaming.prefetch_radius > 0.0) {
            return Err(config_error(format!(
                "prefetch radius must be positive and finite, got {}",
                streaming.prefetch_radius
            )));
        }
        if !(streaming.rescan_interval_secs.is_finite() && streaming.rescan_interval_secs >= 0.0) {
            return Err(config_error(format!(
                "rescan interval must be a finite number of seconds, got {}",
                streaming.rescan_interval_secs
            )));
        }
        if self.streaming.uploads_per_frame == 0 {
            return Err(config_error("at least one upload per frame is required"));
        }
        Ok(())
    }

    /// Lattice quads per zone side
    pub fn zone_size(&self) -> u32 {
        self.grid.block_size / self.grid.zone_grid.max(1)
    }

    pub fn block_extent(&self) -> f32 {
        self.grid.block_size as f32 * self.grid.sample_spacing
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::try_from_secs_f32(self.streaming.rescan_interval_secs.max(0.0)).unwrap_or(Duration::MAX)
    }
}

fn config_error(reason: impl Into<String>) -> TerrainError {
    TerrainError::Config { reason: reason.into() }
}

// Terrain configuration file management
pub fn terrain_config_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "slv", "slv-terrain").map(|proj| proj.config_dir().join(CONFIG_FILE))
}

/// Defaults, overlaid by the TOML file (if present) and then by
/// `SLV_TERRAIN_*` environment variables, e.g. `SLV_TERRAIN_STREAMING__PREFETCH_RADIUS`
pub fn load_terrain_settings(path: Option<&Path>) -> TerrainResult<TerrainSettings> {
    let defaults = config::Config::try_from(&TerrainSettings::default()).map_err(|e| config_error(e.to_string()))?;
    let mut builder = config::Config::builder().add_source(defaults);

    if let Some(path) = path.map(Path::to_path_buf).or_else(terrain_config_path) {
        builder = builder.add_source(config::File::from(path).required(false));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let settings: TerrainSettings = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| config_error(e.to_string()))?;
    settings.validate()?;
    tracing::info!("Loaded terrain settings ({:?} profile)", settings.profile);
    Ok(settings)
}

/// Write settings as TOML, to `path` or the per-user config directory
pub fn save_terrain_settings(settings: &TerrainSettings, path: Option<&Path>) -> TerrainResult<PathBuf> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(terrain_config_path)
        .ok_or_else(|| config_error("no configuration directory available"))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| config_error(format!("{}: {}", parent.display(), e)))?;
    }
    let toml = toml::to_string_pretty(settings).map_err(|e| config_error(e.to_string()))?;
    fs::write(&path, toml).map_err(|e| config_error(format!("{}: {}", path.display(), e)))?;
    Ok(path)
}
