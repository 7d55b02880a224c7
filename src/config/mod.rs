pub mod settings;
pub mod hardware;
pub mod concurrency;

// Re-export commonly used types
pub use settings::{
    GridSettings, LodSettings, PerformanceProfile, RenderSettings, StreamingSettings, TerrainSettings,
    load_terrain_settings, save_terrain_settings, terrain_config_path,
};
pub use hardware::{detect_hardware, recommend_profile, HardwareInfo};
pub use concurrency::WorkerConfig;
