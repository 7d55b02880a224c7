// SLV-Terrain: streaming terrain level of detail
// Performance by Default, Scalable by Design

pub mod config;
pub mod rendering;
pub mod tasks;
pub mod utils;
pub mod world;

// Re-export commonly used types for convenience
pub use config::{PerformanceProfile, TerrainSettings, WorkerConfig};
pub use tasks::{RenderContextToken, TaskScheduler};
pub use world::terrain::{
    BlockKey, HeightfieldBlock, HeightfieldSource, TerrainError, TerrainRenderManager, TerrainResult,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
