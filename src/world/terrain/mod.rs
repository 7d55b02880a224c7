//! Terrain level-of-detail streaming
//!
//! Heightfield blocks are streamed from a [`HeightfieldSource`] into the
//! [`BlockStore`], reduced per zone and LOD level on the background worker,
//! and uploaded to the GPU from the render thread by the
//! [`TerrainRenderManager`].

pub mod heightfield;
pub mod source;
pub mod store;
pub mod reduction;
pub mod compiler;
pub mod zones;
pub mod manager;

pub use heightfield::{BlockKey, GridMapper, HeightfieldBlock};
pub use source::{write_block_file, FlatFileSource, HeightfieldSource, ProceduralSource, SubBlockSource};
pub use store::{BlockStore, StoreStats};
pub use reduction::{ActiveVertexMap, DetailMetric, EdgeConstraints, Side, TileView};
pub use compiler::{CompiledMesh, MeshTrianglesCompiler, TrianglesCompiler};
pub use zones::{
    ActiveVertexBlockMap, LevelKey, PrepareOutcome, RenderOptions, ZoneLayout, ZoneLevelData, ZoneLevelState, ZoneManager,
    ZoneRenderStats,
};
pub use manager::{map_dist_to_level, BlockBuild, BlockRenderData, FrameStats, TerrainRenderManager, TerrainScene};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerrainError {
    #[error("Failed to read block {key}: {source}")]
    SourceIo {
        key: BlockKey,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed data for block {key}: {reason}")]
    SourceFormat { key: BlockKey, reason: String },

    #[error("Block size {0} is not a power of two")]
    InvalidBlockSize(u32),

    #[error("Block {0} is not loaded")]
    BlockNotLoaded(BlockKey),

    #[error("GPU error: {reason}")]
    Gpu { reason: String },

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("Failed to start worker thread: {0}")]
    Worker(#[from] std::io::Error),
}

pub type TerrainResult<T> = Result<T, TerrainError>;
