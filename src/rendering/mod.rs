pub mod device;
pub mod pipeline;
pub mod wgpu_device;

pub use device::{
    GpuCapabilities, GpuDevice, IndexBufferId, IndexRange, RecordedDraw, RecordingDevice, TerrainVertex, VertexBufferId,
};
pub use pipeline::{request_headless_device, OffscreenTerrainRenderer};
pub use wgpu_device::WgpuTerrainDevice;
