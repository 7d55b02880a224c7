//! GPU resource sink used by the terrain engine
//!
//! Background tasks only ever produce CPU-side vertex and index arrays. The
//! [`GpuDevice`] is owned by the render thread and touched from upload tasks
//! and the draw loop only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use glam::{Vec2, Vec3, Vec4};
use tracing::debug;

use crate::world::terrain::{TerrainError, TerrainResult};

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TerrainVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

impl TerrainVertex {
    const ATTRIBS: [wgpu::VertexAttribute; 4] =
        wgpu::vertex_attr_array![0 => Float32x3, 1 => Float32x3, 2 => Float32x2, 3 => Float32x4];

    pub fn new(position: Vec3, normal: Vec3, uv: Vec2, color: Vec4) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            uv: uv.to_array(),
            color: color.to_array(),
        }
    }

    pub fn desc() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<TerrainVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRIBS,
        }
    }
}

/// Slice of an append-only index buffer, plus the vertex index bounds a
/// range-limited draw call needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexRange {
    pub start: u32,
    pub size: u32,
    pub first_index: u32,
    pub last_index: u32,
}

impl IndexRange {
    pub fn from_indices(start: u32, indices: &[u32]) -> Self {
        let (first_index, last_index) = indices
            .iter()
            .fold(None, |acc: Option<(u32, u32)>, &i| match acc {
                None => Some((i, i)),
                Some((lo, hi)) => Some((lo.min(i), hi.max(i))),
            })
            .unwrap_or((0, 0));
        Self {
            start,
            size: indices.len() as u32,
            first_index,
            last_index,
        }
    }

    pub fn end(&self) -> u32 {
        self.start + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn triangle_count(&self) -> u32 {
        self.size / 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBufferId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexBufferId(pub u32);

/// Process-wide facts about the graphics backend, resolved once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuCapabilities {
    pub max_buffer_size: u64,
    pub max_index_value: u32,
    /// Whether draws honour `first_index`/`last_index` as a vertex range hint
    pub supports_draw_range: bool,
    pub backend: String,
}

static CAPABILITIES: OnceLock<GpuCapabilities> = OnceLock::new();

impl GpuCapabilities {
    /// Capabilities of the CPU-side recording backend
    pub fn headless() -> Self {
        Self {
            max_buffer_size: 256 * 1024 * 1024,
            max_index_value: u32::MAX,
            supports_draw_range: true,
            backend: "headless".to_string(),
        }
    }

    pub fn from_adapter(adapter: &wgpu::Adapter) -> Self {
        let info = adapter.get_info();
        let limits = adapter.limits();
        Self {
            max_buffer_size: limits.max_buffer_size,
            max_index_value: u32::MAX,
            supports_draw_range: false,
            backend: format!("{:?} ({})", info.backend, info.name),
        }
    }

    /// Install the process-wide table. The first call wins; later calls
    /// return what was installed first.
    pub fn init_global(capabilities: GpuCapabilities) -> &'static GpuCapabilities {
        CAPABILITIES.get_or_init(|| {
            debug!("GPU capabilities: {:?}", capabilities);
            capabilities
        })
    }

    /// The process-wide table, falling back to headless capabilities
    pub fn global() -> &'static GpuCapabilities {
        CAPABILITIES.get_or_init(Self::headless)
    }
}

/// Vertex/index buffer abstraction with bind/draw-range/unbind semantics
pub trait GpuDevice {
    fn capabilities(&self) -> &GpuCapabilities;

    fn create_vertex_buffer(&mut self, label: &str, vertices: &[TerrainVertex]) -> TerrainResult<VertexBufferId>;

    /// Create an empty, growable index buffer
    fn create_index_buffer(&mut self, label: &str) -> TerrainResult<IndexBufferId>;

    /// Append to an index buffer, returning the offset of the first appended index
    fn append_indices(&mut self, buffer: IndexBufferId, indices: &[u32]) -> TerrainResult<u32>;

    fn release_vertex_buffer(&mut self, buffer: VertexBufferId);

    fn release_index_buffer(&mut self, buffer: IndexBufferId);

    fn bind(&mut self, vertices: VertexBufferId, indices: IndexBufferId) -> TerrainResult<()>;

    fn draw_range(&mut self, range: &IndexRange) -> TerrainResult<()>;

    fn unbind(&mut self);
}

fn gpu_error(reason: impl Into<String>) -> TerrainError {
    TerrainError::Gpu { reason: reason.into() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDraw {
    pub vertex_buffer: VertexBufferId,
    pub index_buffer: IndexBufferId,
    pub range: IndexRange,
}

#[derive(Debug, Default)]
struct Recording {
    next_id: u32,
    vertex_buffers: HashMap<VertexBufferId, Vec<TerrainVertex>>,
    index_buffers: HashMap<IndexBufferId, Vec<u32>>,
    bound: Option<(VertexBufferId, IndexBufferId)>,
    draws: Vec<RecordedDraw>,
}

/// Headless device keeping CPU copies of every buffer and a log of draws
///
/// Clones share the same recording, so a test can keep one handle while the
/// terrain scene owns another.
#[derive(Debug, Clone)]
pub struct RecordingDevice {
    capabilities: GpuCapabilities,
    recording: Arc<Mutex<Recording>>,
}

impl Default for RecordingDevice {
    fn default() -> Self {
        Self::new(GpuCapabilities::global().clone())
    }
}

impl RecordingDevice {
    pub fn new(capabilities: GpuCapabilities) -> Self {
        Self {
            capabilities,
            recording: Arc::new(Mutex::new(Recording::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn live_vertex_buffers(&self) -> usize {
        self.lock().vertex_buffers.len()
    }

    pub fn live_index_buffers(&self) -> usize {
        self.lock().index_buffers.len()
    }

    pub fn vertex_count(&self, buffer: VertexBufferId) -> Option<usize> {
        self.lock().vertex_buffers.get(&buffer).map(Vec::len)
    }

    pub fn vertices(&self, buffer: VertexBufferId) -> Option<Vec<TerrainVertex>> {
        self.lock().vertex_buffers.get(&buffer).cloned()
    }

    pub fn indices(&self, buffer: IndexBufferId) -> Option<Vec<u32>> {
        self.lock().index_buffers.get(&buffer).cloned()
    }

    pub fn draws(&self) -> Vec<RecordedDraw> {
        self.lock().draws.clone()
    }

    pub fn take_draws(&self) -> Vec<RecordedDraw> {
        std::mem::take(&mut self.lock().draws)
    }
}

impl GpuDevice for RecordingDevice {
    fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    fn create_vertex_buffer(&mut self, _label: &str, vertices: &[TerrainVertex]) -> TerrainResult<VertexBufferId> {
        let bytes = std::mem::size_of_val(vertices) as u64;
        if bytes > self.capabilities.max_buffer_size {
            return Err(gpu_error(format!("vertex buffer of {} bytes exceeds device limit", bytes)));
        }
        let mut recording = self.lock();
        recording.next_id += 1;
        let id = VertexBufferId(recording.next_id);
        recording.vertex_buffers.insert(id, vertices.to_vec());
        Ok(id)
    }

    fn create_index_buffer(&mut self, _label: &str) -> TerrainResult<IndexBufferId> {
        let mut recording = self.lock();
        recording.next_id += 1;
        let id = IndexBufferId(recording.next_id);
        recording.index_buffers.insert(id, Vec::new());
        Ok(id)
    }

    fn append_indices(&mut self, buffer: IndexBufferId, indices: &[u32]) -> TerrainResult<u32> {
        let max_len = self.capabilities.max_buffer_size / 4;
        let mut recording = self.lock();
        let data = recording
            .index_buffers
            .get_mut(&buffer)
            .ok_or_else(|| gpu_error(format!("unknown index buffer {:?}", buffer)))?;
        if (data.len() + indices.len()) as u64 > max_len {
            return Err(gpu_error("index buffer would exceed device limit"));
        }
        let start = data.len() as u32;
        data.extend_from_slice(indices);
        Ok(start)
    }

    fn release_vertex_buffer(&mut self, buffer: VertexBufferId) {
        self.lock().vertex_buffers.remove(&buffer);
    }

    fn release_index_buffer(&mut self, buffer: IndexBufferId) {
        self.lock().index_buffers.remove(&buffer);
    }

    fn bind(&mut self, vertices: VertexBufferId, indices: IndexBufferId) -> TerrainResult<()> {
        let mut recording = self.lock();
        if !recording.vertex_buffers.contains_key(&vertices) || !recording.index_buffers.contains_key(&indices) {
            return Err(gpu_error(format!("cannot bind released buffers {:?}/{:?}", vertices, indices)));
        }
        recording.bound = Some((vertices, indices));
        Ok(())
    }

    fn draw_range(&mut self, range: &IndexRange) -> TerrainResult<()> {
        let mut recording = self.lock();
        let (vertex_buffer, index_buffer) = recording.bound.ok_or_else(|| gpu_error("draw with nothing bound"))?;
        let vertex_count = recording.vertex_buffers.get(&vertex_buffer).map_or(0, Vec::len) as u32;
        let indices = recording.index_buffers.get(&index_buffer).map_or(&[][..], Vec::as_slice);

        let slice = indices
            .get(range.start as usize..range.end() as usize)
            .ok_or_else(|| gpu_error(format!("range {:?} past end of index buffer ({})", range, indices.len())))?;
        if range.last_index >= vertex_count && !range.is_empty() {
            return Err(gpu_error(format!("range {:?} references vertices past {}", range, vertex_count)));
        }
        if slice.iter().any(|&i| i < range.first_index || i > range.last_index) {
            return Err(gpu_error(format!("indices outside declared bounds of {:?}", range)));
        }

        recording.draws.push(RecordedDraw {
            vertex_buffer,
            index_buffer,
            range: *range,
        });
        Ok(())
    }

    fn unbind(&mut self) {
        self.lock().bound = None;
    }
}
