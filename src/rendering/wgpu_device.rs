use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use wgpu::util::DeviceExt;

use super::device::{GpuCapabilities, GpuDevice, IndexBufferId, IndexRange, TerrainVertex, VertexBufferId};
use crate::world::terrain::{TerrainError, TerrainResult};

const INITIAL_INDEX_CAPACITY: u64 = 4096;
const INDEX_SIZE: u64 = std::mem::size_of::<u32>() as u64;

struct GrowableIndexBuffer {
    label: String,
    buffer: wgpu::Buffer,
    len: u64,
    capacity: u64,
}

struct PendingDraw {
    vertices: VertexBufferId,
    indices: IndexBufferId,
    range: IndexRange,
}

#[derive(Default)]
struct BufferState {
    next_id: u32,
    vertex_buffers: HashMap<VertexBufferId, wgpu::Buffer>,
    index_buffers: HashMap<IndexBufferId, GrowableIndexBuffer>,
    bound: Option<(VertexBufferId, IndexBufferId)>,
    pending: Vec<PendingDraw>,
}

impl BufferState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// wgpu-backed terrain buffers
///
/// Index buffers are append-only: when an append does not fit, a buffer of
/// twice the capacity is allocated and the old contents copied over on the
/// GPU, so ranges handed out earlier stay valid. Draw calls are collected
/// and replayed into the frame's render pass by [`encode_draws`](Self::encode_draws).
/// Clones share the same buffers, so the frame loop can keep a handle while
/// the terrain scene owns another.
#[derive(Clone)]
pub struct WgpuTerrainDevice {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    capabilities: GpuCapabilities,
    state: Arc<Mutex<BufferState>>,
}

impl WgpuTerrainDevice {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>, capabilities: GpuCapabilities) -> Self {
        Self {
            device,
            queue,
            capabilities,
            state: Arc::new(Mutex::new(BufferState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_index_storage(&self, label: &str, capacity: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: capacity * INDEX_SIZE,
            usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })
    }

    /// Record every draw issued since the last call into `pass`
    pub fn encode_draws(&self, pass: &mut wgpu::RenderPass<'_>) -> usize {
        let mut state = self.lock();
        let pending = std::mem::take(&mut state.pending);
        let mut encoded = 0;
        for draw in pending {
            let (Some(vertices), Some(indices)) =
                (state.vertex_buffers.get(&draw.vertices), state.index_buffers.get(&draw.indices))
            else {
                continue;
            };
            pass.set_vertex_buffer(0, vertices.slice(..));
            pass.set_index_buffer(indices.buffer.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(draw.range.start..draw.range.end(), 0, 0..1);
            encoded += 1;
        }
        encoded
    }
}

impl GpuDevice for WgpuTerrainDevice {
    fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    fn create_vertex_buffer(&mut self, label: &str, vertices: &[TerrainVertex]) -> TerrainResult<VertexBufferId> {
        let bytes = std::mem::size_of_val(vertices) as u64;
        if bytes > self.capabilities.max_buffer_size {
            return Err(TerrainError::Gpu {
                reason: format!("vertex buffer '{}' of {} bytes exceeds device limit", label, bytes),
            });
        }
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let mut state = self.lock();
        let id = VertexBufferId(state.next_id());
        state.vertex_buffers.insert(id, buffer);
        Ok(id)
    }

    fn create_index_buffer(&mut self, label: &str) -> TerrainResult<IndexBufferId> {
        let buffer = self.create_index_storage(label, INITIAL_INDEX_CAPACITY);
        let mut state = self.lock();
        let id = IndexBufferId(state.next_id());
        state.index_buffers.insert(
            id,
            GrowableIndexBuffer {
                label: label.to_string(),
                buffer,
                len: 0,
                capacity: INITIAL_INDEX_CAPACITY,
            },
        );
        Ok(id)
    }

    fn append_indices(&mut self, buffer: IndexBufferId, indices: &[u32]) -> TerrainResult<u32> {
        let max_len = self.capabilities.max_buffer_size / INDEX_SIZE;
        let mut state = self.lock();
        let (len, capacity, label) = match state.index_buffers.get(&buffer) {
            Some(b) => (b.len, b.capacity, b.label.clone()),
            None => {
                return Err(TerrainError::Gpu {
                    reason: format!("unknown index buffer {:?}", buffer),
                })
            }
        };
        let needed = len + indices.len() as u64;
        if needed > max_len {
            return Err(TerrainError::Gpu {
                reason: format!("index buffer '{}' would exceed device limit", label),
            });
        }

        if needed > capacity {
            let new_capacity = (capacity * 2).max(needed).min(max_len);
            let grown = self.create_index_storage(&label, new_capacity);
            if len > 0 {
                let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("terrain index growth"),
                });
                if let Some(old) = state.index_buffers.get(&buffer) {
                    encoder.copy_buffer_to_buffer(&old.buffer, 0, &grown, 0, len * INDEX_SIZE);
                }
                self.queue.submit(std::iter::once(encoder.finish()));
            }
            debug!("Grew index buffer '{}' to {} indices", label, new_capacity);
            if let Some(entry) = state.index_buffers.get_mut(&buffer) {
                entry.buffer = grown;
                entry.capacity = new_capacity;
            }
        }

        let entry = state.index_buffers.get_mut(&buffer).ok_or_else(|| TerrainError::Gpu {
            reason: format!("index buffer {:?} vanished during append", buffer),
        })?;
        self.queue
            .write_buffer(&entry.buffer, entry.len * INDEX_SIZE, bytemuck::cast_slice(indices));
        let start = entry.len as u32;
        entry.len = needed;
        Ok(start)
    }

    fn release_vertex_buffer(&mut self, buffer: VertexBufferId) {
        if let Some(b) = self.lock().vertex_buffers.remove(&buffer) {
            b.destroy();
        }
    }

    fn release_index_buffer(&mut self, buffer: IndexBufferId) {
        if let Some(b) = self.lock().index_buffers.remove(&buffer) {
            b.buffer.destroy();
        }
    }

    fn bind(&mut self, vertices: VertexBufferId, indices: IndexBufferId) -> TerrainResult<()> {
        let mut state = self.lock();
        if !state.vertex_buffers.contains_key(&vertices) || !state.index_buffers.contains_key(&indices) {
            return Err(TerrainError::Gpu {
                reason: format!("cannot bind released buffers {:?}/{:?}", vertices, indices),
            });
        }
        state.bound = Some((vertices, indices));
        Ok(())
    }

    fn draw_range(&mut self, range: &IndexRange) -> TerrainResult<()> {
        let mut state = self.lock();
        let Some((vertices, indices)) = state.bound else {
            return Err(TerrainError::Gpu {
                reason: "draw with nothing bound".to_string(),
            });
        };
        let len = state.index_buffers.get(&indices).map_or(0, |b| b.len);
        if range.end() as u64 > len {
            warn!("Dropping draw of {:?}, index buffer holds {}", range, len);
            return Err(TerrainError::Gpu {
                reason: format!("range {:?} past end of index buffer", range),
            });
        }
        state.pending.push(PendingDraw {
            vertices,
            indices,
            range: *range,
        });
        Ok(())
    }

    fn unbind(&mut self) {
        self.lock().bound = None;
    }
}
