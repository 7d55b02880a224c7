//! Terrain render manager
//!
//! Drives the load -> build -> prepare -> upload -> render pipeline. Block
//! loads and zone reductions run on the scheduler's background worker;
//! everything that touches the GPU is an upload task run against the
//! [`TerrainScene`] from the render thread.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use tracing::{debug, info, warn};

use super::compiler::{lattice_vertices, CompiledMesh, MeshTrianglesCompiler};
use super::reduction::{reduce, DetailMetric, Side, TileView};
use super::zones::{LevelKey, PrepareOutcome, RenderOptions, ZoneLayout, ZoneManager};
use super::{BlockKey, BlockStore, HeightfieldBlock, HeightfieldSource, TerrainError, TerrainResult};
use crate::config::{TerrainSettings, WorkerConfig};
use crate::rendering::{GpuDevice, TerrainVertex};
use crate::tasks::{RenderContextToken, TaskScheduler};
use crate::utils::math::{AABox, Containment, Frustum};

/// LOD level for a viewer distance: the number of thresholds at or below `dist`
///
/// With `n` thresholds there are `n + 1` levels, so the result never exceeds `n`.
pub fn map_dist_to_level(dist: f32, thresholds: &[f32]) -> u8 {
    thresholds.iter().filter(|&&t| dist >= t).count().min(u8::MAX as usize) as u8
}

/// Level of a zone addressed by its global zone coordinate, from the camera's
/// distance to the zone centre on the ground plane
///
/// Both zones on either side of a border, even across blocks, derive each
/// other's level this way, so they always agree on the border's level.
fn global_zone_level(layout: &ZoneLayout, thresholds: &[f32], viewer: Vec3, gx: i64, gy: i64) -> u8 {
    let extent = layout.zone_extent();
    let center = Vec3::new((gx as f32 + 0.5) * extent, (gy as f32 + 0.5) * extent, 0.0);
    layout.clamp_level(map_dist_to_level(viewer.distance(center), thresholds))
}

fn global_zone_coords(layout: &ZoneLayout, key: BlockKey, zone: usize) -> (i64, i64) {
    let (zx, zy) = layout.zone_coords(zone);
    let grid = layout.zone_grid as i64;
    (key.x as i64 * grid + zx as i64, key.y as i64 * grid + zy as i64)
}

// =============================================================================
// Block construction
// =============================================================================

/// CPU-side render data for one block, built on the background worker
#[derive(Debug, Clone)]
pub struct BlockBuild {
    pub key: BlockKey,
    /// Every zone's full lattice, zone after zone
    pub vertices: Vec<TerrainVertex>,
    pub zone_bounds: Vec<AABox>,
    pub bounds: AABox,
}

impl BlockBuild {
    pub fn compute(block: &HeightfieldBlock, layout: &ZoneLayout) -> Self {
        let mut vertices = Vec::with_capacity(layout.zone_count() * layout.vertices_per_zone() as usize);
        let mut zone_bounds = Vec::with_capacity(layout.zone_count());
        let mut bounds = AABox::empty();
        for zone in 0..layout.zone_count() {
            let tile = layout.zone_tile(block, zone);
            vertices.extend(lattice_vertices(&tile));
            let zone_box = tile.bounds();
            bounds = bounds.union(&zone_box);
            zone_bounds.push(zone_box);
        }
        Self {
            key: block.key(),
            vertices,
            zone_bounds,
            bounds,
        }
    }
}

/// A block that made it onto the GPU
pub struct BlockRenderData {
    generation: u64,
    zones: ZoneManager,
    bounds: AABox,
}

impl BlockRenderData {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn zones(&self) -> &ZoneManager {
        &self.zones
    }

    pub fn bounds(&self) -> AABox {
        self.bounds
    }
}

// =============================================================================
// Render-thread scene
// =============================================================================

/// Everything upload tasks are allowed to touch: the GPU device and the
/// arena of renderable blocks, keyed by [`BlockKey`]
pub struct TerrainScene {
    device: Box<dyn GpuDevice>,
    blocks: HashMap<BlockKey, BlockRenderData>,
    pending: HashSet<BlockKey>,
    next_generation: u64,
    store: Arc<BlockStore>,
    layout: ZoneLayout,
}

impl TerrainScene {
    pub fn new(device: Box<dyn GpuDevice>, store: Arc<BlockStore>, layout: ZoneLayout) -> Self {
        Self {
            device,
            blocks: HashMap::new(),
            pending: HashSet::new(),
            next_generation: 0,
            store,
            layout,
        }
    }

    /// Upload a built block and make it renderable
    ///
    /// Builds for blocks the store has dropped since, or that are already
    /// installed, are discarded.
    pub fn install_block(&mut self, build: BlockBuild) -> TerrainResult<()> {
        let key = build.key;
        self.pending.remove(&key);
        if !self.store.is_loaded(key) {
            debug!("Discarding build of block {}, no longer resident", key);
            return Ok(());
        }
        if self.blocks.contains_key(&key) {
            return Ok(());
        }

        let label = format!("terrain block {}", key);
        let vertex_buffer = self.device.create_vertex_buffer(&label, &build.vertices)?;
        let index_buffer = match self.device.create_index_buffer(&label) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.device.release_vertex_buffer(vertex_buffer);
                return Err(e);
            }
        };

        self.next_generation += 1;
        let zones = ZoneManager::new(key, self.layout, build.zone_bounds, vertex_buffer, index_buffer);
        self.blocks.insert(
            key,
            BlockRenderData {
                generation: self.next_generation,
                zones,
                bounds: build.bounds,
            },
        );
        info!(
            "Block {} renderable ({} vertices, generation {})",
            key,
            build.vertices.len(),
            self.next_generation
        );
        Ok(())
    }

    /// Upload half of a zone prepare. Stale generations are dropped.
    pub fn finish_zone_level(
        &mut self,
        key: BlockKey,
        generation: u64,
        zone: usize,
        level: LevelKey,
        indices: Vec<u32>,
    ) -> TerrainResult<()> {
        let Some(block) = self.blocks.get_mut(&key).filter(|b| b.generation == generation) else {
            debug!("Dropping zone {} upload for stale block {} (generation {})", zone, key, generation);
            return Ok(());
        };
        block.zones.finish_level(self.device.as_mut(), zone, level, &indices)?;
        Ok(())
    }

    /// Release a block's GPU buffers and every cached zone level with them
    pub fn evict(&mut self, key: BlockKey) -> bool {
        self.pending.remove(&key);
        match self.blocks.remove(&key) {
            Some(block) => {
                block.zones.release(self.device.as_mut());
                info!("Released render data of block {}", key);
                true
            }
            None => false,
        }
    }

    pub fn evict_all(&mut self) -> usize {
        self.pending.clear();
        let keys = self.block_keys();
        keys.into_iter().filter(|&key| self.evict(key)).count()
    }

    pub fn block(&self, key: BlockKey) -> Option<&BlockRenderData> {
        self.blocks.get(&key)
    }

    pub fn block_keys(&self) -> Vec<BlockKey> {
        let mut keys: Vec<_> = self.blocks.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn is_renderable(&self, key: BlockKey) -> bool {
        self.blocks.contains_key(&key)
    }

    pub fn is_pending(&self, key: BlockKey) -> bool {
        self.pending.contains(&key)
    }

    pub fn device(&self) -> &dyn GpuDevice {
        self.device.as_ref()
    }
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub blocks_resident: usize,
    pub blocks_requested: usize,
    pub blocks_evicted: usize,
    pub blocks_drawn: usize,
    pub blocks_culled: usize,
    pub zones_drawn: usize,
    pub zones_culled: usize,
    pub zones_pending: usize,
    pub zones_submitted: usize,
    pub triangles: u64,
    pub uploads_run: usize,
}

pub struct TerrainRenderManager {
    settings: TerrainSettings,
    layout: ZoneLayout,
    render_options: RenderOptions,
    // Must drop before `scene`
    scheduler: TaskScheduler<TerrainScene>,
    store: Arc<BlockStore>,
    scene: TerrainScene,
    viewer: Vec3,
    last_scan: Option<Instant>,
    running: bool,
}

impl TerrainRenderManager {
    pub fn new(
        settings: TerrainSettings,
        source: Arc<dyn HeightfieldSource>,
        device: Box<dyn GpuDevice>,
    ) -> TerrainResult<Self> {
        settings.validate()?;
        let scheduler = TaskScheduler::new(&WorkerConfig::for_profile(settings.profile))?;
        let store = Arc::new(BlockStore::new(
            source,
            scheduler.background().clone(),
            settings.grid.block_size,
            settings.grid.sample_spacing,
        ));
        let layout = ZoneLayout::from_settings(&settings);
        let scene = TerrainScene::new(device, Arc::clone(&store), layout);

        info!(
            "Terrain manager ({:?} profile): blocks of {} quads, {}x{} zones, {} LOD levels",
            settings.profile,
            settings.grid.block_size,
            layout.zone_grid,
            layout.zone_grid,
            layout.levels
        );
        Ok(Self {
            render_options: RenderOptions {
                frustum_culling: settings.rendering.frustum_culling,
            },
            settings,
            layout,
            scheduler,
            store,
            scene,
            viewer: Vec3::ZERO,
            last_scan: None,
            running: true,
        })
    }

    pub fn set_viewer_position(&mut self, position: Vec3) {
        self.viewer = position;
    }

    pub fn viewer_position(&self) -> Vec3 {
        self.viewer
    }

    pub fn settings(&self) -> &TerrainSettings {
        &self.settings
    }

    pub fn layout(&self) -> &ZoneLayout {
        &self.layout
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn scene(&self) -> &TerrainScene {
        &self.scene
    }

    pub fn scheduler(&self) -> &TaskScheduler<TerrainScene> {
        &self.scheduler
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_frustum_culling(&mut self, enabled: bool) {
        self.render_options.frustum_culling = enabled;
    }

    /// Per-frame streaming step: rescan the prefetch window when due, then
    /// run up to `uploads_per_frame` upload tasks
    pub fn update(&mut self, token: &RenderContextToken, now: Instant) -> FrameStats {
        let mut stats = FrameStats::default();
        let due = self
            .last_scan
            .map_or(true, |last| now.saturating_duration_since(last) >= self.settings.rescan_interval());
        if self.running && due {
            self.last_scan = Some(now);
            self.scan(&mut stats);
        }
        stats.uploads_run =
            self.scheduler
                .upload()
                .drain(token, &mut self.scene, self.settings.streaming.uploads_per_frame);
        stats.blocks_resident = self.scene.blocks.len();
        stats
    }

    /// Re-evaluate the prefetch window right away, bypassing the throttle
    pub fn rescan(&mut self) -> FrameStats {
        let mut stats = FrameStats::default();
        if self.running {
            self.scan(&mut stats);
        }
        stats.blocks_resident = self.scene.blocks.len();
        stats
    }

    fn scan(&mut self, stats: &mut FrameStats) {
        let viewer = self.viewer.truncate();
        let radius = self.settings.streaming.prefetch_radius;

        self.store.cleanup(viewer, radius);
        for key in self.scene.block_keys() {
            if !self.store.is_loaded(key) && self.scene.evict(key) {
                stats.blocks_evicted += 1;
            }
        }

        // Failed loads are neither loading nor loaded; forget them so they are retried
        let store = &self.store;
        self.scene.pending.retain(|&key| store.is_loading(key) || store.is_loaded(key));

        for key in self.store.prefetch_window(viewer, radius) {
            if self.scene.is_renderable(key) || self.scene.is_pending(key) {
                continue;
            }
            self.scene.pending.insert(key);
            self.request_block(key);
            stats.blocks_requested += 1;
        }
        if stats.blocks_requested > 0 || stats.blocks_evicted > 0 {
            debug!(
                "Prefetch scan at {:?}: {} requested, {} evicted",
                viewer, stats.blocks_requested, stats.blocks_evicted
            );
        }
    }

    fn request_block(&self, key: BlockKey) {
        let layout = self.layout;
        let background = self.scheduler.background().clone();
        let upload = self.scheduler.upload().clone();
        self.store.async_load_block(key, move |block| {
            let queued = background.add(move || {
                let build = BlockBuild::compute(&block, &layout);
                debug!("Built render data of block {}", build.key);
                upload.add(move |scene: &mut TerrainScene| {
                    scene.install_block(build)?;
                    Ok(())
                });
                Ok(())
            });
            if !queued {
                debug!("Build of block {} not queued, worker is cancelled", key);
            }
        });
    }

    /// Select every visible zone's level from viewer distance, prepare it and draw
    pub fn render(&mut self, _token: &RenderContextToken, frustum: Option<&Frustum>) -> FrameStats {
        let mut stats = FrameStats::default();
        let viewer = self.viewer;
        let thresholds = &self.settings.lod.thresholds;
        let layout = self.layout;
        let options = self.render_options;
        let scheduler = &self.scheduler;
        let TerrainScene {
            device, blocks, store, ..
        } = &mut self.scene;

        for (&key, block) in blocks.iter_mut() {
            if let (true, Some(frustum)) = (options.frustum_culling, frustum) {
                if frustum.is_box_inside(&block.bounds) == Containment::Outside {
                    stats.blocks_culled += 1;
                    continue;
                }
            }

            let data = store.get_block(key);
            for zone in 0..block.zones.zone_count() {
                let (gx, gy) = global_zone_coords(&layout, key, zone);
                let level = global_zone_level(&layout, thresholds, viewer, gx, gy);
                let neighbors = Side::ALL.map(|side| {
                    let (dx, dy) = side.offset();
                    Some(global_zone_level(&layout, thresholds, viewer, gx + dx as i64, gy + dy as i64))
                });
                let outcome = block
                    .zones
                    .prepare_zone(zone, level, neighbors, &data, block.generation, scheduler);
                if outcome == PrepareOutcome::Submitted {
                    stats.zones_submitted += 1;
                }
            }

            match block.zones.render(device.as_mut(), &options, frustum) {
                Ok(zones) => {
                    stats.blocks_drawn += 1;
                    stats.zones_drawn += zones.drawn;
                    stats.zones_culled += zones.culled;
                    stats.zones_pending += zones.pending;
                    stats.triangles += zones.triangles;
                }
                Err(e) => warn!("Failed to render block {}: {}", key, e),
            }
        }
        stats.blocks_resident = blocks.len();
        stats
    }

    /// One-shot callback for when the background worker next runs dry
    pub fn on_streaming_idle<F>(&self, handler: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.background().set_empty_handler(handler)
    }

    /// Continuous-metric mesh of a whole resident block for the current viewer,
    /// with its own vertex list
    pub fn build_preview_mesh(&self, key: BlockKey) -> TerrainResult<CompiledMesh> {
        if !self.store.is_loaded(key) {
            return Err(TerrainError::BlockNotLoaded(key));
        }
        let block = self.store.get_block(key);
        let tile = TileView::whole(&block, self.settings.grid.sample_spacing);
        let metric = DetailMetric::Continuous {
            viewer: self.viewer,
            tolerance: self.settings.lod.continuous_tolerance,
            detail_scale: self.settings.lod.continuous_detail_scale,
        };
        let map = reduce(&tile, &metric);
        Ok(MeshTrianglesCompiler.compile(&map, &tile))
    }

    /// Resume streaming after [`done`](Self::done)
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        self.scheduler.background().resume();
        self.last_scan = None;
        self.running = true;
        info!("Terrain streaming started");
    }

    /// Stop streaming and release every block. Waits for the task running on
    /// the worker, if any; everything still queued is dropped.
    pub fn done(&mut self, _token: &RenderContextToken) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.scheduler.cancel();
        let uploads = self.scheduler.upload().clear();
        let released = self.scene.evict_all();
        let dropped = self.store.clear();
        info!(
            "Terrain streaming stopped: {} blocks released, {} unloaded, {} uploads dropped",
            released,
            dropped.len(),
            uploads
        );
    }
}

impl Drop for TerrainRenderManager {
    fn drop(&mut self) {
        self.teardown();
    }
}
