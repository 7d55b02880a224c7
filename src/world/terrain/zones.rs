//! Zone manager
//!
//! A block is split into an N x N grid of zones, the unit of LOD selection
//! and of index upload. Every zone's lattice vertices live in one vertex
//! buffer per block; each prepared (zone, level) owns an immutable range of
//! the block's append-only index buffer.

use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use super::compiler::TrianglesCompiler;
use super::manager::TerrainScene;
use super::reduction::{reduce, reduce_with_edges, ActiveVertexMap, DetailMetric, EdgeConstraints, Side, TileView};
use super::{BlockKey, HeightfieldBlock, TerrainResult};
use crate::config::TerrainSettings;
use crate::rendering::{GpuDevice, IndexBufferId, IndexRange, VertexBufferId};
use crate::tasks::TaskScheduler;
use crate::utils::math::{AABox, Containment, Frustum};

/// How zones are laid out inside a block, and how levels map to detail
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneLayout {
    pub zone_grid: u32,
    pub zone_size: u32,
    pub spacing: f32,
    pub levels: u8,
    pub detail_step: u32,
}

impl ZoneLayout {
    pub fn from_settings(settings: &TerrainSettings) -> Self {
        Self {
            zone_grid: settings.grid.zone_grid,
            zone_size: settings.zone_size(),
            spacing: settings.grid.sample_spacing,
            levels: settings.lod.levels.max(1),
            detail_step: settings.lod.detail_step,
        }
    }

    pub fn zone_count(&self) -> usize {
        (self.zone_grid * self.zone_grid) as usize
    }

    pub fn vertices_per_zone(&self) -> u32 {
        (self.zone_size + 1) * (self.zone_size + 1)
    }

    /// World-space side length of one zone
    pub fn zone_extent(&self) -> f32 {
        self.zone_size as f32 * self.spacing
    }

    pub fn clamp_level(&self, level: u8) -> u8 {
        level.min(self.levels - 1)
    }

    /// Reduction detail for a zone level. Level 0 keeps every lattice point.
    pub fn detail_for_level(&self, level: u8) -> u32 {
        DetailMetric::max_detail(self.zone_size).saturating_sub(level as u32 * self.detail_step)
    }

    pub fn zone_coords(&self, index: usize) -> (u32, u32) {
        let grid = self.zone_grid as usize;
        ((index % grid) as u32, (index / grid) as u32)
    }

    pub fn zone_index(&self, zx: u32, zy: u32) -> usize {
        (zy * self.zone_grid + zx) as usize
    }

    /// Zone across `side` within the same block
    pub fn neighbor(&self, index: usize, side: Side) -> Option<usize> {
        let (zx, zy) = self.zone_coords(index);
        let (dx, dy) = side.offset();
        let nx = zx as i32 + dx;
        let ny = zy as i32 + dy;
        let range = 0..self.zone_grid as i32;
        (range.contains(&nx) && range.contains(&ny)).then(|| self.zone_index(nx as u32, ny as u32))
    }

    pub fn zone_tile<'a>(&self, block: &'a HeightfieldBlock, index: usize) -> TileView<'a> {
        let (zx, zy) = self.zone_coords(index);
        TileView::new(block, zx * self.zone_size, zy * self.zone_size, self.zone_size, self.spacing)
    }
}

/// Cache key of a zone's geometry: its level plus the effective level of each border
///
/// A border is drawn at the finer of the two levels meeting there, so the
/// same zone level needs different index lists as its neighbours change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LevelKey {
    pub level: u8,
    pub edges: [u8; 4],
}

impl LevelKey {
    /// `neighbors` is indexed by [`Side::index`]; `None` means no neighbour on that side
    pub fn new(level: u8, neighbors: [Option<u8>; 4]) -> Self {
        let mut edges = [level; 4];
        for (edge, neighbor) in edges.iter_mut().zip(neighbors) {
            if let Some(n) = neighbor {
                *edge = n.min(level);
            }
        }
        Self { level, edges }
    }

    pub fn uniform(level: u8) -> Self {
        Self::new(level, [None; 4])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneLevelData {
    pub range: IndexRange,
    pub bounds: AABox,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoneLevelState {
    Preparing,
    Prepared(ZoneLevelData),
}

/// What [`ZoneManager::prepare_zone`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Already drawing this level
    Current,
    /// Level was cached; switched to it
    Switched,
    /// Level is already being prepared
    Pending,
    /// Background reduction submitted
    Submitted,
    /// Block data missing or worker cancelled; nothing submitted
    Skipped,
}

/// Interior active vertex maps of every zone of one block at one level
///
/// Shared with background tasks so a zone being prepared can look at the
/// border its neighbour will draw.
#[derive(Debug)]
pub struct ActiveVertexBlockMap {
    level: u8,
    detail: u32,
    layout: ZoneLayout,
    maps: RwLock<Vec<Option<Arc<ActiveVertexMap>>>>,
}

impl ActiveVertexBlockMap {
    pub fn new(level: u8, layout: ZoneLayout) -> Self {
        Self {
            level,
            detail: layout.detail_for_level(level),
            layout,
            maps: RwLock::new(vec![None; layout.zone_count()]),
        }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn detail(&self) -> u32 {
        self.detail
    }

    pub fn get(&self, zone: usize) -> Option<Arc<ActiveVertexMap>> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)[zone].clone()
    }

    /// The zone's interior map, reducing it on first use
    pub fn get_or_reduce(&self, zone: usize, tile: &TileView<'_>) -> Arc<ActiveVertexMap> {
        if let Some(map) = self.get(zone) {
            return map;
        }
        let map = Arc::new(reduce(tile, &DetailMetric::Discrete(self.detail)));
        self.maps.write().unwrap_or_else(PoisonError::into_inner)[zone] = Some(Arc::clone(&map));
        map
    }

    /// Border that the zone across `side` draws at this level, as seen from `zone`
    ///
    /// Zones outside the block, or not reduced yet, fall back to the uniform
    /// border of this level, which is what their reduction will produce.
    pub fn neighbor_edge(&self, zone: usize, side: Side) -> Vec<bool> {
        match self.layout.neighbor(zone, side).and_then(|n| self.get(n)) {
            Some(map) => map.edge(side.opposite()),
            None => ActiveVertexMap::uniform_edge(self.layout.zone_size, self.detail),
        }
    }

    pub fn reduced_count(&self) -> usize {
        self.maps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.is_some())
            .count()
    }
}

/// Edge-aware active vertex map of one zone for one level key
pub fn zone_level_map(
    layout: &ZoneLayout,
    block_maps: &[Arc<ActiveVertexBlockMap>],
    tile: &TileView<'_>,
    zone: usize,
    key: LevelKey,
) -> ActiveVertexMap {
    let interior = block_maps[key.level as usize].get_or_reduce(zone, tile);

    let mut constraints = EdgeConstraints::new();
    let mut constrained = false;
    for side in Side::ALL {
        let edge_level = key.edges[side.index()];
        if edge_level < key.level {
            constraints.set(side, block_maps[edge_level as usize].neighbor_edge(zone, side));
            constrained = true;
        }
    }
    if !constrained {
        return (*interior).clone();
    }
    let detail = layout.detail_for_level(key.level);
    reduce_with_edges(tile, &DetailMetric::Discrete(detail), &constraints)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub frustum_culling: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self { frustum_culling: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZoneRenderStats {
    pub drawn: usize,
    pub culled: usize,
    pub pending: usize,
    pub triangles: u64,
}

impl AddAssign for ZoneRenderStats {
    fn add_assign(&mut self, other: Self) {
        self.drawn += other.drawn;
        self.culled += other.culled;
        self.pending += other.pending;
        self.triangles += other.triangles;
    }
}

#[derive(Debug)]
struct Zone {
    bounds: AABox,
    levels: HashMap<LevelKey, ZoneLevelState>,
    current: Option<LevelKey>,
    requested: Option<LevelKey>,
}

impl Zone {
    fn current_data(&self) -> Option<&ZoneLevelData> {
        match self.levels.get(&self.current?)? {
            ZoneLevelState::Prepared(data) => Some(data),
            ZoneLevelState::Preparing => None,
        }
    }
}

pub struct ZoneManager {
    key: BlockKey,
    layout: ZoneLayout,
    zones: Vec<Zone>,
    block_maps: Arc<Vec<Arc<ActiveVertexBlockMap>>>,
    vertex_buffer: VertexBufferId,
    index_buffer: IndexBufferId,
}

impl ZoneManager {
    pub fn new(
        key: BlockKey,
        layout: ZoneLayout,
        zone_bounds: Vec<AABox>,
        vertex_buffer: VertexBufferId,
        index_buffer: IndexBufferId,
    ) -> Self {
        debug_assert_eq!(zone_bounds.len(), layout.zone_count());
        let zones = zone_bounds
            .into_iter()
            .map(|bounds| Zone {
                bounds,
                levels: HashMap::new(),
                current: None,
                requested: None,
            })
            .collect();
        let block_maps = (0..layout.levels).map(|level| Arc::new(ActiveVertexBlockMap::new(level, layout))).collect();
        Self {
            key,
            layout,
            zones,
            block_maps: Arc::new(block_maps),
            vertex_buffer,
            index_buffer,
        }
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn layout(&self) -> &ZoneLayout {
        &self.layout
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    pub fn buffers(&self) -> (VertexBufferId, IndexBufferId) {
        (self.vertex_buffer, self.index_buffer)
    }

    pub fn zone_bounds(&self, zone: usize) -> AABox {
        self.zones[zone].bounds
    }

    pub fn current_level(&self, zone: usize) -> Option<LevelKey> {
        self.zones[zone].current
    }

    pub fn level_state(&self, zone: usize, key: LevelKey) -> Option<&ZoneLevelState> {
        self.zones[zone].levels.get(&key)
    }

    pub fn is_prepared(&self, zone: usize, key: LevelKey) -> bool {
        matches!(self.level_state(zone, key), Some(ZoneLevelState::Prepared(_)))
    }

    /// Number of (zone, level key) entries cached or in preparation
    pub fn cached_levels(&self) -> usize {
        self.zones.iter().map(|z| z.levels.len()).sum()
    }

    pub fn block_map(&self, level: u8) -> &Arc<ActiveVertexBlockMap> {
        &self.block_maps[self.layout.clamp_level(level) as usize]
    }

    /// Make `level` the zone's drawn level as soon as possible, without blocking
    ///
    /// Cached levels are switched to immediately. Otherwise the reduction and
    /// triangulation run on the background worker and the indices are
    /// appended to the block's index buffer by an upload task; the zone keeps
    /// drawing its previous level until then.
    pub fn prepare_zone(
        &mut self,
        zone_index: usize,
        level: u8,
        neighbors: [Option<u8>; 4],
        data: &Arc<HeightfieldBlock>,
        generation: u64,
        scheduler: &TaskScheduler<TerrainScene>,
    ) -> PrepareOutcome {
        let key = LevelKey::new(
            self.layout.clamp_level(level),
            neighbors.map(|n| n.map(|l| self.layout.clamp_level(l))),
        );
        let zone = &mut self.zones[zone_index];
        zone.requested = Some(key);

        if zone.current == Some(key) {
            return PrepareOutcome::Current;
        }
        match zone.levels.get(&key) {
            Some(ZoneLevelState::Prepared(_)) => {
                zone.current = Some(key);
                return PrepareOutcome::Switched;
            }
            Some(ZoneLevelState::Preparing) => return PrepareOutcome::Pending,
            None => {}
        }
        if data.is_empty() || data.key() != self.key {
            return PrepareOutcome::Skipped;
        }

        zone.levels.insert(key, ZoneLevelState::Preparing);

        let layout = self.layout;
        let block_maps = Arc::clone(&self.block_maps);
        let data = Arc::clone(data);
        let upload = scheduler.upload().clone();
        let block_key = self.key;
        let base_vertex = zone_index as u32 * layout.vertices_per_zone();

        let submitted = scheduler.add(move || {
            let tile = layout.zone_tile(&data, zone_index);
            let map = zone_level_map(&layout, &block_maps, &tile, zone_index, key);
            let indices = TrianglesCompiler::new(base_vertex, layout.zone_size).compile(&map);
            debug!(
                "Reduced zone {} of block {} at {:?}: {} vertices, {} triangles",
                zone_index,
                block_key,
                key,
                map.count(),
                indices.len() / 3
            );
            upload.add(move |scene: &mut TerrainScene| {
                scene.finish_zone_level(block_key, generation, zone_index, key, indices)?;
                Ok(())
            });
            Ok(())
        });

        if submitted {
            PrepareOutcome::Submitted
        } else {
            self.zones[zone_index].levels.remove(&key);
            PrepareOutcome::Skipped
        }
    }

    /// Append a prepared index list and record its range. Runs on the render thread.
    pub fn finish_level(
        &mut self,
        device: &mut dyn GpuDevice,
        zone_index: usize,
        key: LevelKey,
        indices: &[u32],
    ) -> TerrainResult<IndexRange> {
        let zone = &mut self.zones[zone_index];
        debug_assert!(
            matches!(zone.levels.get(&key), Some(ZoneLevelState::Preparing)),
            "zone {} level {:?} finished without being prepared",
            zone_index,
            key
        );

        let start = match device.append_indices(self.index_buffer, indices) {
            Ok(start) => start,
            Err(e) => {
                // Forget the level so a later prepare retries it
                zone.levels.remove(&key);
                return Err(e);
            }
        };
        let range = IndexRange::from_indices(start, indices);
        zone.levels.insert(
            key,
            ZoneLevelState::Prepared(ZoneLevelData {
                range,
                bounds: zone.bounds,
            }),
        );
        if zone.requested == Some(key) || zone.current.is_none() {
            zone.current = Some(key);
        }
        Ok(range)
    }

    /// Draw every zone's current level. Zones with nothing prepared yet are skipped.
    pub fn render(
        &self,
        device: &mut dyn GpuDevice,
        options: &RenderOptions,
        frustum: Option<&Frustum>,
    ) -> TerrainResult<ZoneRenderStats> {
        let mut stats = ZoneRenderStats::default();
        device.bind(self.vertex_buffer, self.index_buffer)?;
        let result = self.draw_zones(device, options, frustum, &mut stats);
        device.unbind();
        result.map(|_| stats)
    }

    fn draw_zones(
        &self,
        device: &mut dyn GpuDevice,
        options: &RenderOptions,
        frustum: Option<&Frustum>,
        stats: &mut ZoneRenderStats,
    ) -> TerrainResult<()> {
        for zone in &self.zones {
            let Some(data) = zone.current_data() else {
                stats.pending += 1;
                continue;
            };
            if let (true, Some(frustum)) = (options.frustum_culling, frustum) {
                if frustum.is_box_inside(&data.bounds) == Containment::Outside {
                    stats.culled += 1;
                    continue;
                }
            }
            if data.range.is_empty() {
                continue;
            }
            device.draw_range(&data.range)?;
            stats.drawn += 1;
            stats.triangles += data.range.triangle_count() as u64;
        }
        Ok(())
    }

    /// Free the block's GPU buffers. Every cached range goes with them.
    pub fn release(self, device: &mut dyn GpuDevice) {
        device.release_index_buffer(self.index_buffer);
        device.release_vertex_buffer(self.vertex_buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::rendering::{RecordingDevice, TerrainVertex};
    use glam::Vec3;

    fn layout() -> ZoneLayout {
        ZoneLayout {
            zone_grid: 4,
            zone_size: 8,
            spacing: 1.0,
            levels: 3,
            detail_step: 1,
        }
    }

    fn block_maps(layout: ZoneLayout) -> Vec<Arc<ActiveVertexBlockMap>> {
        (0..layout.levels).map(|l| Arc::new(ActiveVertexBlockMap::new(l, layout))).collect()
    }

    #[test]
    fn test_level_key_takes_finest_border() {
        let key = LevelKey::new(2, [Some(0), None, Some(2), Some(1)]);
        assert_eq!(key.edges, [0, 2, 2, 1]);
        let key = LevelKey::new(0, [Some(2); 4]);
        assert_eq!(key, LevelKey::uniform(0));
    }

    #[test]
    fn test_layout_levels_and_neighbours() {
        let layout = layout();
        assert_eq!(layout.detail_for_level(0), 3);
        assert_eq!(layout.detail_for_level(2), 1);
        assert_eq!(layout.clamp_level(7), 2);
        assert_eq!(layout.neighbor(0, Side::East), Some(1));
        assert_eq!(layout.neighbor(0, Side::North), Some(4));
        assert_eq!(layout.neighbor(0, Side::West), None);
        assert_eq!(layout.neighbor(15, Side::North), None);
    }

    #[test]
    fn test_adjacent_zones_share_border_vertices() {
        let layout = layout();
        let block = HeightfieldBlock::flat(BlockKey::default(), 32).unwrap();
        let maps = block_maps(layout);

        for (near, far) in [(0u8, 2u8), (2, 0), (1, 2), (0, 1)] {
            let west = LevelKey::new(near, [None, Some(far), None, None]);
            let east = LevelKey::new(far, [None, None, None, Some(near)]);
            let west_map = zone_level_map(&layout, &maps, &layout.zone_tile(&block, 0), 0, west);
            let east_map = zone_level_map(&layout, &maps, &layout.zone_tile(&block, 1), 1, east);

            assert_eq!(west_map.edge(Side::East), east_map.edge(Side::West), "levels {} / {}", near, far);
            assert!(west_map.missing_dependencies().is_empty());
            assert!(east_map.missing_dependencies().is_empty());
        }
    }

    #[test]
    fn test_prepare_zone_is_idempotent() {
        let layout = layout();
        let scheduler: TaskScheduler<TerrainScene> = TaskScheduler::new(&WorkerConfig::default()).unwrap();
        let mut device = RecordingDevice::default();
        let vertices = vec![TerrainVertex::new(Vec3::ZERO, Vec3::Z, glam::Vec2::ZERO, glam::Vec4::ONE); 81 * 16];
        let vb = device.create_vertex_buffer("zones", &vertices).unwrap();
        let ib = device.create_index_buffer("zones").unwrap();
        let data = Arc::new(HeightfieldBlock::flat(BlockKey::default(), 32).unwrap());
        let mut zones = ZoneManager::new(BlockKey::default(), layout, vec![AABox::default(); 16], vb, ib);

        let neighbors = [None, Some(1), None, None];
        assert_eq!(zones.prepare_zone(0, 1, neighbors, &data, 1, &scheduler), PrepareOutcome::Submitted);
        assert_eq!(zones.prepare_zone(0, 1, neighbors, &data, 1, &scheduler), PrepareOutcome::Pending);
        assert_eq!(scheduler.background().stats().submitted, 1);

        // The upload half, run by hand
        let key = LevelKey::new(1, neighbors);
        zones.finish_level(&mut device, 0, key, &[0, 1, 9]).unwrap();
        assert_eq!(zones.current_level(0), Some(key));
        assert_eq!(zones.prepare_zone(0, 1, neighbors, &data, 1, &scheduler), PrepareOutcome::Current);

        // A different level goes to the worker, then switching back is free
        assert_eq!(zones.prepare_zone(0, 2, neighbors, &data, 1, &scheduler), PrepareOutcome::Submitted);
        assert_eq!(zones.current_level(0), Some(key));
        zones.finish_level(&mut device, 0, LevelKey::new(2, neighbors), &[0, 2, 18]).unwrap();
        assert_eq!(zones.current_level(0), Some(LevelKey::new(2, neighbors)));
        assert_eq!(zones.prepare_zone(0, 1, neighbors, &data, 1, &scheduler), PrepareOutcome::Switched);
        assert_eq!(scheduler.background().stats().submitted, 2);

        let stats = zones.render(&mut device, &RenderOptions::default(), None).unwrap();
        assert_eq!((stats.drawn, stats.pending), (1, 15));
    }

    #[test]
    fn test_placeholder_data_is_skipped() {
        let scheduler: TaskScheduler<TerrainScene> = TaskScheduler::new(&WorkerConfig::default()).unwrap();
        let mut zones = ZoneManager::new(
            BlockKey::default(),
            layout(),
            vec![AABox::default(); 16],
            VertexBufferId(1),
            IndexBufferId(2),
        );
        let placeholder = Arc::new(HeightfieldBlock::empty());
        assert_eq!(zones.prepare_zone(3, 0, [None; 4], &placeholder, 1, &scheduler), PrepareOutcome::Skipped);
        assert_eq!(zones.cached_levels(), 0);
    }
}
