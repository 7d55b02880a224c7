use std::fmt;

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use super::{TerrainError, TerrainResult};

/// Integer block coordinate, the identity of a block in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct BlockKey {
    pub x: i32,
    pub y: i32,
}

impl BlockKey {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Block containing a world-space position (XY plane, Z is up)
    pub fn from_world(position: Vec2, block_extent: f32) -> Self {
        Self {
            x: (position.x / block_extent).floor() as i32,
            y: (position.y / block_extent).floor() as i32,
        }
    }

    /// World-space corner of the block with the smallest coordinates
    pub fn origin(&self, block_extent: f32) -> Vec2 {
        Vec2::new(self.x as f32 * block_extent, self.y as f32 * block_extent)
    }

    pub fn offset(&self, dx: i32, dy: i32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }

    /// Keys of the `(2 * radius + 1)^2` window centred on this block, row by row
    pub fn neighborhood(&self, radius: i32) -> impl Iterator<Item = BlockKey> + '_ {
        (-radius..=radius).flat_map(move |dy| (-radius..=radius).map(move |dx| self.offset(dx, dy)))
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.y)
    }
}

/// Maps lattice coordinates of a square grid to a row-major index and back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridMapper {
    dim: u32,
}

impl GridMapper {
    pub fn new(dim: u32) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> u32 {
        self.dim
    }

    pub fn len(&self) -> usize {
        (self.dim as usize) * (self.dim as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.dim == 0
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.dim && y < self.dim, "({}, {}) outside {}x{} grid", x, y, self.dim, self.dim);
        (y as usize) * (self.dim as usize) + x as usize
    }

    #[inline]
    pub fn coord(&self, index: usize) -> (u32, u32) {
        let dim = self.dim as usize;
        ((index % dim) as u32, (index / dim) as u32)
    }
}

/// Square heightfield tile of `size` quads, holding `(size + 1)^2` samples
///
/// The extra row and column duplicate the first row and column of the
/// neighbouring blocks, so adjacent blocks meet without gaps. Immutable
/// once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightfieldBlock {
    key: BlockKey,
    size: u32,
    mapper: GridMapper,
    heights: Vec<f32>,
    min_height: f32,
    max_height: f32,
}

impl HeightfieldBlock {
    pub fn new(key: BlockKey, size: u32, heights: Vec<f32>) -> TerrainResult<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(TerrainError::InvalidBlockSize(size));
        }
        let mapper = GridMapper::new(size + 1);
        if heights.len() != mapper.len() {
            return Err(TerrainError::SourceFormat {
                key,
                reason: format!("expected {} samples, got {}", mapper.len(), heights.len()),
            });
        }
        let (min_height, max_height) = heights
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &h| (lo.min(h), hi.max(h)));
        Ok(Self {
            key,
            size,
            mapper,
            heights,
            min_height,
            max_height,
        })
    }

    /// Flat block at height zero
    pub fn flat(key: BlockKey, size: u32) -> TerrainResult<Self> {
        let dim = size as usize + 1;
        Self::new(key, size, vec![0.0; dim * dim])
    }

    /// Placeholder handed out by the store for blocks that are not loaded yet
    pub fn empty() -> Self {
        Self {
            key: BlockKey::default(),
            size: 0,
            mapper: GridMapper::new(0),
            heights: Vec::new(),
            min_height: 0.0,
            max_height: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mapper(&self) -> GridMapper {
        self.mapper
    }

    pub fn heights(&self) -> &[f32] {
        &self.heights
    }

    pub fn height_range(&self) -> (f32, f32) {
        (self.min_height, self.max_height)
    }

    #[inline]
    pub fn height(&self, x: u32, y: u32) -> f32 {
        self.heights[self.mapper.index(x, y)]
    }

    /// Surface normal from central differences, clamped at the block border
    pub fn normal_at(&self, x: u32, y: u32, spacing: f32) -> Vec3 {
        let max = self.size;
        let x0 = x.saturating_sub(1);
        let x1 = (x + 1).min(max);
        let y0 = y.saturating_sub(1);
        let y1 = (y + 1).min(max);
        let dx = (self.height(x1, y) - self.height(x0, y)) / ((x1 - x0).max(1) as f32 * spacing);
        let dy = (self.height(x, y1) - self.height(x, y0)) / ((y1 - y0).max(1) as f32 * spacing);
        Vec3::new(-dx, -dy, 1.0).normalize()
    }

    /// Copy the `(size + 1)^2` samples of a square window starting at `(x0, y0)`
    pub fn extract(&self, x0: u32, y0: u32, size: u32) -> Vec<f32> {
        debug_assert!(x0 + size <= self.size && y0 + size <= self.size);
        let mut samples = Vec::with_capacity(((size + 1) * (size + 1)) as usize);
        for y in y0..=y0 + size {
            let row = self.mapper.index(x0, y);
            samples.extend_from_slice(&self.heights[row..=row + size as usize]);
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_key_from_world() {
        assert_eq!(BlockKey::from_world(Vec2::new(10.0, 600.0), 512.0), BlockKey::new(0, 1));
        assert_eq!(BlockKey::from_world(Vec2::new(-1.0, 0.0), 512.0), BlockKey::new(-1, 0));
        assert_eq!(BlockKey::new(2, -1).origin(512.0), Vec2::new(1024.0, -512.0));
    }

    #[test]
    fn test_neighborhood_is_three_by_three() {
        let keys: Vec<_> = BlockKey::new(5, 5).neighborhood(1).collect();
        assert_eq!(keys.len(), 9);
        assert_eq!(keys[0], BlockKey::new(4, 4));
        assert_eq!(keys[8], BlockKey::new(6, 6));
    }

    #[test]
    fn test_grid_mapper_round_trip() {
        let mapper = GridMapper::new(9);
        assert_eq!(mapper.index(3, 2), 21);
        assert_eq!(mapper.coord(21), (3, 2));
        assert_eq!(mapper.len(), 81);
    }

    #[test]
    fn test_block_rejects_bad_sizes() {
        assert!(matches!(
            HeightfieldBlock::new(BlockKey::default(), 6, vec![0.0; 49]),
            Err(TerrainError::InvalidBlockSize(6))
        ));
        assert!(matches!(
            HeightfieldBlock::new(BlockKey::default(), 8, vec![0.0; 10]),
            Err(TerrainError::SourceFormat { .. })
        ));
    }

    #[test]
    fn test_extract_window() {
        let heights: Vec<f32> = (0..81).map(|i| i as f32).collect();
        let block = HeightfieldBlock::new(BlockKey::default(), 8, heights).unwrap();
        let window = block.extract(4, 4, 4);
        assert_eq!(window.len(), 25);
        assert_eq!(window[0], block.height(4, 4));
        assert_eq!(window[24], block.height(8, 8));
        assert_eq!(block.height_range(), (0.0, 80.0));
    }

    #[test]
    fn test_flat_normal_points_up() {
        let block = HeightfieldBlock::flat(BlockKey::default(), 4).unwrap();
        assert_eq!(block.normal_at(2, 2, 1.0), Vec3::Z);
        assert_eq!(block.normal_at(0, 4, 1.0), Vec3::Z);
    }
}
