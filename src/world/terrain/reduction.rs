//! Restricted-quadtree reduction
//!
//! A tile of size `S = 2^k` has an `(S + 1)^2` lattice. The reduction walks
//! the quadtree top-down from the whole tile; each quad is either accepted as
//! a leaf, activating its four corners and its centre, or split into four.
//! Because every visited quad has all of its corners active, a lattice point
//! is never active without the coarser points it depends on.

use glam::{Vec2, Vec3};

use super::{GridMapper, HeightfieldBlock};
use crate::utils::math::{coordinate_scale, AABox};

/// One side of a square tile, with `y` growing north
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    South,
    East,
    North,
    West,
}

impl Side {
    pub const ALL: [Side; 4] = [Side::South, Side::East, Side::North, Side::West];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::South => Side::North,
            Side::East => Side::West,
            Side::North => Side::South,
            Side::West => Side::East,
        }
    }

    /// Grid step towards the neighbour on this side
    pub fn offset(self) -> (i32, i32) {
        match self {
            Side::South => (0, -1),
            Side::East => (1, 0),
            Side::North => (0, 1),
            Side::West => (-1, 0),
        }
    }

    /// Lattice point `t` along this side, counted in increasing x or y
    pub fn point(self, t: u32, size: u32) -> (u32, u32) {
        match self {
            Side::South => (t, 0),
            Side::East => (size, t),
            Side::North => (t, size),
            Side::West => (0, t),
        }
    }
}

/// Which lattice points of a tile are mesh vertices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveVertexMap {
    size: u32,
    mapper: GridMapper,
    active: Vec<bool>,
}

impl ActiveVertexMap {
    pub fn new(size: u32) -> Self {
        let mapper = GridMapper::new(size + 1);
        Self {
            size,
            mapper,
            active: vec![false; mapper.len()],
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn is_active(&self, x: u32, y: u32) -> bool {
        self.active[self.mapper.index(x, y)]
    }

    #[inline]
    pub fn activate(&mut self, x: u32, y: u32) {
        let i = self.mapper.index(x, y);
        self.active[i] = true;
    }

    pub fn count(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    pub fn active_points(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.active
            .iter()
            .enumerate()
            .filter(|(_, &a)| a)
            .map(|(i, _)| self.mapper.coord(i))
    }

    /// Activation along one border, ordered by increasing coordinate
    pub fn edge(&self, side: Side) -> Vec<bool> {
        (0..=self.size)
            .map(|t| {
                let (x, y) = side.point(t, self.size);
                self.is_active(x, y)
            })
            .collect()
    }

    /// Activate every point of `side` that is set in `edge`
    pub fn merge_edge(&mut self, side: Side, edge: &[bool]) {
        debug_assert_eq!(edge.len(), self.size as usize + 1);
        for (t, _) in edge.iter().enumerate().filter(|(_, &a)| a) {
            let (x, y) = side.point(t as u32, self.size);
            self.activate(x, y);
        }
    }

    /// Border activation of a [`DetailMetric::Discrete`] reduction, which
    /// depends only on the tile size and the detail
    pub fn uniform_edge(size: u32, detail: u32) -> Vec<bool> {
        let step = (size >> detail.min(DetailMetric::max_detail(size))).max(1);
        (0..=size).map(|t| t % step == 0).collect()
    }

    fn activate_quad(&mut self, x: u32, y: u32, s: u32) {
        self.activate(x, y);
        self.activate(x + s, y);
        self.activate(x, y + s);
        self.activate(x + s, y + s);
        if s >= 2 {
            self.activate(x + s / 2, y + s / 2);
        }
    }

    /// Coarser points that must be active whenever `(x, y)` is
    ///
    /// A point that is the midpoint of a quad edge depends on the two edge
    /// endpoints; a quad centre depends on the four quad corners.
    pub fn dependencies(&self, x: u32, y: u32) -> Vec<(u32, u32)> {
        let sx = coordinate_scale(x, self.size);
        let sy = coordinate_scale(y, self.size);
        let s = sx.min(sy);
        if s >= self.size {
            Vec::new()
        } else if sx == sy {
            vec![(x - s, y - s), (x + s, y - s), (x - s, y + s), (x + s, y + s)]
        } else if sx < sy {
            vec![(x - s, y), (x + s, y)]
        } else {
            vec![(x, y - s), (x, y + s)]
        }
    }

    /// Active points with an inactive dependency. Empty for every map the reduction produces.
    pub fn missing_dependencies(&self) -> Vec<(u32, u32)> {
        self.active_points()
            .filter(|&(x, y)| self.dependencies(x, y).iter().any(|&(px, py)| !self.is_active(px, py)))
            .collect()
    }
}

/// Read-only window onto a square region of a block
#[derive(Debug, Clone, Copy)]
pub struct TileView<'a> {
    block: &'a HeightfieldBlock,
    x0: u32,
    y0: u32,
    size: u32,
    spacing: f32,
}

impl<'a> TileView<'a> {
    pub fn new(block: &'a HeightfieldBlock, x0: u32, y0: u32, size: u32, spacing: f32) -> Self {
        debug_assert!(x0 + size <= block.size() && y0 + size <= block.size());
        Self {
            block,
            x0,
            y0,
            size,
            spacing,
        }
    }

    pub fn whole(block: &'a HeightfieldBlock, spacing: f32) -> Self {
        Self::new(block, 0, 0, block.size(), spacing)
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn height(&self, x: u32, y: u32) -> f32 {
        self.block.height(self.x0 + x, self.y0 + y)
    }

    pub fn world_position(&self, x: u32, y: u32) -> Vec3 {
        let origin = self.block.key().origin(self.block.size() as f32 * self.spacing);
        Vec3::new(
            origin.x + (self.x0 + x) as f32 * self.spacing,
            origin.y + (self.y0 + y) as f32 * self.spacing,
            self.height(x, y),
        )
    }

    pub fn normal(&self, x: u32, y: u32) -> Vec3 {
        self.block.normal_at(self.x0 + x, self.y0 + y, self.spacing)
    }

    /// Texture coordinate across the whole block
    pub fn uv(&self, x: u32, y: u32) -> Vec2 {
        let size = self.block.size() as f32;
        Vec2::new((self.x0 + x) as f32 / size, (self.y0 + y) as f32 / size)
    }

    pub fn bounds(&self) -> AABox {
        let mut bounds = AABox::empty();
        for y in 0..=self.size {
            for x in 0..=self.size {
                bounds.extend(self.world_position(x, y));
            }
        }
        bounds
    }

    /// Largest vertical distance between the surface and the bilinear patch
    /// spanned by the quad's corners
    pub fn geometric_error(&self, x: u32, y: u32, s: u32) -> f32 {
        let h00 = self.height(x, y);
        let h10 = self.height(x + s, y);
        let h01 = self.height(x, y + s);
        let h11 = self.height(x + s, y + s);
        let inv = 1.0 / s as f32;
        let mut error = 0.0f32;
        for j in 0..=s {
            let v = j as f32 * inv;
            for i in 0..=s {
                let u = i as f32 * inv;
                let bottom = h00 + (h10 - h00) * u;
                let top = h01 + (h11 - h01) * u;
                let approx = bottom + (top - bottom) * v;
                error = error.max((self.height(x + i, y + j) - approx).abs());
            }
        }
        error
    }
}

/// How much detail a tile should keep
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DetailMetric {
    /// Uniform detail; 0 is the coarsest and `log2(size)` keeps every point
    Discrete(u32),
    /// Split while the quad's geometric error, scaled by viewer distance,
    /// exceeds `tolerance`
    Continuous {
        viewer: Vec3,
        tolerance: f32,
        detail_scale: f32,
    },
}

impl DetailMetric {
    pub fn max_detail(size: u32) -> u32 {
        size.trailing_zeros()
    }

    fn should_split(&self, tile: &TileView<'_>, x: u32, y: u32, s: u32) -> bool {
        match *self {
            DetailMetric::Discrete(detail) => {
                let detail = detail.min(Self::max_detail(tile.size()));
                s > tile.size() >> detail
            }
            DetailMetric::Continuous {
                viewer,
                tolerance,
                detail_scale,
            } => {
                let center = tile.world_position(x + s / 2, y + s / 2);
                let distance = viewer.distance(center).max(1.0);
                tile.geometric_error(x, y, s) * detail_scale / distance > tolerance
            }
        }
    }
}

/// Neighbour activation to force onto each border before reducing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeConstraints {
    edges: [Option<Vec<bool>>; 4],
}

impl EdgeConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, side: Side, edge: Vec<bool>) {
        self.edges[side.index()] = Some(edge);
    }

    pub fn with_edge(mut self, side: Side, edge: Vec<bool>) -> Self {
        self.set(side, edge);
        self
    }

    pub fn get(&self, side: Side) -> Option<&[bool]> {
        self.edges[side.index()].as_deref()
    }
}

/// Interior-only reduction of a tile
pub fn reduce(tile: &TileView<'_>, metric: &DetailMetric) -> ActiveVertexMap {
    let mut map = ActiveVertexMap::new(tile.size());
    subdivide(tile, metric, &mut map, 0, 0, tile.size());
    map
}

/// Reduction whose borders also carry the neighbours' border vertices
///
/// Each `constraints` edge is the neighbour's interior activation along the
/// shared line. Forced points are added without splitting interior quads, so
/// two tiles built against each other's interior maps agree on their shared
/// border exactly.
pub fn reduce_with_edges(tile: &TileView<'_>, metric: &DetailMetric, constraints: &EdgeConstraints) -> ActiveVertexMap {
    let mut map = ActiveVertexMap::new(tile.size());
    for side in Side::ALL {
        if let Some(edge) = constraints.get(side) {
            map.merge_edge(side, edge);
        }
    }
    subdivide(tile, metric, &mut map, 0, 0, tile.size());
    map
}

fn subdivide(tile: &TileView<'_>, metric: &DetailMetric, map: &mut ActiveVertexMap, x: u32, y: u32, s: u32) {
    if s <= 1 || !metric.should_split(tile, x, y, s) {
        map.activate_quad(x, y, s);
        return;
    }
    let h = s / 2;
    subdivide(tile, metric, map, x, y, h);
    subdivide(tile, metric, map, x + h, y, h);
    subdivide(tile, metric, map, x, y + h, h);
    subdivide(tile, metric, map, x + h, y + h, h);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::terrain::{BlockKey, HeightfieldSource, ProceduralSource};

    fn flat(size: u32) -> HeightfieldBlock {
        HeightfieldBlock::flat(BlockKey::default(), size).unwrap()
    }

    #[test]
    fn test_coarsest_level_keeps_corners_and_centre() {
        let block = flat(8);
        let map = reduce(&TileView::whole(&block, 1.0), &DetailMetric::Discrete(0));
        assert_eq!(map.count(), 5);
        for (x, y) in [(0, 0), (8, 0), (0, 8), (8, 8), (4, 4)] {
            assert!(map.is_active(x, y));
        }
    }

    #[test]
    fn test_finest_level_keeps_everything() {
        let block = flat(8);
        let tile = TileView::whole(&block, 1.0);
        assert_eq!(reduce(&tile, &DetailMetric::Discrete(3)).count(), 81);
        // Levels above the maximum are clamped
        assert_eq!(reduce(&tile, &DetailMetric::Discrete(9)).count(), 81);
    }

    #[test]
    fn test_discrete_levels_are_nested() {
        let block = flat(16);
        let tile = TileView::whole(&block, 1.0);
        let maps: Vec<_> = (0..=4).map(|d| reduce(&tile, &DetailMetric::Discrete(d))).collect();
        for pair in maps.windows(2) {
            assert!(pair[0].active_points().all(|(x, y)| pair[1].is_active(x, y)));
            assert!(pair[1].count() > pair[0].count());
        }
    }

    #[test]
    fn test_flat_tile_is_maximally_reduced_by_continuous_metric() {
        let block = flat(32);
        let metric = DetailMetric::Continuous {
            viewer: Vec3::new(16.0, 16.0, 2.0),
            tolerance: 0.01,
            detail_scale: 100.0,
        };
        assert_eq!(reduce(&TileView::whole(&block, 1.0), &metric).count(), 5);
    }

    #[test]
    fn test_continuous_metric_keeps_more_detail_near_viewer() {
        let block = ProceduralSource::new(9).load_block(BlockKey::new(0, 0), 64).unwrap();
        let tile = TileView::whole(&block, 1.0);
        let near = DetailMetric::Continuous {
            viewer: tile.world_position(32, 32) + Vec3::Z * 5.0,
            tolerance: 0.02,
            detail_scale: 1.0,
        };
        let far = DetailMetric::Continuous {
            viewer: Vec3::new(5000.0, 5000.0, 60.0),
            tolerance: 0.02,
            detail_scale: 1.0,
        };
        let near_map = reduce(&tile, &near);
        let far_map = reduce(&tile, &far);
        assert!(near_map.count() > far_map.count());
        assert!(near_map.missing_dependencies().is_empty());
        assert!(far_map.missing_dependencies().is_empty());
    }

    #[test]
    fn test_edge_constraints_force_border_points() {
        let block = flat(8);
        let tile = TileView::whole(&block, 1.0);
        let fine_neighbour = reduce(&tile, &DetailMetric::Discrete(3));
        let constraints = EdgeConstraints::new().with_edge(Side::East, fine_neighbour.edge(Side::West));

        let map = reduce_with_edges(&tile, &DetailMetric::Discrete(0), &constraints);
        assert!((0..=8).all(|y| map.is_active(8, y)));
        assert!(!map.is_active(0, 4));
        // Interior stays coarse
        assert!(!map.is_active(2, 2));
        assert_eq!(map.count(), 5 + 7);
        assert!(map.missing_dependencies().is_empty());
    }

    #[test]
    fn test_uniform_edge_matches_discrete_reduction() {
        let block = flat(16);
        let tile = TileView::whole(&block, 1.0);
        for detail in 0..=5 {
            let map = reduce(&tile, &DetailMetric::Discrete(detail));
            for side in Side::ALL {
                assert_eq!(map.edge(side), ActiveVertexMap::uniform_edge(16, detail));
            }
        }
    }

    #[test]
    fn test_dependencies_of_midpoints_and_centres() {
        let map = ActiveVertexMap::new(8);
        assert!(map.dependencies(0, 8).is_empty());
        assert_eq!(map.dependencies(4, 0), vec![(0, 0), (8, 0)]);
        assert_eq!(map.dependencies(2, 4), vec![(0, 4), (4, 4)]);
        assert_eq!(map.dependencies(6, 2), vec![(4, 0), (8, 0), (4, 4), (8, 4)]);
    }
}
