//! Triangulation of active vertex maps
//!
//! The compiler re-walks the quadtree the reduction built: a quad of size 4
//! or more was split exactly when the centre of its south-west child is
//! active. Each leaf is drawn as a fan around its centre through every
//! active point on its perimeter, so a finer neighbour's extra edge vertices
//! are always part of the fan and no T-junctions appear.

use glam::{Vec3, Vec4};

use super::reduction::{ActiveVertexMap, TileView};
use super::GridMapper;
use crate::rendering::TerrainVertex;

type Triangle = [(u32, u32); 3];

fn triangulate<F: FnMut(Triangle)>(map: &ActiveVertexMap, emit: &mut F) {
    if map.size() > 0 {
        walk(map, 0, 0, map.size(), emit);
    }
}

fn walk<F: FnMut(Triangle)>(map: &ActiveVertexMap, x: u32, y: u32, s: u32, emit: &mut F) {
    if s >= 4 && map.is_active(x + s / 4, y + s / 4) {
        let h = s / 2;
        walk(map, x, y, h, emit);
        walk(map, x + h, y, h, emit);
        walk(map, x, y + h, h, emit);
        walk(map, x + h, y + h, h, emit);
    } else if s == 1 {
        emit([(x, y), (x + 1, y), (x + 1, y + 1)]);
        emit([(x, y), (x + 1, y + 1), (x, y + 1)]);
    } else {
        fan(map, x, y, s, emit);
    }
}

fn fan<F: FnMut(Triangle)>(map: &ActiveVertexMap, x: u32, y: u32, s: u32, emit: &mut F) {
    let center = (x + s / 2, y + s / 2);
    if !map.is_active(center.0, center.1) {
        emit([(x, y), (x + s, y), (x + s, y + s)]);
        emit([(x, y), (x + s, y + s), (x, y + s)]);
        return;
    }

    // Counter-clockwise from the south-west corner
    let mut ring = Vec::with_capacity(4 * s as usize);
    ring.extend((0..s).map(|i| (x + i, y)));
    ring.extend((0..s).map(|i| (x + s, y + i)));
    ring.extend((0..s).map(|i| (x + s - i, y + s)));
    ring.extend((0..s).map(|i| (x, y + s - i)));
    ring.retain(|&(px, py)| map.is_active(px, py));

    for i in 0..ring.len() {
        emit([center, ring[i], ring[(i + 1) % ring.len()]]);
    }
}

/// Emits indices into a vertex buffer that already holds the tile's full
/// `(size + 1)^2` lattice starting at `base_vertex`
#[derive(Debug, Clone, Copy)]
pub struct TrianglesCompiler {
    base_vertex: u32,
    mapper: GridMapper,
}

impl TrianglesCompiler {
    pub fn new(base_vertex: u32, tile_size: u32) -> Self {
        Self {
            base_vertex,
            mapper: GridMapper::new(tile_size + 1),
        }
    }

    pub fn compile(&self, map: &ActiveVertexMap) -> Vec<u32> {
        debug_assert_eq!(map.size() + 1, self.mapper.dim());
        let mut indices = Vec::new();
        triangulate(map, &mut |triangle: Triangle| {
            for (x, y) in triangle {
                indices.push(self.base_vertex + self.mapper.index(x, y) as u32);
            }
        });
        indices
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledMesh {
    pub vertices: Vec<TerrainVertex>,
    pub indices: Vec<u32>,
}

impl CompiledMesh {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Emits only the vertices the triangulation uses, for a dedicated per-tile buffer
#[derive(Debug, Clone, Copy, Default)]
pub struct MeshTrianglesCompiler;

impl MeshTrianglesCompiler {
    pub fn compile(&self, map: &ActiveVertexMap, tile: &TileView<'_>) -> CompiledMesh {
        let mapper = GridMapper::new(map.size() + 1);
        let mut remap = vec![u32::MAX; mapper.len()];
        let mut mesh = CompiledMesh::default();
        triangulate(map, &mut |triangle: Triangle| {
            for (x, y) in triangle {
                let slot = &mut remap[mapper.index(x, y)];
                if *slot == u32::MAX {
                    *slot = mesh.vertices.len() as u32;
                    mesh.vertices.push(lattice_vertex(tile, x, y));
                }
                mesh.indices.push(*slot);
            }
        });
        mesh
    }
}

const GRASS: Vec4 = Vec4::new(0.32, 0.47, 0.22, 1.0);
const ROCK: Vec4 = Vec4::new(0.48, 0.45, 0.41, 1.0);

/// Vertex for one lattice point, tinted from grass to rock with slope
pub fn lattice_vertex(tile: &TileView<'_>, x: u32, y: u32) -> TerrainVertex {
    let normal = tile.normal(x, y);
    let steepness = ((1.0 - normal.dot(Vec3::Z)) * 3.0).clamp(0.0, 1.0);
    TerrainVertex::new(
        tile.world_position(x, y),
        normal,
        tile.uv(x, y),
        GRASS.lerp(ROCK, steepness),
    )
}

/// Every lattice vertex of the tile, row by row
pub fn lattice_vertices(tile: &TileView<'_>) -> Vec<TerrainVertex> {
    let size = tile.size();
    let mut vertices = Vec::with_capacity(((size + 1) * (size + 1)) as usize);
    for y in 0..=size {
        for x in 0..=size {
            vertices.push(lattice_vertex(tile, x, y));
        }
    }
    vertices
}
