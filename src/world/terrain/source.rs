//! Heightfield data sources
//!
//! A source is called synchronously from inside a background task, so a slow
//! source only delays the worker thread, never the render thread.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use tracing::debug;

use super::{BlockKey, HeightfieldBlock, TerrainError, TerrainResult};

pub trait HeightfieldSource: Send + Sync {
    /// Produce the `(size + 1)^2` samples of block `key`
    fn load_block(&self, key: BlockKey, size: u32) -> TerrainResult<HeightfieldBlock>;

    fn name(&self) -> &str {
        "heightfield"
    }
}

/// Fractal Perlin terrain, deterministic for a given seed
#[derive(Debug, Clone)]
pub struct ProceduralSource {
    height: Fbm<Perlin>,
    amplitude: f32,
    sample_spacing: f32,
}

impl ProceduralSource {
    pub fn new(seed: u64) -> Self {
        Self::with_params(seed, 48.0, 1.0 / 256.0, 5, 1.0)
    }

    pub fn with_params(seed: u64, amplitude: f32, base_frequency: f32, octaves: u32, sample_spacing: f32) -> Self {
        // Fold the high half in so seeds differing only above bit 32 still differ
        let seed = (seed ^ (seed >> 32)) as u32;
        let height = Fbm::<Perlin>::new(seed)
            .set_octaves(octaves.max(1) as usize)
            .set_frequency(base_frequency as f64);
        Self {
            height,
            amplitude,
            sample_spacing,
        }
    }

    /// Terrain height at a world-space position
    pub fn height_at(&self, x: f32, y: f32) -> f32 {
        self.height.get([x as f64, y as f64]) as f32 * self.amplitude
    }
}

impl HeightfieldSource for ProceduralSource {
    fn load_block(&self, key: BlockKey, size: u32) -> TerrainResult<HeightfieldBlock> {
        if size == 0 || !size.is_power_of_two() {
            return Err(TerrainError::InvalidBlockSize(size));
        }
        let origin_x = key.x as i64 * size as i64;
        let origin_y = key.y as i64 * size as i64;
        let mut heights = Vec::with_capacity(((size + 1) * (size + 1)) as usize);
        for y in 0..=size as i64 {
            for x in 0..=size as i64 {
                let wx = (origin_x + x) as f32 * self.sample_spacing;
                let wy = (origin_y + y) as f32 * self.sample_spacing;
                heights.push(self.height_at(wx, wy));
            }
        }
        HeightfieldBlock::new(key, size, heights)
    }

    fn name(&self) -> &str {
        "procedural"
    }
}

/// One file per block in a directory: `block_<x>_<y>.r32` holding
/// little-endian `f32` samples, optionally gzip-compressed as `.r32.gz`
#[derive(Debug, Clone)]
pub struct FlatFileSource {
    dir: PathBuf,
}

impl FlatFileSource {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn block_path(&self, key: BlockKey) -> PathBuf {
        self.dir.join(format!("block_{}_{}.r32", key.x, key.y))
    }

    pub fn compressed_block_path(&self, key: BlockKey) -> PathBuf {
        self.dir.join(format!("block_{}_{}.r32.gz", key.x, key.y))
    }

    fn read_bytes(&self, key: BlockKey) -> io::Result<Vec<u8>> {
        let compressed = self.compressed_block_path(key);
        if compressed.exists() {
            let mut bytes = Vec::new();
            GzDecoder::new(File::open(&compressed)?).read_to_end(&mut bytes)?;
            return Ok(bytes);
        }
        fs::read(self.block_path(key))
    }
}

impl HeightfieldSource for FlatFileSource {
    fn load_block(&self, key: BlockKey, size: u32) -> TerrainResult<HeightfieldBlock> {
        let bytes = self
            .read_bytes(key)
            .map_err(|source| TerrainError::SourceIo { key, source })?;
        let expected = ((size as usize) + 1) * ((size as usize) + 1);
        if bytes.len() != expected * 4 {
            return Err(TerrainError::SourceFormat {
                key,
                reason: format!("expected {} bytes, file has {}", expected * 4, bytes.len()),
            });
        }
        let mut heights = vec![0.0f32; expected];
        LittleEndian::read_f32_into(&bytes, &mut heights);
        debug!("Read block {} from {}", key, self.dir.display());
        HeightfieldBlock::new(key, size, heights)
    }

    fn name(&self) -> &str {
        "flat-file"
    }
}

/// Write a block in the layout [`FlatFileSource`] reads
pub fn write_block_file(path: &Path, block: &HeightfieldBlock, compress: bool) -> io::Result<()> {
    let file = BufWriter::new(File::create(path)?);
    if compress {
        let mut encoder = GzEncoder::new(file, Compression::default());
        write_samples(&mut encoder, block.heights())?;
        encoder.finish()?.flush()
    } else {
        let mut file = file;
        write_samples(&mut file, block.heights())?;
        file.flush()
    }
}

fn write_samples<W: Write>(writer: &mut W, heights: &[f32]) -> io::Result<()> {
    for &h in heights {
        writer.write_f32::<LittleEndian>(h)?;
    }
    Ok(())
}

/// Slices blocks out of a larger parent block served by another source
///
/// The most recently used parent is kept, so walking the sub-blocks of one
/// parent only loads it once.
pub struct SubBlockSource {
    inner: Arc<dyn HeightfieldSource>,
    parent_size: u32,
    cache: Mutex<Option<Arc<HeightfieldBlock>>>,
}

impl SubBlockSource {
    pub fn new(inner: Arc<dyn HeightfieldSource>, parent_size: u32) -> Self {
        Self {
            inner,
            parent_size,
            cache: Mutex::new(None),
        }
    }

    fn parent(&self, key: BlockKey) -> TerrainResult<Arc<HeightfieldBlock>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = cache.as_ref().filter(|p| p.key() == key) {
            return Ok(Arc::clone(parent));
        }
        let parent = Arc::new(self.inner.load_block(key, self.parent_size)?);
        *cache = Some(Arc::clone(&parent));
        Ok(parent)
    }
}

impl HeightfieldSource for SubBlockSource {
    fn load_block(&self, key: BlockKey, size: u32) -> TerrainResult<HeightfieldBlock> {
        if size == 0 || !size.is_power_of_two() || size > self.parent_size {
            return Err(TerrainError::InvalidBlockSize(size));
        }
        let ratio = (self.parent_size / size) as i32;
        let parent_key = BlockKey::new(key.x.div_euclid(ratio), key.y.div_euclid(ratio));
        let x0 = key.x.rem_euclid(ratio) as u32 * size;
        let y0 = key.y.rem_euclid(ratio) as u32 * size;
        let parent = self.parent(parent_key)?;
        HeightfieldBlock::new(key, size, parent.extract(x0, y0, size))
    }

    fn name(&self) -> &str {
        "sub-block"
    }
}
