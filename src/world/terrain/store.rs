//! Data block store
//!
//! Owns every loaded [`HeightfieldBlock`]. Loads run on the background
//! worker; the in-flight map doubles as the "is this block already being
//! fetched" flag, so a block is never requested from the source twice at once.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use glam::Vec2;
use tracing::{debug, info, warn};

use super::{BlockKey, HeightfieldBlock, HeightfieldSource, TerrainError};
use crate::tasks::BackgroundQueue;
use crate::utils::math::square_intersects_circle;

pub type LoadCallback = Box<dyn FnOnce(Arc<HeightfieldBlock>) + Send + 'static>;

/// Radius, in blocks, of the streaming window around the viewer block
const WINDOW_RADIUS: i32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub resident: usize,
    pub loading: usize,
    pub loads_started: u64,
    pub loads_completed: u64,
    pub loads_failed: u64,
    pub evicted: u64,
}

#[derive(Default)]
struct StoreState {
    blocks: HashMap<BlockKey, Arc<HeightfieldBlock>>,
    loading: HashMap<BlockKey, Vec<LoadCallback>>,
}

#[derive(Default)]
struct StoreCounters {
    loads_started: AtomicU64,
    loads_completed: AtomicU64,
    loads_failed: AtomicU64,
    evicted: AtomicU64,
}

pub struct BlockStore {
    source: Arc<dyn HeightfieldSource>,
    queue: BackgroundQueue,
    block_size: u32,
    sample_spacing: f32,
    state: Mutex<StoreState>,
    placeholder: Arc<HeightfieldBlock>,
    counters: StoreCounters,
}

impl BlockStore {
    pub fn new(source: Arc<dyn HeightfieldSource>, queue: BackgroundQueue, block_size: u32, sample_spacing: f32) -> Self {
        Self {
            source,
            queue,
            block_size,
            sample_spacing,
            state: Mutex::new(StoreState::default()),
            placeholder: Arc::new(HeightfieldBlock::empty()),
            counters: StoreCounters::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// World-space side length of one block
    pub fn block_extent(&self) -> f32 {
        self.block_size as f32 * self.sample_spacing
    }

    pub fn key_for_position(&self, position: Vec2) -> BlockKey {
        BlockKey::from_world(position, self.block_extent())
    }

    pub fn is_loaded(&self, key: BlockKey) -> bool {
        self.lock().blocks.contains_key(&key)
    }

    /// Whether a load for `key` is in flight
    pub fn is_loading(&self, key: BlockKey) -> bool {
        self.lock().loading.contains_key(&key)
    }

    /// The loaded block, or the shared empty placeholder. Never blocks on a load.
    pub fn get_block(&self, key: BlockKey) -> Arc<HeightfieldBlock> {
        self.lock()
            .blocks
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.placeholder))
    }

    pub fn loaded_keys(&self) -> Vec<BlockKey> {
        let mut keys: Vec<_> = self.lock().blocks.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Load `key` on the background worker and hand the block to `callback`
    ///
    /// An already loaded block is passed to `callback` right away on the
    /// calling thread. If a load is already in flight the callback joins it,
    /// so the source is asked for each block at most once at a time.
    pub fn async_load_block<F>(self: &Arc<Self>, key: BlockKey, callback: F)
    where
        F: FnOnce(Arc<HeightfieldBlock>) + Send + 'static,
    {
        let mut state = self.lock();
        if let Some(block) = state.blocks.get(&key).cloned() {
            drop(state);
            callback(block);
            return;
        }
        if let Some(waiting) = state.loading.get_mut(&key) {
            waiting.push(Box::new(callback));
            return;
        }
        state.loading.insert(key, vec![Box::new(callback)]);
        drop(state);

        let store = Arc::clone(self);
        if self.queue.add(move || {
            store.load_now(key);
            Ok(())
        }) {
            self.counters.loads_started.fetch_add(1, Ordering::Relaxed);
            debug!("Queued load of block {}", key);
        } else {
            self.lock().loading.remove(&key);
            debug!("Load of block {} not queued, worker is cancelled", key);
        }
    }

    fn load_now(&self, key: BlockKey) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.source.load_block(key, self.block_size)))
            .unwrap_or_else(|_| {
                Err(TerrainError::SourceFormat {
                    key,
                    reason: format!("{} source panicked", self.source.name()),
                })
            });

        match result {
            Ok(block) => {
                let block = Arc::new(block);
                let callbacks = {
                    let mut state = self.lock();
                    state.blocks.insert(key, Arc::clone(&block));
                    state.loading.remove(&key).unwrap_or_default()
                };
                self.counters.loads_completed.fetch_add(1, Ordering::Relaxed);
                info!("Loaded block {} from {} source", key, self.source.name());
                for callback in callbacks {
                    callback(Arc::clone(&block));
                }
            }
            Err(e) => {
                // Clearing the flag lets the next prefetch scan retry
                self.lock().loading.remove(&key);
                self.counters.loads_failed.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to load block {}: {}", key, e);
            }
        }
    }

    /// Blocks of the 3x3 window around the viewer whose square touches the prefetch circle
    pub fn prefetch_window(&self, viewer: Vec2, radius: f32) -> Vec<BlockKey> {
        let center = self.key_for_position(viewer);
        center
            .neighborhood(WINDOW_RADIUS)
            .filter(|&key| self.in_prefetch_window(key, viewer, radius))
            .collect()
    }

    pub fn in_prefetch_window(&self, key: BlockKey, viewer: Vec2, radius: f32) -> bool {
        let center = self.key_for_position(viewer);
        if (key.x - center.x).abs() > WINDOW_RADIUS || (key.y - center.y).abs() > WINDOW_RADIUS {
            return false;
        }
        let extent = self.block_extent();
        let min = key.origin(extent);
        square_intersects_circle(min, min + Vec2::splat(extent), viewer, radius)
    }

    /// Drop every resident block outside the prefetch window, returning their keys
    pub fn cleanup(&self, viewer: Vec2, radius: f32) -> Vec<BlockKey> {
        let mut state = self.lock();
        let mut evicted: Vec<_> = state
            .blocks
            .keys()
            .copied()
            .filter(|&key| !self.in_prefetch_window(key, viewer, radius))
            .collect();
        for key in &evicted {
            state.blocks.remove(key);
        }
        drop(state);

        evicted.sort();
        if !evicted.is_empty() {
            self.counters.evicted.fetch_add(evicted.len() as u64, Ordering::Relaxed);
            info!("Evicted {} blocks: {:?}", evicted.len(), evicted);
        }
        evicted
    }

    /// Drop every resident block and forget pending callbacks
    pub fn clear(&self) -> Vec<BlockKey> {
        let mut state = self.lock();
        state.loading.clear();
        let mut keys: Vec<_> = state.blocks.drain().map(|(key, _)| key).collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.lock();
        StoreStats {
            resident: state.blocks.len(),
            loading: state.loading.len(),
            loads_started: self.counters.loads_started.load(Ordering::Relaxed),
            loads_completed: self.counters.loads_completed.load(Ordering::Relaxed),
            loads_failed: self.counters.loads_failed.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}
