use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use glam::{Mat4, Vec3};
use slv_terrain::rendering::{RecordedDraw, RecordingDevice};
use slv_terrain::utils::math::Frustum;
use slv_terrain::world::terrain::{
    BlockKey, FrameStats, HeightfieldBlock, HeightfieldSource, LevelKey, ProceduralSource, TerrainError,
    TerrainRenderManager, TerrainResult,
};
use slv_terrain::{RenderContextToken, TerrainSettings};

const TIMEOUT: Duration = Duration::from_secs(20);

fn small_settings() -> TerrainSettings {
    let mut settings = TerrainSettings::default();
    settings.grid.block_size = 32;
    settings.grid.zone_grid = 4;
    settings.lod.levels = 3;
    settings.lod.thresholds = vec![16.0, 48.0];
    settings.streaming.prefetch_radius = 40.0;
    settings.streaming.rescan_interval_secs = 0.0;
    settings.streaming.uploads_per_frame = 64;
    settings
}

fn manager_with(source: Arc<dyn HeightfieldSource>) -> (TerrainRenderManager, RecordingDevice) {
    let device = RecordingDevice::default();
    let manager = TerrainRenderManager::new(small_settings(), source, Box::new(device.clone())).unwrap();
    (manager, device)
}

fn settled(manager: &TerrainRenderManager, stats: &FrameStats, blocks: usize) -> bool {
    stats.blocks_resident == blocks
        && stats.blocks_drawn == blocks
        && stats.zones_pending == 0
        && stats.zones_submitted == 0
        && manager.scheduler().upload().is_empty()
        && manager.scheduler().background().is_idle()
}

/// Run frames until every block in the window is drawn at its wanted levels
fn pump_until_settled(manager: &mut TerrainRenderManager, token: &RenderContextToken, blocks: usize) -> FrameStats {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        manager.update(token, Instant::now());
        let stats = manager.render(token, None);
        if settled(manager, &stats, blocks) {
            return stats;
        }
        assert!(Instant::now() < deadline, "terrain never settled: {:?}", stats);
        thread::sleep(Duration::from_millis(2));
    }
}

/// Lattice positions referenced by one draw, as integer world coordinates
fn drawn_points(device: &RecordingDevice, draw: &RecordedDraw) -> HashSet<(i32, i32)> {
    let vertices = device.vertices(draw.vertex_buffer).unwrap();
    let indices = device.indices(draw.index_buffer).unwrap();
    indices[draw.range.start as usize..draw.range.end() as usize]
        .iter()
        .map(|&i| {
            let p = vertices[i as usize].position;
            (p[0].round() as i32, p[1].round() as i32)
        })
        .collect()
}

#[test]
fn test_streaming_window_renders_without_cracks() {
    let token = RenderContextToken::new();
    let (mut manager, device) = manager_with(Arc::new(ProceduralSource::new(9)));
    manager.set_viewer_position(Vec3::new(12.0, 12.0, 4.0));

    pump_until_settled(&mut manager, &token, 9);
    device.take_draws();
    let stats = manager.render(&token, None);
    let draws = device.take_draws();
    assert_eq!(draws.len(), 9 * 16);
    assert_eq!(stats.zones_drawn, 9 * 16);
    assert!(stats.triangles > 0);

    // Zones keyed by their world-space square
    let mut zones: HashMap<(i32, i32, i32, i32), HashSet<(i32, i32)>> = HashMap::new();
    for draw in &draws {
        let points = drawn_points(&device, draw);
        let min_x = points.iter().map(|p| p.0).min().unwrap();
        let min_y = points.iter().map(|p| p.1).min().unwrap();
        let max_x = points.iter().map(|p| p.0).max().unwrap();
        let max_y = points.iter().map(|p| p.1).max().unwrap();
        assert_eq!((max_x - min_x, max_y - min_y), (8, 8));
        zones.insert((min_x, min_y, max_x, max_y), points);
    }

    let mut shared_borders = 0;
    let mut detail_counts = HashSet::new();
    for (&(x0, y0, x1, y1), points) in &zones {
        detail_counts.insert(points.len());
        if let Some(east) = zones.get(&(x1, y0, x1 + 8, y1)) {
            let ours: HashSet<_> = points.iter().filter(|p| p.0 == x1).collect();
            let theirs: HashSet<_> = east.iter().filter(|p| p.0 == x1).collect();
            assert_eq!(ours, theirs, "crack between zone at ({}, {}) and its east neighbour", x0, y0);
            shared_borders += 1;
        }
        if let Some(north) = zones.get(&(x0, y1, x1, y1 + 8)) {
            let ours: HashSet<_> = points.iter().filter(|p| p.1 == y1).collect();
            let theirs: HashSet<_> = north.iter().filter(|p| p.1 == y1).collect();
            assert_eq!(ours, theirs, "crack between zone at ({}, {}) and its north neighbour", x0, y0);
            shared_borders += 1;
        }
    }
    // 12 x 12 zones: 11 * 12 borders in each direction
    assert_eq!(shared_borders, 2 * 11 * 12);
    assert!(detail_counts.len() > 1, "expected zones at several levels");
}

#[test]
fn test_camera_height_selects_coarser_levels() {
    let token = RenderContextToken::new();
    let (mut manager, _device) = manager_with(Arc::new(ProceduralSource::new(12)));
    let origin = BlockKey::new(0, 0);

    manager.set_viewer_position(Vec3::new(4.0, 4.0, 1000.0));
    pump_until_settled(&mut manager, &token, 9);
    let zones = manager.scene().block(origin).unwrap().zones();
    assert_eq!(zones.current_level(0), Some(LevelKey::uniform(2)));

    // Same ground position, camera brought down to the surface
    manager.set_viewer_position(Vec3::new(4.0, 4.0, 2.0));
    pump_until_settled(&mut manager, &token, 9);
    let zones = manager.scene().block(origin).unwrap().zones();
    assert_eq!(zones.current_level(0), Some(LevelKey::uniform(0)));
}

#[test]
fn test_prepared_levels_are_reused() {
    let token = RenderContextToken::new();
    let (mut manager, _device) = manager_with(Arc::new(ProceduralSource::new(2)));
    manager.set_viewer_position(Vec3::new(16.0, 16.0, 30.0));
    pump_until_settled(&mut manager, &token, 9);
    let submitted = manager.scheduler().background().stats().submitted;

    // Rendering the same view again prepares nothing new
    for _ in 0..5 {
        let stats = manager.render(&token, None);
        assert_eq!(stats.zones_submitted, 0);
    }
    assert_eq!(manager.scheduler().background().stats().submitted, submitted);
}

#[test]
fn test_frustum_culls_blocks_behind_viewer() {
    let token = RenderContextToken::new();
    let (mut manager, _device) = manager_with(Arc::new(ProceduralSource::new(4)));
    let eye = Vec3::new(16.0, 16.0, 60.0);
    manager.set_viewer_position(eye);
    pump_until_settled(&mut manager, &token, 9);

    let view = Mat4::look_at_rh(eye, eye + Vec3::new(1.0, 0.0, -0.2), Vec3::Z);
    let proj = Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.5, 400.0);
    let frustum = Frustum::from_view_projection(proj * view);

    let culled = manager.render(&token, Some(&frustum));
    assert!(culled.blocks_culled >= 3, "{:?}", culled);
    assert!(culled.zones_drawn < 9 * 16);

    manager.set_frustum_culling(false);
    let unculled = manager.render(&token, Some(&frustum));
    assert_eq!(unculled.blocks_culled, 0);
    assert_eq!(unculled.zones_drawn, 9 * 16);
}

#[test]
fn test_moving_away_evicts_every_trace_of_old_blocks() {
    let token = RenderContextToken::new();
    let (mut manager, device) = manager_with(Arc::new(ProceduralSource::new(6)));
    manager.set_viewer_position(Vec3::new(16.0, 16.0, 40.0));
    pump_until_settled(&mut manager, &token, 9);

    let old_keys = manager.scene().block_keys();
    let old_buffers: Vec<_> = old_keys
        .iter()
        .map(|&key| manager.scene().block(key).unwrap().zones().buffers())
        .collect();

    manager.set_viewer_position(Vec3::new(1000.0, 1000.0, 40.0));
    let stats = manager.update(&token, Instant::now());
    assert_eq!(stats.blocks_evicted, 9);

    for (key, (vertices, indices)) in old_keys.iter().zip(old_buffers) {
        assert!(!manager.scene().is_renderable(*key));
        assert!(!manager.store().is_loaded(*key));
        assert!(device.vertex_count(vertices).is_none());
        assert!(device.indices(indices).is_none());
    }
    assert_eq!(manager.store().stats().evicted, 9);

    pump_until_settled(&mut manager, &token, 9);
    assert!(manager
        .scene()
        .block_keys()
        .iter()
        .all(|key| (30..=32).contains(&key.x) && (30..=32).contains(&key.y)));
    assert_eq!(device.live_vertex_buffers(), 9);
}

#[test]
fn test_done_with_work_in_flight_then_restart() {
    let token = RenderContextToken::new();
    let (mut manager, device) = manager_with(Arc::new(ProceduralSource::new(8)));
    manager.set_viewer_position(Vec3::new(16.0, 16.0, 40.0));

    manager.update(&token, Instant::now());
    manager.render(&token, None);
    manager.done(&token);

    assert!(!manager.is_running());
    assert!(manager.scene().block_keys().is_empty());
    assert_eq!(manager.store().stats().resident, 0);
    assert!(manager.scheduler().upload().is_empty());
    assert!(manager.scheduler().background().is_empty());
    assert_eq!((device.live_vertex_buffers(), device.live_index_buffers()), (0, 0));

    // Stopped managers do not stream
    let stats = manager.update(&token, Instant::now());
    assert_eq!(stats.blocks_requested, 0);

    manager.start();
    pump_until_settled(&mut manager, &token, 9);
    manager.done(&token);
    manager.done(&token);
    assert_eq!(device.live_vertex_buffers(), 0);
}

struct FlakySource {
    inner: ProceduralSource,
    failures_left: AtomicUsize,
}

impl HeightfieldSource for FlakySource {
    fn load_block(&self, key: BlockKey, size: u32) -> TerrainResult<HeightfieldBlock> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TerrainError::SourceIo {
                key,
                source: io::Error::new(io::ErrorKind::TimedOut, "simulated outage"),
            });
        }
        self.inner.load_block(key, size)
    }
}

#[test]
fn test_failed_loads_are_retried_on_next_scan() {
    let token = RenderContextToken::new();
    let source = Arc::new(FlakySource {
        inner: ProceduralSource::new(3),
        failures_left: AtomicUsize::new(4),
    });
    let (mut manager, _device) = manager_with(source);
    manager.set_viewer_position(Vec3::new(16.0, 16.0, 40.0));

    pump_until_settled(&mut manager, &token, 9);
    let stats = manager.store().stats();
    assert_eq!(stats.loads_failed, 4);
    assert_eq!(stats.loads_completed, 9);
}

#[test]
fn test_preview_mesh_needs_a_resident_block() {
    let token = RenderContextToken::new();
    let (mut manager, _device) = manager_with(Arc::new(ProceduralSource::new(5)));
    manager.set_viewer_position(Vec3::new(16.0, 16.0, 40.0));
    pump_until_settled(&mut manager, &token, 9);

    let mesh = manager.build_preview_mesh(BlockKey::new(0, 0)).unwrap();
    assert!(mesh.triangle_count() >= 4);
    assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));

    assert!(matches!(
        manager.build_preview_mesh(BlockKey::new(50, 50)),
        Err(TerrainError::BlockNotLoaded(_))
    ));
}

#[test]
fn test_streaming_idle_handler_fires() {
    let token = RenderContextToken::new();
    let (mut manager, _device) = manager_with(Arc::new(ProceduralSource::new(1)));
    manager.set_viewer_position(Vec3::new(16.0, 16.0, 40.0));
    let (tx, rx) = crossbeam_channel::bounded(1);
    assert!(manager.on_streaming_idle(move || {
        let _ = tx.send(());
    }));

    pump_until_settled(&mut manager, &token, 9);
    rx.recv_timeout(TIMEOUT).unwrap();
}

#[test]
fn test_manager_refuses_unbounded_rescan_interval() {
    let mut settings = small_settings();
    settings.streaming.rescan_interval_secs = f32::INFINITY;
    let result = TerrainRenderManager::new(
        settings,
        Arc::new(ProceduralSource::new(1)),
        Box::new(RecordingDevice::default()),
    );
    assert!(matches!(result, Err(TerrainError::Config { .. })));
}
