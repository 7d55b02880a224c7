use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use glam::{Mat4, Vec3};
use tracing::{info, warn};

use slv_terrain::config::{detect_hardware, load_terrain_settings, recommend_profile, TerrainSettings};
use slv_terrain::rendering::{
    request_headless_device, GpuDevice, OffscreenTerrainRenderer, RecordingDevice, WgpuTerrainDevice,
};
use slv_terrain::utils::logging::{init_logging, log_system_info};
use slv_terrain::utils::math::Frustum;
use slv_terrain::world::terrain::{FrameStats, ProceduralSource, TerrainRenderManager};
use slv_terrain::RenderContextToken;

const FRAME_TIME: Duration = Duration::from_millis(16);
const FLY_SPEED: f32 = 40.0; // world units per second
const FLY_HEIGHT: f32 = 80.0;

struct DemoArgs {
    frames: u32,
    seed: u64,
    config: Option<PathBuf>,
    wgpu: bool,
}

fn parse_args() -> anyhow::Result<DemoArgs> {
    let mut args = DemoArgs {
        frames: 600,
        seed: 42,
        config: None,
        wgpu: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--frames" => args.frames = iter.next().context("--frames needs a value")?.parse()?,
            "--seed" => args.seed = iter.next().context("--seed needs a value")?.parse()?,
            "--config" => args.config = Some(iter.next().context("--config needs a path")?.into()),
            "--wgpu" => args.wgpu = true,
            other => anyhow::bail!("unknown argument '{}' (expected --frames N, --seed S, --config PATH, --wgpu)", other),
        }
    }
    Ok(args)
}

fn view_projection(eye: Vec3, heading: Vec3, far: f32) -> Mat4 {
    let target = eye + heading + Vec3::new(0.0, 0.0, -0.35);
    let view = Mat4::look_at_rh(eye, target, Vec3::Z);
    let proj = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, 0.5, far);
    proj * view
}

fn main() -> anyhow::Result<()> {
    init_logging(Some(std::path::Path::new("log.txt")));
    log_system_info();
    let args = parse_args()?;

    let settings = match load_terrain_settings(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            let profile = recommend_profile(&detect_hardware());
            warn!("Using {:?} defaults, settings could not be loaded: {}", profile, e);
            TerrainSettings::for_profile(profile)
        }
    };

    let source = Arc::new(ProceduralSource::with_params(
        args.seed,
        48.0,
        1.0 / 256.0,
        5,
        settings.grid.sample_spacing,
    ));

    let (device, offscreen): (Box<dyn GpuDevice>, Option<(WgpuTerrainDevice, OffscreenTerrainRenderer)>) =
        if args.wgpu {
            let (device, queue, capabilities) = pollster::block_on(request_headless_device())?;
            let terrain_device = WgpuTerrainDevice::new(Arc::clone(&device), Arc::clone(&queue), capabilities);
            let renderer = OffscreenTerrainRenderer::new(device, queue, 1280, 720);
            (Box::new(terrain_device.clone()), Some((terrain_device, renderer)))
        } else {
            (Box::new(RecordingDevice::default()), None)
        };

    let token = RenderContextToken::new();
    let far = settings.streaming.prefetch_radius * 1.5;
    let mut manager = TerrainRenderManager::new(settings, source, device)?;
    let heading = Vec3::new(1.0, 0.35, 0.0).normalize();

    info!("Flying over procedural terrain for {} frames", args.frames);
    let mut totals = FrameStats::default();
    let start = Instant::now();
    for frame in 0..args.frames {
        let frame_start = Instant::now();
        let t = frame as f32 * FRAME_TIME.as_secs_f32();
        let eye = heading * FLY_SPEED * t + Vec3::new(0.0, 0.0, FLY_HEIGHT);
        manager.set_viewer_position(eye);

        let streaming = manager.update(&token, frame_start);
        let view_proj = view_projection(eye, heading, far);
        let frustum = Frustum::from_view_projection(view_proj);
        let drawn = manager.render(&token, Some(&frustum));
        if let Some((terrain_device, renderer)) = &offscreen {
            renderer.render(terrain_device, view_proj);
        }

        totals.blocks_requested += streaming.blocks_requested;
        totals.blocks_evicted += streaming.blocks_evicted;
        totals.uploads_run += streaming.uploads_run;
        totals.zones_submitted += drawn.zones_submitted;

        if frame % 60 == 0 {
            let store = manager.store().stats();
            let background = manager.scheduler().background().stats();
            info!(
                "t={:.1}s viewer=({:.0}, {:.0}) blocks={} drawn={} zones={}/{} culled={} pending={} tris={} loads={}/{} tasks={}",
                t,
                eye.x,
                eye.y,
                drawn.blocks_resident,
                drawn.blocks_drawn,
                drawn.zones_drawn,
                drawn.zones_drawn + drawn.zones_culled + drawn.zones_pending,
                drawn.zones_culled,
                drawn.zones_pending,
                drawn.triangles,
                store.loads_completed,
                store.loads_started,
                background.executed,
            );
        }

        if let Some(rest) = FRAME_TIME.checked_sub(frame_start.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    manager.done(&token);
    info!(
        "Finished in {:.1}s: {} blocks requested, {} evicted, {} zone prepares, {} uploads",
        start.elapsed().as_secs_f32(),
        totals.blocks_requested,
        totals.blocks_evicted,
        totals.zones_submitted,
        totals.uploads_run
    );
    Ok(())
}
