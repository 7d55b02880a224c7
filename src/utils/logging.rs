use std::env;
use std::fs;
use std::io;
use std::path::Path;

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const DEFAULT_FILTER: &str = "info,slv_terrain=debug,wgpu=warn,wgpu_core=warn,wgpu_hal=warn,naga=warn";

/// Initialize logging: console output plus `log_file`, recreated for every session
///
/// `RUST_LOG` overrides the default filter. Returns false if a global
/// subscriber was already installed (tests, or a host application).
pub fn init_logging(log_file: Option<&Path>) -> bool {
    let enable_backtrace = env::var("RUST_BACKTRACE").map_or(false, |v| v == "1");

    let file = log_file.and_then(|path| {
        // Remove the previous session's log
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != io::ErrorKind::NotFound {
                eprintln!("Warning: Failed to remove existing {}: {}", path.display(), e);
            }
        }
        match fs::File::create(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Warning: Failed to create {}: {}", path.display(), e);
                None
            }
        }
    });
    let file_enabled = file.is_some();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let initialized = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_ansi(true),
        )
        .with(file.map(|file| {
            fmt::layer()
                .with_writer(file)
                .with_span_events(FmtSpan::CLOSE)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false) // No ANSI codes in file
        }))
        .try_init()
        .is_ok();
    if !initialized {
        return false;
    }

    // Route panics, including ones on the worker thread, through tracing
    std::panic::set_hook(Box::new(move |panic_info| {
        let thread = std::thread::current();
        tracing::error!("Panic on thread '{}': {}", thread.name().unwrap_or("<unnamed>"), panic_info);

        if enable_backtrace {
            tracing::error!("Backtrace:\n{}", std::backtrace::Backtrace::capture());
        }
    }));

    tracing::info!("Logging initialized (file logging: {})", file_enabled);
    tracing::info!("Backtrace enabled: {}", enable_backtrace);
    true
}

/// Log system information for debugging
pub fn log_system_info() {
    let hardware = crate::config::detect_hardware();
    tracing::info!("=== System Information ===");
    tracing::info!("OS: {}", env::consts::OS);
    tracing::info!("Architecture: {}", env::consts::ARCH);
    tracing::info!("{} version: {}", crate::APP_NAME, crate::VERSION);
    tracing::info!("CPU cores: {}", hardware.cpu_cores);
    tracing::info!("Memory: {} GB", hardware.total_memory_gb);
    tracing::info!("Recommended profile: {:?}", crate::config::recommend_profile(&hardware));

    if let Ok(backend) = env::var("WGPU_BACKEND") {
        tracing::info!("WGPU Backend: {}", backend);
    }
    tracing::info!("========================");
}

/// Log wgpu adapter information
pub fn log_adapter_info(adapter: &wgpu::Adapter) {
    let info = adapter.get_info();
    tracing::info!("=== WGPU Adapter Information ===");
    tracing::info!("Name: {}", info.name);
    tracing::info!("Backend: {:?}", info.backend);
    tracing::info!("Device Type: {:?}", info.device_type);
    tracing::info!("Driver: {}", info.driver);
    tracing::info!("=================================");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let first = init_logging(Some(&path));
        assert!(!init_logging(None));
        if first {
            assert!(path.exists());
        }
    }
}
