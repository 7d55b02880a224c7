use sysinfo::System;

use crate::config::settings::PerformanceProfile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareInfo {
    pub total_memory_gb: u32,
    pub cpu_cores: u32,
}

/// Query memory and CPU counts from the operating system
pub fn detect_hardware() -> HardwareInfo {
    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_all();

    HardwareInfo {
        total_memory_gb: (system.total_memory() / (1024 * 1024 * 1024)) as u32,
        cpu_cores: system.cpus().len() as u32,
    }
}

/// Recommend performance profile based on hardware capabilities
pub fn recommend_profile(hardware: &HardwareInfo) -> PerformanceProfile {
    // Low-end hardware detection
    if hardware.total_memory_gb < 4 || hardware.cpu_cores < 4 {
        return PerformanceProfile::Low;
    }

    // High-end hardware detection
    if hardware.total_memory_gb >= 16 && hardware.cpu_cores >= 8 {
        return PerformanceProfile::High;
    }

    PerformanceProfile::Balanced
}
