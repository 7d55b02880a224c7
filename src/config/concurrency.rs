use crate::config::settings::PerformanceProfile;

/// Configuration of the terrain background worker thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub thread_name: String,
    pub stack_size: Option<usize>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: "slv-terrain-worker".to_string(),
            stack_size: Some(2 * 1024 * 1024), // 2MB stack size
        }
    }
}

impl WorkerConfig {
    /// Reductions recurse once per quadtree level, so the stack only needs
    /// to grow with the largest blocks the profile streams
    pub fn for_profile(profile: PerformanceProfile) -> Self {
        let stack_size = match profile {
            PerformanceProfile::Low => 1024 * 1024,          // 1MB stack
            PerformanceProfile::Balanced => 2 * 1024 * 1024, // 2MB stack
            PerformanceProfile::High => 4 * 1024 * 1024,     // 4MB stack for large blocks
        };
        Self {
            stack_size: Some(stack_size),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_for_profile() {
        let low = WorkerConfig::for_profile(PerformanceProfile::Low);
        let high = WorkerConfig::for_profile(PerformanceProfile::High);
        assert_eq!(low.thread_name, "slv-terrain-worker");
        assert!(low.stack_size < high.stack_size);
        assert_eq!(WorkerConfig::for_profile(PerformanceProfile::Balanced), WorkerConfig::default());
    }
}
