//! Orchestrator-side RSS sampling.
//!
//! The engine samples its own resident set size around each chunk transform.
//! This is a diagnostic signal only; `memory_limit_mb` is never enforced.

use std::sync::Mutex;
use sysinfo::{Pid, System};

/// Samples the resident set size of the current process.
pub struct MemorySampler {
    system: System,
    pid: Pid,
}

impl MemorySampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Current RSS in MB, or 0.0 if the process cannot be sampled.
    pub fn rss_mb(&mut self) -> f64 {
        self.system.refresh_process(self.pid);
        self.system
            .process(self.pid)
            .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0)
    }
}

impl Default for MemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Sample through a shared sampler; a poisoned lock degrades to 0.0 rather
/// than failing the chunk.
pub fn sample_rss_mb(sampler: &Mutex<MemorySampler>) -> f64 {
    sampler
        .lock()
        .map(|mut guard| guard.rss_mb())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rss_is_sampled_for_current_process() {
        let mut sampler = MemorySampler::new();
        // A running test process always has a nonzero resident set.
        assert!(sampler.rss_mb() > 0.0);
    }
}
