//! Memory and CPU guards for the ingestion loop.
//!
//! Limits are phrased as "operational memory over baseline": the baseline
//! RSS is measured once at startup, after the embedding provider has
//! loaded, so a 180 MB model footprint can never eat a 500 MB operational
//! allowance and halt all work.
//!
//! CPU throttling respects container quotas. Inside a cgroup, a host-wide
//! reading like 1437% may actually be 90% of the allotted quota; the
//! effective core count is taken from the cgroup's cpu limit when one is
//! set, not from the host.

use std::collections::VecDeque;

use sysinfo::{Pid, System};
use tracing::{debug, info};

/// Sliding-window length for the CPU average.
const CPU_WINDOW: usize = 10;

pub struct ResourceGuard {
    sys: System,
    pid: Pid,
    baseline_rss: u64,
    cpu_samples: VecDeque<f32>,
    effective_cpus: f32,
}

impl ResourceGuard {
    pub fn new() -> Self {
        let mut sys = System::new();
        let pid = sysinfo::get_current_pid().unwrap_or_else(|_| Pid::from_u32(0));
        sys.refresh_process(pid);
        let effective_cpus = effective_cpu_count(&mut sys);
        info!(effective_cpus, "resource guard initialized");
        Self {
            sys,
            pid,
            baseline_rss: 0,
            cpu_samples: VecDeque::with_capacity(CPU_WINDOW),
            effective_cpus,
        }
    }

    /// Record the post-initialization RSS as the baseline.
    pub fn set_baseline(&mut self) {
        self.sys.refresh_process(self.pid);
        self.baseline_rss = self.current_rss();
        info!(
            baseline_mb = self.baseline_rss / (1024 * 1024),
            "memory baseline recorded"
        );
    }

    fn current_rss(&self) -> u64 {
        self.sys
            .process(self.pid)
            .map(|p| p.memory())
            .unwrap_or(0)
    }

    /// RSS growth over the baseline, in MB.
    pub fn memory_over_baseline_mb(&mut self) -> u64 {
        self.sys.refresh_process(self.pid);
        let rss = self.current_rss();
        rss.saturating_sub(self.baseline_rss) / (1024 * 1024)
    }

    /// Current total RSS in MB, for `status()`.
    pub fn memory_mb(&mut self) -> u64 {
        self.sys.refresh_process(self.pid);
        self.current_rss() / (1024 * 1024)
    }

    pub fn memory_exceeded(&mut self, limit_mb: u64) -> bool {
        self.memory_over_baseline_mb() > limit_mb
    }

    /// Refresh the process CPU reading and fold it into the sliding
    /// window. Returns the windowed average (percent of one core).
    pub fn sample_cpu(&mut self) -> f32 {
        self.sys.refresh_process(self.pid);
        let usage = self
            .sys
            .process(self.pid)
            .map(|p| p.cpu_usage())
            .unwrap_or(0.0);
        if self.cpu_samples.len() >= CPU_WINDOW {
            self.cpu_samples.pop_front();
        }
        self.cpu_samples.push_back(usage);
        self.cpu_average()
    }

    pub fn cpu_average(&self) -> f32 {
        if self.cpu_samples.is_empty() {
            return 0.0;
        }
        self.cpu_samples.iter().sum::<f32>() / self.cpu_samples.len() as f32
    }

    /// Whether the sliding average exceeds the per-core ceiling scaled by
    /// the effective core count.
    pub fn cpu_exceeded(&self, max_percent_per_core: f32) -> bool {
        self.cpu_average() > max_percent_per_core * self.effective_cpus
    }

    /// Return freed heap pages to the OS. After each processed file the
    /// allocator may hold large arenas from parsing and chunk buffers.
    pub fn release_memory(&self) {
        #[cfg(target_os = "linux")]
        // SAFETY: malloc_trim only releases free arena pages; it does not
        // touch live allocations.
        unsafe {
            libc::malloc_trim(0);
        }
        debug!("heap trim requested");
    }
}

impl Default for ResourceGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Host core count, capped by the cgroup cpu quota when one applies.
fn effective_cpu_count(sys: &mut System) -> f32 {
    sys.refresh_cpu();
    let host = sys.cpus().len().max(1) as f32;
    match cgroup_cpu_quota() {
        Some(quota) if quota > 0.0 => host.min(quota),
        _ => host,
    }
}

/// Parse the cgroup cpu quota (v2 `cpu.max`, then v1 cfs files).
fn cgroup_cpu_quota() -> Option<f32> {
    // cgroup v2: "<quota|max> <period>"
    if let Ok(content) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let mut parts = content.split_whitespace();
        let quota = parts.next()?;
        let period: f32 = parts.next()?.parse().ok()?;
        if quota != "max" && period > 0.0 {
            let quota: f32 = quota.parse().ok()?;
            return Some(quota / period);
        }
        return None;
    }
    // cgroup v1
    let quota: f32 = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let period: f32 = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if quota > 0.0 && period > 0.0 {
        Some(quota / period)
    } else {
        None
    }
}
