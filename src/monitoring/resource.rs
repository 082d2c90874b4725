//! Resource Usage Monitoring
//!
//! Samples the engine process's CPU and memory on a background thread
//! while a run is in flight. Purely observational; a run never depends
//! on it.

use std::time::{Duration, Instant};

use sysinfo::{get_current_pid, Pid, ProcessRefreshKind, System};

/// A single resource usage sample.
#[derive(Debug, Clone)]
pub struct ResourceSample {
    /// When this sample was taken
    pub timestamp: Instant,
    /// CPU usage percentage (0-100+ across cores)
    pub cpu_usage: f32,
    /// Memory usage in megabytes
    pub memory_mb: u64,
}

/// Monitors resource usage of the current process.
pub struct ResourceMonitor {
    system: System,
    process_id: Pid,
    samples: Vec<ResourceSample>,
    warmup_done: bool,
    last_sample: Option<Instant>,
    min_interval: Duration,
}

impl ResourceMonitor {
    /// Creates a monitor for the current process.
    pub fn new() -> Self {
        Self {
            system: System::new(),
            process_id: get_current_pid().expect("Failed to get process ID"),
            samples: Vec::new(),
            warmup_done: false,
            last_sample: None,
            min_interval: Duration::from_millis(250),
        }
    }

    /// Sets the minimum interval between samples.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Takes a sample. The first call only warms up the CPU counters;
    /// subsequent calls are rate-limited by `min_interval`.
    pub fn sample(&mut self) {
        let now = Instant::now();
        let refresh_kind = ProcessRefreshKind::new().with_cpu().with_memory();

        if !self.warmup_done {
            self.system.refresh_processes_specifics(refresh_kind);
            self.warmup_done = true;
            self.last_sample = Some(now);
            return;
        }

        if let Some(last) = self.last_sample {
            if now.duration_since(last) < self.min_interval {
                return;
            }
        }

        self.system.refresh_processes_specifics(refresh_kind);
        self.last_sample = Some(now);

        if let Some(process) = self.system.process(self.process_id) {
            self.samples.push(ResourceSample {
                timestamp: now,
                cpu_usage: process.cpu_usage(),
                memory_mb: process.memory() / (1024 * 1024),
            });
        }
    }

    /// Number of samples collected.
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// All samples, in order.
    pub fn samples(&self) -> &[ResourceSample] {
        &self.samples
    }

    /// Peak memory across the run, in megabytes.
    pub fn peak_memory_mb(&self) -> u64 {
        self.samples.iter().map(|s| s.memory_mb).max().unwrap_or(0)
    }

    /// Mean CPU usage across the run.
    pub fn average_cpu(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.cpu_usage).sum::<f32>() / self.samples.len() as f32
    }

    /// Human-readable usage summary.
    pub fn summary(&self) -> String {
        if self.samples.is_empty() {
            return "Resource usage: no samples collected".to_string();
        }
        format!(
            "Resource usage: {} samples, avg cpu {:.1}%, peak memory {} MB",
            self.samples.len(),
            self.average_cpu(),
            self.peak_memory_mb()
        )
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}
