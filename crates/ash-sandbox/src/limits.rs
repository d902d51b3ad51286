//! Resource limits applied per sandbox.

#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Memory ceiling in MiB. Swap is always disabled alongside this.
    pub memory_mb: u64,
    /// CPU quota/period, expressed as a fraction of one core (e.g. `1.5`
    /// cores == `cpu_quota_us=150000, cpu_period_us=100000`).
    pub cpu_cores: f64,
    /// Process count ceiling — fork-bomb defense.
    pub max_processes: u32,
    /// Workspace directory size ceiling in MiB, polled by a background
    /// monitor; breaching it destroys the sandbox.
    pub disk_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpu_cores: 1.0,
            max_processes: 64,
            disk_mb: 2048,
        }
    }
}

impl ResourceLimits {
    pub fn cpu_period_us(&self) -> u64 {
        100_000
    }

    pub fn cpu_quota_us(&self) -> u64 {
        (self.cpu_period_us() as f64 * self.cpu_cores) as u64
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }
}
