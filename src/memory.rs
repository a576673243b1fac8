//! Worker memory sampling and pressure classification

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use sysinfo::{Pid, System};
use tracing::{trace, warn};

pub const DEFAULT_SOFT_LIMIT_MB: f64 = 150.0;
pub const DEFAULT_HARD_LIMIT_MB: f64 = 200.0;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Source of the current resident memory figure
pub trait MemoryProbe: Send {
    fn resident_bytes(&mut self) -> Result<u64, String>;
}

/// Resident set size of this process, via `sysinfo`
pub struct ProcessMemoryProbe {
    system: System,
    pid: Option<Pid>,
}

impl ProcessMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_bytes(&mut self) -> Result<u64, String> {
        let pid = self.pid.ok_or_else(|| "current pid unavailable".to_string())?;
        self.system.refresh_process(pid);
        self.system
            .process(pid)
            .map(|process| process.memory())
            .ok_or_else(|| format!("process {pid} not found in sysinfo snapshot"))
    }
}

/// Probe whose reading is set by hand; clones share the reading
#[derive(Debug, Clone, Default)]
pub struct ManualProbe {
    bytes: Arc<AtomicU64>,
}

impl ManualProbe {
    pub fn new(mb: f64) -> Self {
        let probe = Self::default();
        probe.set_mb(mb);
        probe
    }

    pub fn set_mb(&self, mb: f64) {
        self.bytes
            .store((mb.max(0.0) * BYTES_PER_MB) as u64, Ordering::SeqCst);
    }
}

impl MemoryProbe for ManualProbe {
    fn resident_bytes(&mut self) -> Result<u64, String> {
        Ok(self.bytes.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub soft_mb: f64,
    pub hard_mb: f64,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            soft_mb: DEFAULT_SOFT_LIMIT_MB,
            hard_mb: DEFAULT_HARD_LIMIT_MB,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    Normal,
    /// Above the soft ceiling: stop growing the current chunk
    Soft,
    /// Above the hard ceiling: drop caches as well
    Hard,
}

pub struct MemoryMonitor {
    probe: Box<dyn MemoryProbe>,
    limits: MemoryLimits,
    last_mb: f64,
}

impl MemoryMonitor {
    pub fn new(probe: Box<dyn MemoryProbe>, limits: MemoryLimits) -> Self {
        Self {
            probe,
            limits,
            last_mb: 0.0,
        }
    }

    /// Current usage in MB. A failing probe reports the last known figure.
    pub fn sample(&mut self) -> f64 {
        match self.probe.resident_bytes() {
            Ok(bytes) => {
                self.last_mb = bytes as f64 / BYTES_PER_MB;
                trace!(memory_mb = self.last_mb, "memory sample");
            }
            Err(err) => warn!(error = %err, "memory probe failed, reusing last sample"),
        }
        self.last_mb
    }

    pub fn assess(&self, usage_mb: f64) -> MemoryPressure {
        if usage_mb > self.limits.hard_mb {
            MemoryPressure::Hard
        } else if usage_mb > self.limits.soft_mb {
            MemoryPressure::Soft
        } else {
            MemoryPressure::Normal
        }
    }

    /// Sample and classify in one go
    pub fn check(&mut self) -> (f64, MemoryPressure) {
        let usage = self.sample();
        (usage, self.assess(usage))
    }
}
