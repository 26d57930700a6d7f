//! Available-memory queries used to scale batch sizes down under pressure.

use parking_lot::Mutex;
use sysinfo::System;
use tracing::debug;

/// Conservative reading used when the platform cannot report memory.
pub const DEFAULT_AVAILABLE_MB: f64 = 1000.0;

/// Source of available-memory readings.
pub trait MemoryProbe: Send + Sync {
    /// Available memory in megabytes, or `None` if it cannot be determined.
    fn available_mb(&self) -> Option<f64>;
}

/// Reads available memory from the operating system via `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn available_mb(&self) -> Option<f64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let bytes = system.available_memory();
        // sysinfo reports 0 on platforms it does not support
        if bytes == 0 {
            None
        } else {
            Some(bytes as f64 / (1024.0 * 1024.0))
        }
    }
}

/// A probe that always reports the same value. Useful for pinning plans.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub Option<f64>);

impl MemoryProbe for FixedMemoryProbe {
    fn available_mb(&self) -> Option<f64> {
        self.0
    }
}

/// Side-effect-free view of available memory.
///
/// Never fails: an unavailable or nonsensical reading degrades to
/// [`DEFAULT_AVAILABLE_MB`] so memory scaling cannot abort a job.
pub struct MemoryMonitor {
    probe: Box<dyn MemoryProbe>,
    fallback_mb: f64,
}

impl MemoryMonitor {
    /// Creates a monitor backed by the operating system.
    pub fn system() -> Self {
        Self::with_probe(SystemMemoryProbe::new())
    }

    /// Creates a monitor backed by a custom probe.
    pub fn with_probe(probe: impl MemoryProbe + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            fallback_mb: DEFAULT_AVAILABLE_MB,
        }
    }

    /// Creates a monitor that always reports `mb`.
    pub fn fixed(mb: f64) -> Self {
        Self::with_probe(FixedMemoryProbe(Some(mb)))
    }

    /// Overrides the value reported when the probe has no answer.
    pub fn with_fallback_mb(mut self, mb: f64) -> Self {
        self.fallback_mb = mb;
        self
    }

    /// Current available memory in megabytes.
    pub fn available_mb(&self) -> f64 {
        match self.probe.available_mb() {
            Some(mb) if mb.is_finite() && mb >= 0.0 => mb,
            other => {
                debug!(
                    reading = ?other,
                    fallback_mb = self.fallback_mb,
                    "Memory probe unavailable, using fallback"
                );
                self.fallback_mb
            }
        }
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::system()
    }
}
