//! Memory watchdog.
//!
//! Samples the process RSS against a configured cap and logs pressure.
//! Purely observational; it never terminates anything.

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, error, warn};

/// Sampling interval.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Warn threshold as a fraction of the cap.
const WARN_RATIO: f64 = 0.85;

/// Critical threshold as a fraction of the cap.
const CRITICAL_RATIO: f64 = 0.95;

/// Pressure level of the last sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
}

pub fn classify(rss: u64, cap: u64) -> MemoryPressure {
    if cap == 0 {
        return MemoryPressure::Normal;
    }
    let ratio = rss as f64 / cap as f64;
    if ratio >= CRITICAL_RATIO {
        MemoryPressure::Critical
    } else if ratio >= WARN_RATIO {
        MemoryPressure::Warning
    } else {
        MemoryPressure::Normal
    }
}

/// Watchdog sampling this process's memory.
pub struct MemoryWatchdog {
    cap: u64,
    system: System,
    pid: Pid,
}

impl MemoryWatchdog {
    pub fn new(cap: u64) -> Self {
        Self {
            cap,
            system: System::new(),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Take one sample and log according to pressure.
    pub fn sample(&mut self) -> MemoryPressure {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let Some(process) = self.system.process(self.pid) else {
            return MemoryPressure::Normal;
        };
        let rss = process.memory();
        let pressure = classify(rss, self.cap);
        match pressure {
            MemoryPressure::Critical => error!(
                rss_mb = rss / 1_048_576,
                cap_mb = self.cap / 1_048_576,
                "Memory critically high"
            ),
            MemoryPressure::Warning => warn!(
                rss_mb = rss / 1_048_576,
                cap_mb = self.cap / 1_048_576,
                "Memory pressure elevated"
            ),
            MemoryPressure::Normal => debug!(rss_mb = rss / 1_048_576, "Memory sample"),
        }
        pressure
    }

    /// Run the sampling loop until the process exits. Spawn as a
    /// background task.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        loop {
            ticker.tick().await;
            self.sample();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_thresholds() {
        let cap = 1000;
        assert_eq!(classify(100, cap), MemoryPressure::Normal);
        assert_eq!(classify(849, cap), MemoryPressure::Normal);
        assert_eq!(classify(850, cap), MemoryPressure::Warning);
        assert_eq!(classify(949, cap), MemoryPressure::Warning);
        assert_eq!(classify(950, cap), MemoryPressure::Critical);
        assert_eq!(classify(500, 0), MemoryPressure::Normal);
    }
}
