//! Memory-pressure governor.
//!
//! The governor slows admission of heavy stages when the process's resident
//! memory crosses configured thresholds. It is advisory only: it delays work,
//! it never refuses it.

mod probe;

pub use probe::{FixedMemoryProbe, MemoryProbe, ProcStatusProbe};

use crate::config::MemoryConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// One memory sample together with the thresholds it is judged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryReading {
    /// Resident memory in MB.
    pub resident_mb: u64,
    /// Soft threshold in MB.
    pub soft_mb: u64,
    /// Hard threshold in MB.
    pub hard_mb: u64,
}

/// Pressure level of a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pressure {
    /// Below the soft threshold.
    Normal,
    /// Between the soft and hard thresholds.
    Elevated,
    /// At or above the hard threshold.
    Critical,
}

impl MemoryReading {
    /// Classifies the reading.
    #[must_use]
    pub fn pressure(&self) -> Pressure {
        if self.resident_mb >= self.hard_mb {
            Pressure::Critical
        } else if self.resident_mb >= self.soft_mb {
            Pressure::Elevated
        } else {
            Pressure::Normal
        }
    }
}

/// Samples memory and turns readings into admission delays.
#[derive(Clone)]
pub struct MemoryGovernor {
    probe: Arc<dyn MemoryProbe>,
    soft_mb: u64,
    hard_mb: u64,
    soft_delay: Duration,
    hard_delay: Duration,
}

impl MemoryGovernor {
    /// Creates a governor reading `/proc/self/status`.
    #[must_use]
    pub fn new(config: &MemoryConfig) -> Self {
        Self::with_probe(config, Arc::new(ProcStatusProbe::new()))
    }

    /// Creates a governor with a custom probe.
    #[must_use]
    pub fn with_probe(config: &MemoryConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            probe,
            soft_mb: config.soft_threshold_mb,
            hard_mb: config.hard_threshold_mb,
            soft_delay: crate::config::seconds(config.soft_delay_seconds),
            hard_delay: crate::config::seconds(config.hard_delay_seconds),
        }
    }

    /// Takes a reading.
    #[must_use]
    pub fn sample(&self) -> MemoryReading {
        MemoryReading {
            resident_mb: self.probe.resident_mb(),
            soft_mb: self.soft_mb,
            hard_mb: self.hard_mb,
        }
    }

    /// Returns the delay a reading calls for.
    #[must_use]
    pub fn decide(&self, reading: &MemoryReading) -> Duration {
        match reading.pressure() {
            Pressure::Normal => Duration::ZERO,
            Pressure::Elevated => self.soft_delay,
            Pressure::Critical => self.hard_delay,
        }
    }

    /// Samples, and sleeps for the decided delay. Returns the delay applied.
    pub async fn throttle(&self) -> Duration {
        let reading = self.sample();
        let delay = self.decide(&reading);
        if !delay.is_zero() {
            warn!(
                resident_mb = reading.resident_mb,
                soft_mb = reading.soft_mb,
                hard_mb = reading.hard_mb,
                pressure = ?reading.pressure(),
                delay_ms = delay.as_millis() as u64,
                "memory pressure detected, delaying work"
            );
            tokio::time::sleep(delay).await;
        }
        delay
    }
}

impl std::fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("soft_mb", &self.soft_mb)
            .field("hard_mb", &self.hard_mb)
            .field("soft_delay", &self.soft_delay)
            .field("hard_delay", &self.hard_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn governor(probe: &FixedMemoryProbe) -> MemoryGovernor {
        MemoryGovernor::with_probe(&MemoryConfig::default(), Arc::new(probe.clone()))
    }

    #[test]
    fn test_decide_thresholds() {
        let probe = FixedMemoryProbe::new(0);
        let gov = governor(&probe);

        let cases = [
            (500, Duration::ZERO),
            (767, Duration::ZERO),
            (768, Duration::from_secs(1)),
            (800, Duration::from_secs(1)),
            (1023, Duration::from_secs(1)),
            (1024, Duration::from_secs(5)),
            (1100, Duration::from_secs(5)),
        ];
        for (mb, expected) in cases {
            probe.set(mb);
            assert_eq!(gov.decide(&gov.sample()), expected, "reading {mb}");
        }
    }

    #[test]
    fn test_decide_is_monotonic() {
        let probe = FixedMemoryProbe::new(0);
        let gov = governor(&probe);
        let mut last = Duration::ZERO;
        for mb in (0..2048).step_by(16) {
            probe.set(mb);
            let delay = gov.decide(&gov.sample());
            assert!(delay >= last);
            last = delay;
        }
    }

    #[test]
    fn test_pressure_levels() {
        let reading = MemoryReading { resident_mb: 800, soft_mb: 768, hard_mb: 1024 };
        assert_eq!(reading.pressure(), Pressure::Elevated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_sleeps_under_pressure() {
        let probe = FixedMemoryProbe::new(1100);
        let gov = governor(&probe);

        let start = tokio::time::Instant::now();
        assert_eq!(gov.throttle().await, Duration::from_secs(5));
        assert!(start.elapsed() >= Duration::from_secs(5));

        probe.set(100);
        assert_eq!(gov.throttle().await, Duration::ZERO);
    }
}
