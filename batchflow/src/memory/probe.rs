//! Sources of resident-memory readings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Reports the process's resident memory.
pub trait MemoryProbe: Send + Sync {
    /// Returns resident memory in MB. Returns 0 when unavailable.
    fn resident_mb(&self) -> u64;
}

/// Reads `VmRSS` from `/proc/self/status`.
#[derive(Debug, Clone, Default)]
pub struct ProcStatusProbe {
    path: Option<String>,
}

impl ProcStatusProbe {
    /// Creates a probe for the current process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a probe reading an alternate status file.
    #[must_use]
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    fn path(&self) -> &str {
        self.path.as_deref().unwrap_or("/proc/self/status")
    }
}

impl MemoryProbe for ProcStatusProbe {
    fn resident_mb(&self) -> u64 {
        match std::fs::read_to_string(self.path()) {
            Ok(status) => parse_vm_rss_mb(&status).unwrap_or_else(|| {
                debug!(path = self.path(), "VmRSS not found in status file");
                0
            }),
            Err(e) => {
                debug!(path = self.path(), error = %e, "memory status unreadable");
                0
            }
        }
    }
}

/// Extracts `VmRSS` (reported in kB) from a `/proc/<pid>/status` document.
pub(crate) fn parse_vm_rss_mb(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb / 1024)
}

/// A probe returning a settable value. Used by tests and simulations.
#[derive(Debug, Clone, Default)]
pub struct FixedMemoryProbe {
    value: Arc<AtomicU64>,
}

impl FixedMemoryProbe {
    /// Creates a probe reporting `mb`.
    #[must_use]
    pub fn new(mb: u64) -> Self {
        Self {
            value: Arc::new(AtomicU64::new(mb)),
        }
    }

    /// Changes the reported value. Clones observe the change.
    pub fn set(&self, mb: u64) {
        self.value.store(mb, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn resident_mb(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tbatchflow\nVmPeak:\t  900000 kB\nVmRSS:\t  819200 kB\nThreads:\t4\n";
        assert_eq!(parse_vm_rss_mb(status), Some(800));
        assert_eq!(parse_vm_rss_mb("Name:\tx\n"), None);
        assert_eq!(parse_vm_rss_mb("VmRSS:\tlots kB\n"), None);
    }

    #[test]
    fn test_unreadable_status_reports_zero() {
        let probe = ProcStatusProbe::with_path("/definitely/not/here");
        assert_eq!(probe.resident_mb(), 0);
    }

    #[test]
    fn test_fixed_probe_is_shared() {
        let probe = FixedMemoryProbe::new(500);
        let clone = probe.clone();
        clone.set(1100);
        assert_eq!(probe.resident_mb(), 1100);
    }
}
