//! Host power state
//!
//! The selector's first arbitration rule depends on the device battery;
//! the host runtime exposes it behind this trait so the rule is testable
//! and so the core never talks to an OS API directly.

use std::sync::atomic::{AtomicU8, Ordering};

/// Read access to the host's power state
pub trait PowerMonitor: Send + Sync {
    /// Current battery percentage (0..=100); None when unknown or on
    /// mains power
    fn battery_percent(&self) -> Option<u8>;
}

/// A power monitor with a settable level, for hosts that push updates and
/// for tests.
#[derive(Debug, Default)]
pub struct FixedPowerMonitor {
    percent: AtomicU8,
    known: std::sync::atomic::AtomicBool,
}

impl FixedPowerMonitor {
    /// Create with an unknown battery level
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Create at a fixed percentage
    pub fn at(percent: u8) -> Self {
        let monitor = Self::default();
        monitor.set(percent);
        monitor
    }

    /// Update the battery level
    pub fn set(&self, percent: u8) {
        self.percent.store(percent.min(100), Ordering::Relaxed);
        self.known.store(true, Ordering::Relaxed);
    }
}

impl PowerMonitor for FixedPowerMonitor {
    fn battery_percent(&self) -> Option<u8> {
        if self.known.load(Ordering::Relaxed) {
            Some(self.percent.load(Ordering::Relaxed))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_monitor() {
        let monitor = FixedPowerMonitor::unknown();
        assert_eq!(monitor.battery_percent(), None);

        monitor.set(42);
        assert_eq!(monitor.battery_percent(), Some(42));

        monitor.set(150);
        assert_eq!(monitor.battery_percent(), Some(100));
    }
}
