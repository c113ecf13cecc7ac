//! Timing configuration for realistic mode.

use std::time::Duration;

/// Hardware-like delays applied when the mock runs in a timed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimingConfig {
    /// Latency of each configuration or control call, in microseconds
    pub command_delay_us: u64,
    /// Time to transfer one record during fetch, in microseconds
    pub transfer_per_record_us: u64,
}

impl TimingConfig {
    /// Digitizer on a PCIe bus
    pub fn digitizer() -> Self {
        Self {
            command_delay_us: 200,
            transfer_per_record_us: 5,
        }
    }

    /// Analog output card
    pub fn positioner() -> Self {
        Self {
            command_delay_us: 100,
            transfer_per_record_us: 0,
        }
    }

    /// Per-call latency.
    pub fn command_delay(&self) -> Duration {
        Duration::from_micros(self.command_delay_us)
    }

    /// Fetch latency for `records` records.
    pub fn transfer_delay(&self, records: usize) -> Duration {
        Duration::from_micros(self.transfer_per_record_us.saturating_mul(records as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timing_is_zero() {
        let config = TimingConfig::default();
        assert_eq!(config.command_delay(), Duration::ZERO);
        assert_eq!(config.transfer_delay(100), Duration::ZERO);
    }

    #[test]
    fn digitizer_transfer_scales_with_records() {
        let config = TimingConfig::digitizer();
        assert_eq!(config.transfer_delay(200), Duration::from_millis(1));
    }
}
