//! Operational modes for mock devices.
//!
//! - **Instant**: no delays; acquisitions complete on the first status poll
//! - **Realistic**: command latency and record-rate-limited acquisitions
//! - **Chaos**: realistic timing plus random failures from [`ErrorConfig`]
//!
//! [`ErrorConfig`]: super::ErrorConfig

/// Operational modes for mock devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests
    Realistic,
    /// Hardware-like timing with injected failures - for resilience testing
    Chaos,
}

impl MockMode {
    /// Whether simulated latency applies.
    pub fn is_timed(self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}
