//! Common infrastructure for the mock devices.
//!
//! - **mode**: Operational modes (Instant, Realistic, Chaos)
//! - **timing**: Hardware-like delays for realistic mode
//! - **errors**: Error injection keyed by operation name
//! - **rng**: Seeded random number generator shared by noise and failures

pub mod errors;
pub mod mode;
pub mod rng;
pub mod timing;

pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;
pub use rng::MockRng;
pub use timing::TimingConfig;
