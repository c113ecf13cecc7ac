//! Mock Hardware Drivers for oct_scan
//!
//! Simulated devices for running scans without hardware. All delays use
//! `tokio::time`, so tests can run them on a paused clock.
//!
//! # Available Mock Drivers
//!
//! - [`MockDigitizer`] - swept-source digitizer producing reference fringes
//!   and multi-reflector interferograms with a nonlinear k-clock
//! - [`MockPositioner`] - two-channel analog output stage whose tasks report
//!   into a shared [`PositionerLedger`]
//!
//! # Performance Characteristics (timed modes)
//!
//! - MockDigitizer: 200µs per command, records paced at the trigger rate
//!   (100 kHz default), 5µs transfer per record
//! - MockPositioner: 100µs per write, completion paced by the sample clock

pub mod common;
mod mock_digitizer;
mod mock_positioner;

pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};

pub use mock_digitizer::{CompletionBehavior, DigitizerStats, MockDigitizer, SweptSourceSignal};
pub use mock_positioner::{MockPositioner, PositionerLedger, TaskCompletion, WriteRecord};
