//! # oct_scan
//!
//! Acquisition and processing for a swept-source optical coherence tomography
//! scanner: a waveform digitizer records one A-line per laser sweep while a
//! two-axis galvanometer stage moves the beam along a planned trajectory.
//!
//! ## Crate Structure
//!
//! - **`path`**: trajectory synthesis. Straight lines at a point density,
//!   C1-continuous cubic transitions, ramped single lines, raster grids and
//!   return paths.
//! - **`plan`**: scan parameters derived from corners, density and laser rate.
//! - **`scheduler`**: the arm/acquire/fetch/reposition state machine over the
//!   two devices, for single, volumetric and continuous scans.
//! - **`calibration`**: zero-crossing fit of the reference fringe to a
//!   degree-7 clock correction, with persistence.
//! - **`spline`**: natural cubic spline used by the resampler.
//! - **`resample`**: correction of raw records onto a uniform grid.
//! - **`transform`**: magnitude spectra.
//! - **`preview`**: consumer that renders continuous-scan frames as 8-bit images.
//! - **`pipeline`**: command steps chained by the CLI.
//! - **`config`**: figment-backed settings and their typed views.
//! - **`logging`**: tracing subscriber setup.
//!
//! Device traits and shared types live in `oct_core`; simulated devices in
//! `oct_driver_mock`.

pub mod calibration;
pub mod config;
pub mod logging;
pub mod path;
pub mod pipeline;
pub mod plan;
pub mod preview;
pub mod resample;
pub mod scheduler;
pub mod spline;
pub mod transform;

pub use calibration::{CalibrationCoefficients, CalibrationEngine, CoefficientStore};
pub use config::Settings;
pub use oct_core::error::{OctError, OctResult};
pub use pipeline::{Pipeline, PipelineData, Step};
pub use plan::{ScanBounds, ScanKind, ScanPlan};
pub use resample::Resampler;
pub use scheduler::{AcquisitionBuffer, DeviceBank, Scheduler, SchedulerSettings};
pub use transform::FrequencyTransform;
