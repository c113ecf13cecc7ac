//! `oct-core`
//!
//! Core types and device traits shared by the oct_scan crates.
//!
//! ## Modules
//!
//! - [`error`]: `DriverError` for device traits, `OctError` for everything else
//! - [`capabilities`]: `Digitizer`, `Positioner` and `OutputTask`
//! - [`data`]: trajectories, voltage buffers and fetch layouts
//! - [`timing`]: typed, validated device configuration records
//!
//! Driver crates depend on this crate only; the scheduler and processing
//! pipeline live in `oct_scan`.

pub mod capabilities;
pub mod data;
pub mod error;
pub mod timing;

pub use capabilities::{Digitizer, OutputTask, Positioner};
pub use data::{
    AcquisitionStatus, ChannelList, FetchLayout, Point2, SegmentRole, Trajectory,
    TrajectoryPoint, VoltageFrames,
};
pub use error::{DriverError, DriverErrorKind, DriverResult, OctError, OctResult};
