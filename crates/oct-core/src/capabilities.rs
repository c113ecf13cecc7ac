//! Device capability traits.
//!
//! The scheduler drives exactly two devices, and each gets a small trait that
//! covers only the calls a scan needs:
//!
//! - [`Digitizer`]: record capture synchronized to the laser sweep.
//! - [`Positioner`]: a factory for [`OutputTask`]s, each of which owns one
//!   written voltage buffer until it is stopped and closed.
//!
//! # Design Philosophy
//!
//! - Slow operations (configure, initiate, fetch, write, start, wait) are async.
//! - Release operations (`abort`, `stop`, `close`) are synchronous so scoped
//!   guards can call them from `Drop` on every exit path.
//! - Methods return [`DriverResult`]. The scheduler adds device and stage
//!   context when it converts them to `OctError`.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn capture(digitizer: &dyn Digitizer) -> DriverResult<Vec<f64>> {
//!     digitizer.initiate_acquisition().await?;
//!     while digitizer.acquisition_status().await? != AcquisitionStatus::Complete {
//!         tokio::time::sleep(Duration::from_millis(100)).await;
//!     }
//!     let len = digitizer.actual_record_length()?;
//!     let mut buffer = vec![0.0; len];
//!     digitizer.fetch(&ChannelList::single("0"), &mut buffer).await?;
//!     Ok(buffer)
//! }
//! ```

use async_trait::async_trait;

use crate::data::{AcquisitionStatus, ChannelList, FetchLayout, VoltageFrames};
use crate::error::DriverResult;
use crate::timing::{
    ExportSignal, HorizontalTiming, SampleClockConfig, TriggerConfig, VerticalConfig,
    VoltageChannelSpec,
};

// =============================================================================
// Digitizer
// =============================================================================

/// Waveform digitizer capturing detector and reference channels.
///
/// Invariant: at most one acquisition is active per handle. Calling
/// [`initiate_acquisition`](Digitizer::initiate_acquisition) while one is
/// running is an error; [`abort`](Digitizer::abort) ends it.
#[async_trait]
pub trait Digitizer: Send + Sync {
    /// Device name used in logs and errors.
    fn name(&self) -> &str;

    /// Record length, sample rate and record count.
    async fn configure_horizontal_timing(&self, timing: &HorizontalTiming) -> DriverResult<()>;

    /// Trigger source and level.
    async fn configure_trigger(&self, trigger: &TriggerConfig) -> DriverResult<()>;

    /// Vertical range for one channel. Called once per channel.
    async fn configure_vertical(&self, vertical: &VerticalConfig) -> DriverResult<()>;

    /// Route an internal signal to an output terminal.
    async fn export_signal(&self, export: &ExportSignal) -> DriverResult<()>;

    /// Arm the digitizer; records are captured as triggers arrive.
    async fn initiate_acquisition(&self) -> DriverResult<()>;

    /// Current acquisition state.
    async fn acquisition_status(&self) -> DriverResult<AcquisitionStatus>;

    /// Record length the hardware actually uses after coercion.
    fn actual_record_length(&self) -> DriverResult<usize>;

    /// Order in which [`fetch`](Digitizer::fetch) fills the destination.
    fn fetch_layout(&self) -> FetchLayout;

    /// Copy all captured records of `channels` into `destination`.
    ///
    /// `destination` must hold exactly
    /// `channels.len() * num_records * actual_record_length` values.
    async fn fetch(&self, channels: &ChannelList, destination: &mut [f64]) -> DriverResult<()>;

    /// End any running acquisition. Safe to call when idle.
    fn abort(&self) -> DriverResult<()>;
}

// =============================================================================
// Positioner
// =============================================================================

/// Multi-axis analog output stage.
pub trait Positioner: Send + Sync {
    /// Device name used in logs and errors.
    fn name(&self) -> &str;

    /// Create an unconfigured output task.
    fn create_task(&self) -> DriverResult<Box<dyn OutputTask>>;
}

/// One analog output generation: channels, timing, a buffer and a run.
///
/// The task owns its written buffer until [`stop`](OutputTask::stop) and
/// [`close`](OutputTask::close) are called. Closing twice is an error.
#[async_trait]
pub trait OutputTask: Send {
    /// Add an output channel. Called once per axis, X first.
    fn create_voltage_channel(&mut self, spec: &VoltageChannelSpec) -> DriverResult<()>;

    /// Configure the sample clock.
    fn configure_timing_sample_clock(&mut self, clock: &SampleClockConfig) -> DriverResult<()>;

    /// Write the buffer; with `auto_start` generation begins immediately.
    async fn write(&mut self, frames: &VoltageFrames, auto_start: bool) -> DriverResult<()>;

    /// Begin generation of a written buffer.
    async fn start(&mut self) -> DriverResult<()>;

    /// Resolve once a finite generation has output every sample.
    async fn wait_until_done(&mut self) -> DriverResult<()>;

    /// Halt generation. The outputs hold their last value.
    fn stop(&mut self) -> DriverResult<()>;

    /// Release the task and its buffer.
    fn close(&mut self) -> DriverResult<()>;
}
