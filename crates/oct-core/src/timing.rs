//! Typed device configuration records.
//!
//! These are the validated values the scheduler hands to device traits.
//! They deserialize straight out of the settings file, so each record has a
//! `validate` method that is run once at load time, before any hardware call.
//!
//! # Timing Model
//!
//! ```text
//!  laser sweep ──┐    ┌── one record per sweep ──┐
//!                ▼    ▼                          ▼
//!  digitizer   |rec0|rec1|rec2| ... |recN-1|        samples_per_record @ sample_rate_hz
//!  positioner  | p0 | p1 | p2 | ... | pN-1 |        one output sample per sweep
//! ```
//!
//! The positioner scan clock and the digitizer record trigger both follow the
//! laser sweep, so the record count of an acquisition equals the number of
//! positioner samples written for it.
//!
//! # Example
//!
//! ```
//! use oct_core::timing::HorizontalTiming;
//!
//! let timing = HorizontalTiming::builder()
//!     .samples_per_record(2048)
//!     .sample_rate_hz(200e6)
//!     .num_records(500)
//!     .build()
//!     .unwrap();
//! assert_eq!(timing.num_records, 500);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{OctError, OctResult};

fn default_true() -> bool {
    true
}

fn default_attenuation() -> f64 {
    1.0
}

// =============================================================================
// Digitizer
// =============================================================================

/// Record length, sample rate and record count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HorizontalTiming {
    /// Samples captured per record (one laser sweep).
    pub samples_per_record: usize,
    /// Digitizer sample rate.
    pub sample_rate_hz: f64,
    /// Records per acquisition. The scheduler overrides this per segment.
    pub num_records: usize,
    /// Reference (trigger) position within the record, in percent.
    #[serde(default)]
    pub ref_position_pct: f64,
    /// Whether the device must stream in real time.
    #[serde(default = "default_true")]
    pub enforce_realtime: bool,
}

impl HorizontalTiming {
    /// Start a builder.
    pub fn builder() -> HorizontalTimingBuilder {
        HorizontalTimingBuilder::default()
    }

    /// Copy with a different record count.
    pub fn with_num_records(&self, num_records: usize) -> Self {
        Self {
            num_records,
            ..self.clone()
        }
    }

    /// Duration of one record.
    pub fn record_duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_record as f64 / self.sample_rate_hz)
    }

    /// Reject values the digitizer can never accept.
    pub fn validate(&self) -> OctResult<()> {
        if self.samples_per_record == 0 {
            return Err(OctError::Configuration(
                "digitizer.horizontal.samples_per_record must be > 0".into(),
            ));
        }
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(OctError::Configuration(format!(
                "digitizer.horizontal.sample_rate_hz must be positive, got {}",
                self.sample_rate_hz
            )));
        }
        if self.num_records == 0 {
            return Err(OctError::Configuration(
                "digitizer.horizontal.num_records must be > 0".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.ref_position_pct) {
            return Err(OctError::Configuration(format!(
                "digitizer.horizontal.ref_position_pct must be within 0-100, got {}",
                self.ref_position_pct
            )));
        }
        Ok(())
    }
}

/// Builder for [`HorizontalTiming`].
#[derive(Debug, Default)]
pub struct HorizontalTimingBuilder {
    samples_per_record: Option<usize>,
    sample_rate_hz: Option<f64>,
    num_records: Option<usize>,
    ref_position_pct: f64,
    enforce_realtime: Option<bool>,
}

impl HorizontalTimingBuilder {
    /// Samples per record.
    pub fn samples_per_record(mut self, samples: usize) -> Self {
        self.samples_per_record = Some(samples);
        self
    }

    /// Sample rate in Hz.
    pub fn sample_rate_hz(mut self, rate: f64) -> Self {
        self.sample_rate_hz = Some(rate);
        self
    }

    /// Records per acquisition.
    pub fn num_records(mut self, records: usize) -> Self {
        self.num_records = Some(records);
        self
    }

    /// Trigger reference position in percent.
    pub fn ref_position_pct(mut self, pct: f64) -> Self {
        self.ref_position_pct = pct;
        self
    }

    /// Real-time streaming requirement.
    pub fn enforce_realtime(mut self, enforce: bool) -> Self {
        self.enforce_realtime = Some(enforce);
        self
    }

    /// Validate and build.
    pub fn build(self) -> OctResult<HorizontalTiming> {
        let timing = HorizontalTiming {
            samples_per_record: self.samples_per_record.ok_or_else(|| {
                OctError::Configuration("samples_per_record is required".into())
            })?,
            sample_rate_hz: self
                .sample_rate_hz
                .ok_or_else(|| OctError::Configuration("sample_rate_hz is required".into()))?,
            num_records: self.num_records.unwrap_or(1),
            ref_position_pct: self.ref_position_pct,
            enforce_realtime: self.enforce_realtime.unwrap_or(true),
        };
        timing.validate()?;
        Ok(timing)
    }
}

/// Trigger slope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSlope {
    /// Rising edge.
    #[default]
    Positive,
    /// Falling edge.
    Negative,
}

/// Trigger input coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCoupling {
    /// DC coupled.
    #[default]
    Dc,
    /// AC coupled.
    Ac,
    /// High-frequency reject.
    HfReject,
    /// Low-frequency reject.
    LfReject,
}

/// Edge trigger driven by the laser sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Trigger source terminal (e.g. `"TRIG"` or `"PFI1"`).
    pub source: String,
    /// Trigger level in volts.
    #[serde(default)]
    pub level: f64,
    /// Slope.
    #[serde(default)]
    pub slope: TriggerSlope,
    /// Coupling.
    #[serde(default)]
    pub coupling: TriggerCoupling,
    /// Holdoff after each trigger.
    #[serde(default, with = "humantime_serde")]
    pub holdoff: Duration,
}

impl TriggerConfig {
    /// Reject an empty source.
    pub fn validate(&self) -> OctResult<()> {
        if self.source.trim().is_empty() {
            return Err(OctError::Configuration(
                "digitizer.trigger.source must not be empty".into(),
            ));
        }
        if !self.level.is_finite() {
            return Err(OctError::Configuration(
                "digitizer.trigger.level must be finite".into(),
            ));
        }
        Ok(())
    }
}

/// Vertical input coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalCoupling {
    /// DC coupled.
    #[default]
    Dc,
    /// AC coupled.
    Ac,
    /// Input grounded.
    Gnd,
}

/// Vertical range of one digitizer channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerticalConfig {
    /// Channel name (e.g. `"0"`).
    pub channel: String,
    /// Peak-to-peak input range in volts.
    pub range: f64,
    /// Offset in volts.
    #[serde(default)]
    pub offset: f64,
    /// Coupling.
    #[serde(default)]
    pub coupling: VerticalCoupling,
    /// Probe attenuation factor.
    #[serde(default = "default_attenuation")]
    pub probe_attenuation: f64,
    /// Whether the channel is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl VerticalConfig {
    /// Check range and attenuation.
    pub fn validate(&self, role: &str) -> OctResult<()> {
        if self.channel.trim().is_empty() {
            return Err(OctError::Configuration(format!(
                "digitizer.{role}.channel must not be empty"
            )));
        }
        if !(self.range.is_finite() && self.range > 0.0) {
            return Err(OctError::Configuration(format!(
                "digitizer.{role}.range must be positive, got {}",
                self.range
            )));
        }
        if !(self.probe_attenuation.is_finite() && self.probe_attenuation > 0.0) {
            return Err(OctError::Configuration(format!(
                "digitizer.{role}.probe_attenuation must be positive"
            )));
        }
        Ok(())
    }
}

/// Signals the digitizer can route to an output terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportedSignal {
    /// Reference clock.
    RefClock,
    /// Sample clock.
    SampleClock,
    /// Start trigger.
    StartTrigger,
    /// Reference trigger.
    RefTrigger,
    /// End of each record.
    EndOfRecord,
}

/// Route a digitizer signal to a terminal so the positioner can follow it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSignal {
    /// Signal to export.
    pub signal: ExportedSignal,
    /// Destination terminal.
    pub output_terminal: String,
}

/// Everything the scheduler needs to arm the digitizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitizerSetup {
    /// Horizontal timing; `num_records` is overridden per segment.
    pub horizontal: HorizontalTiming,
    /// Trigger.
    pub trigger: TriggerConfig,
    /// Reference (interferometer clock) channel.
    pub vertical_reference: VerticalConfig,
    /// Sample (detector) channel.
    pub vertical_sample: VerticalConfig,
    /// Optional clock export.
    #[serde(default)]
    pub export_signal: Option<ExportSignal>,
}

impl DigitizerSetup {
    /// Validate every record.
    pub fn validate(&self) -> OctResult<()> {
        self.horizontal.validate()?;
        self.trigger.validate()?;
        self.vertical_reference.validate("vertical_reference")?;
        self.vertical_sample.validate("vertical_sample")?;
        if let Some(export) = &self.export_signal {
            if export.output_terminal.trim().is_empty() {
                return Err(OctError::Configuration(
                    "digitizer.export_signal.output_terminal must not be empty".into(),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Positioner
// =============================================================================

/// One analog output channel driving a positioner axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageChannelSpec {
    /// Physical channel (e.g. `"Dev1/ao0"`).
    pub physical_channel: String,
    /// Lowest voltage the channel may output.
    pub min_voltage: f64,
    /// Highest voltage the channel may output.
    pub max_voltage: f64,
}

impl VoltageChannelSpec {
    /// Whether `volts` lies inside the channel limits.
    pub fn contains(&self, volts: f64) -> bool {
        volts.is_finite() && volts >= self.min_voltage && volts <= self.max_voltage
    }

    /// Check the limits are ordered.
    pub fn validate(&self, axis: &str) -> OctResult<()> {
        if self.physical_channel.trim().is_empty() {
            return Err(OctError::Configuration(format!(
                "positioner.{axis}.physical_channel must not be empty"
            )));
        }
        if !(self.min_voltage.is_finite()
            && self.max_voltage.is_finite()
            && self.min_voltage < self.max_voltage)
        {
            return Err(OctError::Configuration(format!(
                "positioner.{axis} voltage limits [{}, {}] are invalid",
                self.min_voltage, self.max_voltage
            )));
        }
        Ok(())
    }
}

/// Sample clock edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockEdge {
    /// Rising edge.
    #[default]
    Rising,
    /// Falling edge.
    Falling,
}

/// Output generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleMode {
    /// Output the written buffer once.
    #[default]
    Finite,
    /// Regenerate the buffer until stopped.
    Continuous,
}

/// Positioner output timing for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleClockConfig {
    /// Clock source terminal (`"OnboardClock"` or an exported digitizer line).
    pub source: String,
    /// Output sample rate in Hz.
    pub rate_hz: f64,
    /// Active edge.
    #[serde(default)]
    pub active_edge: ClockEdge,
    /// Finite or continuous generation.
    #[serde(default)]
    pub sample_mode: SampleMode,
    /// Samples per channel in the task buffer.
    pub samples_per_channel: usize,
}

impl SampleClockConfig {
    /// Finite generation of `samples` at `rate_hz`.
    pub fn finite(source: impl Into<String>, rate_hz: f64, samples: usize) -> Self {
        Self {
            source: source.into(),
            rate_hz,
            active_edge: ClockEdge::Rising,
            sample_mode: SampleMode::Finite,
            samples_per_channel: samples,
        }
    }

    /// Expected generation time for the whole buffer.
    pub fn generation_time(&self) -> Duration {
        Duration::from_secs_f64(self.samples_per_channel as f64 / self.rate_hz)
    }

    /// Reject zero rates and empty buffers.
    pub fn validate(&self) -> OctResult<()> {
        if !(self.rate_hz.is_finite() && self.rate_hz > 0.0) {
            return Err(OctError::Configuration(format!(
                "positioner sample clock rate must be positive, got {}",
                self.rate_hz
            )));
        }
        if self.samples_per_channel == 0 {
            return Err(OctError::Configuration(
                "positioner task needs at least one sample per channel".into(),
            ));
        }
        Ok(())
    }
}

/// Clock used for positioning moves (return paths, park).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositioningClock {
    /// Clock source terminal.
    pub source: String,
    /// Output sample rate in Hz.
    pub rate_hz: f64,
    /// Active edge.
    #[serde(default)]
    pub active_edge: ClockEdge,
}

impl PositioningClock {
    /// Finite sample clock for a move of `samples` points.
    pub fn for_samples(&self, samples: usize) -> SampleClockConfig {
        SampleClockConfig {
            source: self.source.clone(),
            rate_hz: self.rate_hz,
            active_edge: self.active_edge,
            sample_mode: SampleMode::Finite,
            samples_per_channel: samples,
        }
    }
}

/// Everything the scheduler needs to drive the positioner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionerSetup {
    /// Fast-axis channel.
    pub x: VoltageChannelSpec,
    /// Slow-axis channel.
    pub y: VoltageChannelSpec,
    /// Volts per stage unit on the X axis.
    pub volts_per_unit_x: f64,
    /// Volts per stage unit on the Y axis.
    pub volts_per_unit_y: f64,
    /// Clock for positioning moves.
    pub positioning: PositioningClock,
    /// Clock source for scan segments (rate follows the laser sweep).
    pub scan_clock_source: String,
    /// Peak speed for positioning moves, in stage units per second.
    pub max_speed: f64,
}

impl PositionerSetup {
    /// Validate channels, scale factors and speed.
    pub fn validate(&self) -> OctResult<()> {
        self.x.validate("x")?;
        self.y.validate("y")?;
        for (name, value) in [
            ("volts_per_unit_x", self.volts_per_unit_x),
            ("volts_per_unit_y", self.volts_per_unit_y),
        ] {
            if !value.is_finite() || value == 0.0 {
                return Err(OctError::Configuration(format!(
                    "positioner.{name} must be finite and non-zero, got {value}"
                )));
            }
        }
        if !(self.positioning.rate_hz.is_finite() && self.positioning.rate_hz > 0.0) {
            return Err(OctError::Configuration(
                "positioner.positioning.rate_hz must be positive".into(),
            ));
        }
        if !(self.max_speed.is_finite() && self.max_speed > 0.0) {
            return Err(OctError::Configuration(
                "positioner.max_speed must be positive".into(),
            ));
        }
        Ok(())
    }
}
