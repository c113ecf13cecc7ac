//! Scanner configuration using Figment.
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `OCT_`, nested with `__`
//!
//! `OCT_LASER__SWEEP_FREQUENCY_HZ=50000` overrides `laser.sweep_frequency_hz`.
//!
//! [`Settings::validate`] runs before any device is opened. The scheduler and
//! processing code never see these structs directly; they receive the typed
//! views ([`Settings::scan_plan`], [`Settings::digitizer_setup`], ...).
//!
//! # Example
//! ```no_run
//! use oct_scan::config::Settings;
//!
//! let settings = Settings::load_from("config/oct.toml")?;
//! settings.validate()?;
//! let plan = settings.scan_plan()?;
//! println!("{} records per line", plan.num_records);
//! # Ok::<(), oct_core::OctError>(())
//! ```

use crate::calibration::{CalibrationCoefficients, COEFFICIENT_COUNT};
use crate::logging::{parse_log_level, LogFormat};
use crate::plan::{ScanBounds, ScanPlan};
use crate::preview::PreviewSettings;
use crate::scheduler::{SchedulerSettings, WaitPolicies, WaitPolicy};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use oct_core::error::{OctError, OctResult};
use oct_core::timing::{
    DigitizerSetup, ExportSignal, HorizontalTiming, PositionerSetup, PositioningClock,
    TriggerConfig, VerticalConfig, VoltageChannelSpec,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "OCT_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Logging.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Digitizer.
    pub digitizer: DigitizerSettings,
    /// Positioner.
    pub positioner: PositionerSettings,
    /// Scan geometry.
    pub scan: ScanSettings,
    /// Swept laser.
    pub laser: LaserSettings,
    /// Calibration polynomial and file locations.
    #[serde(default)]
    pub calibration: CalibrationSettings,
    /// Waits, retries and queue depth.
    #[serde(default)]
    pub scheduler: SchedulerTimings,
    /// Live preview scaling.
    #[serde(default)]
    pub preview: PreviewSettings,
}

/// Application-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Digitizer section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitizerSettings {
    /// Resource name of the device.
    pub resource: String,
    /// Record length and sample rate; `num_records` is set per segment.
    pub horizontal: HorizontalTiming,
    /// Trigger.
    pub trigger: TriggerConfig,
    /// Reference (k-clock) channel.
    pub vertical_reference: VerticalConfig,
    /// Detector channel.
    pub vertical_sample: VerticalConfig,
    /// Optional signal export.
    #[serde(default)]
    pub export_signal: Option<ExportSignal>,
}

/// Positioner section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionerSettings {
    /// Resource name of the device.
    pub resource: String,
    /// Fast-axis output.
    pub x: VoltageChannelSpec,
    /// Slow-axis output.
    pub y: VoltageChannelSpec,
    /// Volts per stage unit, X.
    pub volts_per_unit_x: f64,
    /// Volts per stage unit, Y.
    pub volts_per_unit_y: f64,
    /// Clock for positioning moves.
    pub positioning: PositioningClock,
    /// Clock source for scan segments.
    #[serde(default = "default_scan_clock_source")]
    pub scan_clock_source: String,
    /// Peak speed of return and park moves, stage units per second.
    pub max_speed: f64,
}

/// Scan geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Start X.
    pub x0: f64,
    /// Start Y.
    pub y0: f64,
    /// End X.
    pub xf: f64,
    /// End Y.
    pub yf: f64,
    /// Points per stage unit.
    pub density: f64,
    /// Lead-in and lead-out samples of a single line.
    #[serde(default = "default_settle_samples")]
    pub settle_samples: usize,
    /// Tomograms in a volume.
    #[serde(default = "default_num_tomograms")]
    pub num_tomograms: usize,
}

/// Swept laser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserSettings {
    /// A-line (sweep) rate in Hz.
    pub sweep_frequency_hz: f64,
}

/// Calibration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSettings {
    /// Eight polynomial coefficients, highest degree first.
    #[serde(default = "default_coefficients")]
    pub coefficients: Vec<f64>,
    /// Where a captured reference table is written.
    #[serde(default = "default_capture_path")]
    pub capture_path: PathBuf,
    /// Where accepted coefficients are persisted.
    #[serde(default = "default_coefficients_path")]
    pub coefficients_path: PathBuf,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            coefficients: default_coefficients(),
            capture_path: default_capture_path(),
            coefficients_path: default_coefficients_path(),
        }
    }
}

/// Scheduler waits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerTimings {
    /// Digitizer status poll interval.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Limit on one acquisition.
    #[serde(default = "default_acquisition_timeout", with = "humantime_serde")]
    pub acquisition_timeout: Duration,
    /// Limit on one positioner task.
    #[serde(default = "default_positioner_timeout", with = "humantime_serde")]
    pub positioner_timeout: Duration,
    /// Limit on one fetch.
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Retries after a timed-out acquisition.
    #[serde(default = "default_max_retries")]
    pub max_acquisition_retries: u32,
    /// Frames buffered between a continuous scan and its consumer.
    #[serde(default = "default_preview_queue_depth")]
    pub preview_queue_depth: usize,
}

impl Default for SchedulerTimings {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            acquisition_timeout: default_acquisition_timeout(),
            positioner_timeout: default_positioner_timeout(),
            fetch_timeout: default_fetch_timeout(),
            max_acquisition_retries: default_max_retries(),
            preview_queue_depth: default_preview_queue_depth(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_scan_clock_source() -> String {
    "PFI0".to_string()
}

fn default_settle_samples() -> usize {
    50
}

fn default_num_tomograms() -> usize {
    1
}

fn default_coefficients() -> Vec<f64> {
    CalibrationCoefficients::identity().values().to_vec()
}

fn default_capture_path() -> PathBuf {
    PathBuf::from("calibration/reference.dat")
}

fn default_coefficients_path() -> PathBuf {
    PathBuf::from("calibration/coefficients.toml")
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(10)
}

fn default_acquisition_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_positioner_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    2
}

fn default_preview_queue_depth() -> usize {
    4
}

impl Settings {
    /// Sources in merge order: `path`, then `OCT_` environment variables.
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and extract settings.
    pub fn load_from(path: impl AsRef<Path>) -> OctResult<Self> {
        Self::figment(path)
            .extract()
            .map_err(|e| OctError::Configuration(e.to_string()))
    }

    /// Check every section.
    ///
    /// A coefficient table with other than eight entries is reported as
    /// [`OctError::ConfigurationShape`]; every other problem found is
    /// collected into one [`OctError::Configuration`].
    pub fn validate(&self) -> OctResult<()> {
        if self.calibration.coefficients.len() != COEFFICIENT_COUNT {
            return Err(OctError::ConfigurationShape {
                field: "calibration.coefficients".into(),
                expected: COEFFICIENT_COUNT,
                actual: self.calibration.coefficients.len(),
            });
        }

        let mut problems = Vec::new();
        let mut check = |result: OctResult<()>| {
            if let Err(e) = result {
                problems.push(match e {
                    OctError::Configuration(message) => message,
                    other => other.to_string(),
                });
            }
        };

        check(parse_log_level(&self.application.log_level).map(drop));
        check(non_empty("digitizer.resource", &self.digitizer.resource));
        check(non_empty("positioner.resource", &self.positioner.resource));
        check(self.digitizer_setup().validate());
        check(self.positioner_setup().validate());
        check(self.validate_scan());
        check(positive("laser.sweep_frequency_hz", self.laser.sweep_frequency_hz));
        check(self.validate_timings());
        check(self.validate_coefficients());

        if problems.is_empty() {
            Ok(())
        } else {
            Err(OctError::Configuration(problems.join("; ")))
        }
    }

    fn validate_scan(&self) -> OctResult<()> {
        let scan = &self.scan;
        for (name, value) in [("x0", scan.x0), ("y0", scan.y0), ("xf", scan.xf), ("yf", scan.yf)] {
            if !value.is_finite() {
                return Err(OctError::Configuration(format!(
                    "scan.{name} must be finite"
                )));
            }
        }
        positive("scan.density", scan.density)?;
        if scan.num_tomograms == 0 {
            return Err(OctError::Configuration(
                "scan.num_tomograms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    fn validate_timings(&self) -> OctResult<()> {
        let timings = &self.scheduler;
        for (name, value) in [
            ("poll_interval", timings.poll_interval),
            ("acquisition_timeout", timings.acquisition_timeout),
            ("positioner_timeout", timings.positioner_timeout),
            ("fetch_timeout", timings.fetch_timeout),
        ] {
            if value.is_zero() {
                return Err(OctError::Configuration(format!(
                    "scheduler.{name} must be non-zero"
                )));
            }
        }
        if timings.poll_interval > timings.acquisition_timeout {
            return Err(OctError::Configuration(
                "scheduler.poll_interval exceeds scheduler.acquisition_timeout".into(),
            ));
        }
        if timings.preview_queue_depth == 0 {
            return Err(OctError::Configuration(
                "scheduler.preview_queue_depth must be at least 1".into(),
            ));
        }
        if self.preview.target_len < 2 {
            return Err(OctError::Configuration(
                "preview.target_len must be at least 2".into(),
            ));
        }
        Ok(())
    }

    fn validate_coefficients(&self) -> OctResult<()> {
        let coefficients = self.coefficients()?;
        let samples = self.digitizer.horizontal.samples_per_record;
        if let Some(index) = coefficients.first_non_increasing(samples) {
            return Err(OctError::Configuration(format!(
                "calibration.coefficients do not increase over the record (sample {index})"
            )));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Typed views
    // -------------------------------------------------------------------------

    /// Scan corners.
    pub fn scan_bounds(&self) -> ScanBounds {
        ScanBounds {
            x0: self.scan.x0,
            y0: self.scan.y0,
            xf: self.scan.xf,
            yf: self.scan.yf,
        }
    }

    /// Single-line plan.
    pub fn scan_plan(&self) -> OctResult<ScanPlan> {
        ScanPlan::from_bounds(
            self.scan_bounds(),
            self.scan.density,
            self.laser.sweep_frequency_hz,
            self.scan.settle_samples,
        )
    }

    /// Volume plan over the same corners.
    pub fn volume_plan(&self) -> OctResult<ScanPlan> {
        ScanPlan::volume(
            self.scan_bounds(),
            self.scan.density,
            self.laser.sweep_frequency_hz,
            self.scan.num_tomograms,
        )
    }

    /// Digitizer records.
    pub fn digitizer_setup(&self) -> DigitizerSetup {
        let d = &self.digitizer;
        DigitizerSetup {
            horizontal: d.horizontal.clone(),
            trigger: d.trigger.clone(),
            vertical_reference: d.vertical_reference.clone(),
            vertical_sample: d.vertical_sample.clone(),
            export_signal: d.export_signal.clone(),
        }
    }

    /// Positioner records.
    pub fn positioner_setup(&self) -> PositionerSetup {
        let p = &self.positioner;
        PositionerSetup {
            x: p.x.clone(),
            y: p.y.clone(),
            volts_per_unit_x: p.volts_per_unit_x,
            volts_per_unit_y: p.volts_per_unit_y,
            positioning: p.positioning.clone(),
            scan_clock_source: p.scan_clock_source.clone(),
            max_speed: p.max_speed,
        }
    }

    /// Scheduler waits.
    pub fn wait_policies(&self) -> WaitPolicies {
        let t = &self.scheduler;
        WaitPolicies {
            acquisition: WaitPolicy::new(t.poll_interval, t.acquisition_timeout),
            positioner_timeout: t.positioner_timeout,
            fetch_timeout: t.fetch_timeout,
            max_acquisition_retries: t.max_acquisition_retries,
        }
    }

    /// Everything a [`Scheduler`](crate::scheduler::Scheduler) needs.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            digitizer: self.digitizer_setup(),
            positioner: self.positioner_setup(),
            waits: self.wait_policies(),
        }
    }

    /// Configured calibration polynomial.
    pub fn coefficients(&self) -> OctResult<CalibrationCoefficients> {
        CalibrationCoefficients::from_slice(&self.calibration.coefficients)
    }
}

fn non_empty(name: &str, value: &str) -> OctResult<()> {
    if value.trim().is_empty() {
        return Err(OctError::Configuration(format!("{name} must not be empty")));
    }
    Ok(())
}

fn positive(name: &str, value: f64) -> OctResult<()> {
    if !(value.is_finite() && value > 0.0) {
        return Err(OctError::Configuration(format!(
            "{name} must be positive, got {value}"
        )));
    }
    Ok(())
}
