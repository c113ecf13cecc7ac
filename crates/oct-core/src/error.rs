//! Error types shared by every oct_scan crate.
//!
//! Two layers exist:
//!
//! - **`DriverError`**: what a device trait method returns. It carries the
//!   driver name, a coarse [`DriverErrorKind`] and a message. Drivers know
//!   nothing about scan stages.
//! - **`OctError`**: the crate-wide error. Scheduler code wraps driver errors
//!   with the device and stage that failed so a fatal error can be reported
//!   as "which device, doing what".
//!
//! ## Taxonomy
//!
//! | Variant | Recovery |
//! |---------|----------|
//! | `Configuration`, `ConfigurationShape` | fatal, raised before any hardware action |
//! | `DeviceConfiguration` | fatal, session aborted with hardware stopped |
//! | `AcquisitionTimeout` | retried by the scheduler, then fatal |
//! | `PositionerTimeout` | fatal, independent of digitizer retries |
//! | `CalibrationDegenerate` | recoverable, surfaced to the caller |
//! | `InvalidShape` | caller error on processing input |
//! | `SessionBusy` | recoverable, retry once the other session ends |
//! | `ResourceLeak` | a device handle was not released on some exit path |

use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Driver Errors
// =============================================================================

/// Coarse classification of a driver failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device could not be opened or reset.
    Initialization,
    /// Device rejected a configuration value.
    Configuration,
    /// Transport to the device failed.
    Communication,
    /// Device reported a fault while running.
    Hardware,
    /// Device did not answer in time.
    Timeout,
    /// Argument outside the range the device accepts.
    InvalidParameter,
    /// Operation is not valid in the device's current state.
    InvalidState,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::InvalidState => "invalid_state",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Error returned by device trait methods.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver that raised the error (e.g. `"mock_digitizer"`).
    pub driver_type: String,
    /// Classification.
    pub kind: DriverErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl DriverError {
    /// Build a driver error.
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Result alias for device trait methods.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

// =============================================================================
// Application Errors
// =============================================================================

/// Convenience alias for results using the crate-wide error type.
pub type OctResult<T> = std::result::Result<T, OctError>;

/// Primary error type for scan acquisition and processing.
#[derive(Error, Debug)]
pub enum OctError {
    /// A configuration value is missing, malformed or logically invalid.
    ///
    /// Raised before any hardware action takes place.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A configured collection has the wrong number of elements.
    ///
    /// The typical case is a calibration table that does not hold exactly
    /// eight polynomial coefficients.
    #[error("Configuration shape error in {field}: expected {expected} values, found {actual}")]
    ConfigurationShape {
        /// Offending field.
        field: String,
        /// Required element count.
        expected: usize,
        /// Element count found.
        actual: usize,
    },

    /// The hardware rejected a configuration call.
    ///
    /// The session is aborted without retry and the positioner is left stopped.
    #[error("Device '{device}' rejected configuration during {stage}: {source}")]
    DeviceConfiguration {
        /// Device name.
        device: String,
        /// Scheduler stage that issued the call (e.g. `"horizontal timing"`).
        stage: String,
        /// Underlying driver error.
        #[source]
        source: DriverError,
    },

    /// A device failed outside of configuration (start, fetch, stop...).
    #[error("Device '{device}' failed during {stage}: {source}")]
    Device {
        /// Device name.
        device: String,
        /// Operation in progress.
        stage: String,
        /// Underlying driver error.
        #[source]
        source: DriverError,
    },

    /// The digitizer never reported completion.
    #[error("Acquisition on '{device}' timed out after {waited:?} ({attempts} attempt(s))")]
    AcquisitionTimeout {
        /// Digitizer name.
        device: String,
        /// Time waited on the final attempt.
        waited: Duration,
        /// Attempts made, including retries.
        attempts: u32,
    },

    /// The positioner did not report task completion in time.
    #[error("Positioner '{device}' task did not finish within {waited:?}")]
    PositionerTimeout {
        /// Positioner name.
        device: String,
        /// Time waited.
        waited: Duration,
    },

    /// The reference capture cannot produce a usable timing correction.
    ///
    /// Too few zero crossings, or a fit whose corrected abscissas are not
    /// strictly increasing. Nothing is persisted when this is raised.
    #[error("Calibration degenerate: {0}")]
    CalibrationDegenerate(String),

    /// Processing input does not have the required shape.
    #[error("Invalid shape: expected {expected}, found {actual}")]
    InvalidShape {
        /// Description of the accepted shape.
        expected: String,
        /// Description of what was supplied.
        actual: String,
    },

    /// Another session already owns the devices.
    #[error("Device session busy: another acquisition session holds the digitizer and positioner")]
    SessionBusy,

    /// A scheduler state change that the session model forbids.
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition {
        /// State before the change.
        from: String,
        /// Requested state.
        to: String,
    },

    /// A device handle was not released on some exit path.
    #[error("Resource leak on '{device}': {detail}")]
    ResourceLeak {
        /// Device name.
        device: String,
        /// What was left open.
        detail: String,
    },

    /// A scan was cancelled before any data was produced.
    #[error("Scan cancelled")]
    Cancelled,

    /// Persisted calibration data could not be read or written.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OctError {
    /// Wrap a driver error raised while configuring a device.
    pub fn device_configuration(
        device: impl Into<String>,
        stage: impl Into<String>,
        source: DriverError,
    ) -> Self {
        Self::DeviceConfiguration {
            device: device.into(),
            stage: stage.into(),
            source,
        }
    }

    /// Wrap a driver error raised while operating a device.
    pub fn device(device: impl Into<String>, stage: impl Into<String>, source: DriverError) -> Self {
        Self::Device {
            device: device.into(),
            stage: stage.into(),
            source,
        }
    }

    /// Build an [`OctError::InvalidShape`].
    pub fn invalid_shape(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::InvalidShape {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether the caller may reasonably retry or adjust and continue.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OctError::CalibrationDegenerate(_) | OctError::SessionBusy | OctError::Cancelled
        )
    }

    /// Name of the device involved, when the error concerns one.
    pub fn failing_device(&self) -> Option<&str> {
        match self {
            OctError::DeviceConfiguration { device, .. }
            | OctError::Device { device, .. }
            | OctError::AcquisitionTimeout { device, .. }
            | OctError::PositionerTimeout { device, .. }
            | OctError::ResourceLeak { device, .. } => Some(device),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_display_names_driver_and_kind() {
        let err = DriverError::new("mock_digitizer", DriverErrorKind::Timeout, "no trigger");
        assert_eq!(
            err.to_string(),
            "Driver 'mock_digitizer' timeout error: no trigger"
        );
    }

    #[test]
    fn device_configuration_reports_device_and_stage() {
        let err = OctError::device_configuration(
            "scope0",
            "trigger",
            DriverError::new("mock_digitizer", DriverErrorKind::Configuration, "bad level"),
        );
        let msg = err.to_string();
        assert!(msg.contains("scope0"));
        assert!(msg.contains("trigger"));
        assert_eq!(err.failing_device(), Some("scope0"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn degenerate_calibration_is_recoverable() {
        let err = OctError::CalibrationDegenerate("3 crossings".into());
        assert!(err.is_recoverable());
        assert_eq!(err.failing_device(), None);
    }

    #[test]
    fn shape_error_lists_counts() {
        let err = OctError::ConfigurationShape {
            field: "calibration.coefficients".into(),
            expected: 8,
            actual: 7,
        };
        assert!(err.to_string().contains("expected 8 values, found 7"));
    }
}
