//! Clock calibration from a reference interferometer capture.
//!
//! The reference channel carries a fringe whose zero crossings are evenly
//! spaced in wavenumber but unevenly spaced in sample index, because the
//! laser sweep is nonlinear. Fitting crossing index against an evenly spaced
//! target gives a degree-7 polynomial mapping sample index to corrected
//! position, which the [`Resampler`](crate::resample::Resampler) consumes.
//!
//! Coefficients are persisted only after the fit validates: a capture that
//! yields too few crossings or a non-monotonic mapping is reported as
//! [`OctError::CalibrationDegenerate`] and nothing is written.

use crate::path::linspace;
use crate::scheduler::{Scheduler, Session};
use nalgebra::{DMatrix, DVector};
use oct_core::error::{OctError, OctResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Coefficients in a calibration polynomial.
pub const COEFFICIENT_COUNT: usize = 8;

/// Fewest zero crossings a degree-7 fit accepts.
pub const MIN_CROSSINGS: usize = COEFFICIENT_COUNT;

// =============================================================================
// Coefficients
// =============================================================================

/// Degree-7 polynomial coefficients, highest degree first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct CalibrationCoefficients([f64; COEFFICIENT_COUNT]);

impl CalibrationCoefficients {
    /// Validate the count and wrap.
    pub fn from_slice(values: &[f64]) -> OctResult<Self> {
        let array: [f64; COEFFICIENT_COUNT] =
            values.try_into().map_err(|_| OctError::ConfigurationShape {
                field: "calibration.coefficients".into(),
                expected: COEFFICIENT_COUNT,
                actual: values.len(),
            })?;
        if array.iter().any(|c| !c.is_finite()) {
            return Err(OctError::Configuration(
                "calibration coefficients must be finite".into(),
            ));
        }
        Ok(Self(array))
    }

    /// `f(x) = x`.
    pub const fn identity() -> Self {
        Self([0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0])
    }

    /// Coefficients, highest degree first.
    pub fn values(&self) -> &[f64; COEFFICIENT_COUNT] {
        &self.0
    }

    /// Evaluate at `x` (Horner).
    pub fn evaluate(&self, x: f64) -> f64 {
        self.0.iter().fold(0.0, |acc, c| acc * x + c)
    }

    /// Corrected abscissa of every sample index in `0..samples`.
    pub fn abscissas(&self, samples: usize) -> Vec<f64> {
        (0..samples).map(|i| self.evaluate(i as f64)).collect()
    }

    /// First index in `0..samples` where the mapping stops increasing.
    pub fn first_non_increasing(&self, samples: usize) -> Option<usize> {
        let xs = self.abscissas(samples);
        (1..xs.len()).find(|&i| xs[i].partial_cmp(&xs[i - 1]) != Some(Ordering::Greater))
    }
}

impl Default for CalibrationCoefficients {
    fn default() -> Self {
        Self::identity()
    }
}

impl TryFrom<Vec<f64>> for CalibrationCoefficients {
    type Error = OctError;

    fn try_from(values: Vec<f64>) -> OctResult<Self> {
        Self::from_slice(&values)
    }
}

impl From<CalibrationCoefficients> for Vec<f64> {
    fn from(coefficients: CalibrationCoefficients) -> Self {
        coefficients.0.to_vec()
    }
}

// =============================================================================
// Zero crossings and fitting
// =============================================================================

/// Indices `i >= 1` where the sign of `signal` differs from sample `i - 1`.
///
/// A sample counts as positive when strictly greater than zero.
pub fn zero_crossings(signal: &[f64]) -> Vec<usize> {
    signal
        .windows(2)
        .enumerate()
        .filter(|(_, w)| (w[0] > 0.0) != (w[1] > 0.0))
        .map(|(i, _)| i + 1)
        .collect()
}

/// Result of a successful fit.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    /// Fitted polynomial.
    pub coefficients: CalibrationCoefficients,
    /// Crossing indices used for the fit.
    pub crossings: Vec<usize>,
    /// RMS of the fit residual at the crossings.
    pub residual_rms: f64,
}

/// Fit crossing index to evenly spaced targets spanning `0..=last crossing`.
///
/// The fit runs on `u = x / last` for conditioning and the coefficients are
/// rescaled afterwards. The result must increase strictly over
/// `0..samples`, otherwise the calibration is degenerate.
pub fn fit_coefficients(crossings: &[usize], samples: usize) -> OctResult<Calibration> {
    if crossings.len() < MIN_CROSSINGS {
        return Err(OctError::CalibrationDegenerate(format!(
            "found {} zero crossing(s), need at least {MIN_CROSSINGS}",
            crossings.len()
        )));
    }
    let count = crossings.len();
    let last = crossings[count - 1] as f64;
    let target = linspace(0.0, last, count);
    let scale = last.max(1.0);

    let degree = COEFFICIENT_COUNT - 1;
    let design = DMatrix::from_fn(count, COEFFICIENT_COUNT, |row, col| {
        (crossings[row] as f64 / scale).powi((degree - col) as i32)
    });
    let rhs = DVector::from_column_slice(&target);
    let scaled = design
        .svd(true, true)
        .solve(&rhs, 1e-12)
        .map_err(|e| OctError::CalibrationDegenerate(format!("least-squares fit failed: {e}")))?;

    let mut values = [0.0; COEFFICIENT_COUNT];
    for (col, value) in values.iter_mut().enumerate() {
        *value = scaled[col] / scale.powi((degree - col) as i32);
    }
    let coefficients = CalibrationCoefficients::from_slice(&values)
        .map_err(|e| OctError::CalibrationDegenerate(e.to_string()))?;

    if let Some(index) = coefficients.first_non_increasing(samples) {
        return Err(OctError::CalibrationDegenerate(format!(
            "fitted mapping is not strictly increasing at sample {index} of {samples}"
        )));
    }

    let residual_rms = (crossings
        .iter()
        .zip(&target)
        .map(|(&x, &t)| (coefficients.evaluate(x as f64) - t).powi(2))
        .sum::<f64>()
        / count as f64)
        .sqrt();

    Ok(Calibration {
        coefficients,
        crossings: crossings.to_vec(),
        residual_rms,
    })
}

/// Detect crossings on `reference` and fit.
pub fn calibrate(reference: &[f64]) -> OctResult<Calibration> {
    let crossings = zero_crossings(reference);
    debug!(crossings = crossings.len(), samples = reference.len(), "zero crossings detected");
    fit_coefficients(&crossings, reference.len())
}

// =============================================================================
// Capture persistence
// =============================================================================

/// One record of the reference and sample channels.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceCapture {
    /// Reference interferometer channel.
    pub reference: Vec<f64>,
    /// Detector channel.
    pub sample: Vec<f64>,
}

impl ReferenceCapture {
    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.reference.len()
    }

    /// Whether the capture is empty.
    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }
}

/// Write `capture` as a two-column `reference sample` table, one row per sample.
pub fn save_capture(path: impl AsRef<Path>, capture: &ReferenceCapture) -> OctResult<()> {
    if capture.reference.len() != capture.sample.len() {
        return Err(OctError::invalid_shape(
            format!("{} sample values", capture.reference.len()),
            format!("{} sample values", capture.sample.len()),
        ));
    }
    let mut table = String::with_capacity(capture.len() * 52);
    for (r, s) in capture.reference.iter().zip(&capture.sample) {
        // Infallible for String.
        let _ = writeln!(table, "{r:.18e} {s:.18e}");
    }
    write_atomically(path.as_ref(), table.as_bytes())
}

/// Read a table written by [`save_capture`].
pub fn load_capture(path: impl AsRef<Path>) -> OctResult<ReferenceCapture> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let mut capture = ReferenceCapture::default();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(OctError::Persistence(format!(
                "{}:{}: expected 2 columns, found {}",
                path.display(),
                number + 1,
                fields.len()
            )));
        }
        let parse = |field: &str| {
            field.parse::<f64>().map_err(|e| {
                OctError::Persistence(format!(
                    "{}:{}: invalid number '{field}': {e}",
                    path.display(),
                    number + 1
                ))
            })
        };
        capture.reference.push(parse(fields[0])?);
        capture.sample.push(parse(fields[1])?);
    }
    Ok(capture)
}

// =============================================================================
// Coefficient persistence and sharing
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct CoefficientFile {
    coefficients: CalibrationCoefficients,
}

/// Write `coefficients` as TOML (`coefficients = [...]`).
pub fn save_coefficients(
    path: impl AsRef<Path>,
    coefficients: &CalibrationCoefficients,
) -> OctResult<()> {
    let text = toml::to_string(&CoefficientFile {
        coefficients: *coefficients,
    })
    .map_err(|e| OctError::Persistence(format!("cannot encode coefficients: {e}")))?;
    write_atomically(path.as_ref(), text.as_bytes())
}

/// Read coefficients written by [`save_coefficients`].
///
/// A table with other than eight values is a
/// [`OctError::ConfigurationShape`] error.
pub fn load_coefficients(path: impl AsRef<Path>) -> OctResult<CalibrationCoefficients> {
    #[derive(Deserialize)]
    struct RawFile {
        coefficients: Vec<f64>,
    }
    let path = path.as_ref();
    let text = fs::read_to_string(path)?;
    let raw: RawFile = toml::from_str(&text)
        .map_err(|e| OctError::Persistence(format!("{}: {e}", path.display())))?;
    CalibrationCoefficients::from_slice(&raw.coefficients)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> OctResult<()> {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    let staging = PathBuf::from(staging);
    fs::write(&staging, bytes)?;
    if let Err(e) = fs::rename(&staging, path) {
        if let Err(cleanup) = fs::remove_file(&staging) {
            warn!(path = %staging.display(), error = %cleanup, "staging file left behind");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Coefficients shared between resample calls and the calibration run.
///
/// Readers take a copy; a replacement needs a [`Session`], so it can only
/// happen while the devices are exclusively held and no scan is running.
#[derive(Debug, Clone, Default)]
pub struct CoefficientStore {
    inner: Arc<RwLock<CalibrationCoefficients>>,
}

impl CoefficientStore {
    /// Store holding `coefficients`.
    pub fn new(coefficients: CalibrationCoefficients) -> Self {
        Self {
            inner: Arc::new(RwLock::new(coefficients)),
        }
    }

    /// Current coefficients.
    pub fn current(&self) -> CalibrationCoefficients {
        *self.inner.read()
    }

    /// Install new coefficients.
    pub fn replace(&self, _session: &Session, coefficients: CalibrationCoefficients) {
        *self.inner.write() = coefficients;
    }

    /// Store initialized from a coefficients file.
    pub fn load(path: impl AsRef<Path>) -> OctResult<Self> {
        Ok(Self::new(load_coefficients(path)?))
    }

    /// Persist the current coefficients.
    pub fn save(&self, path: impl AsRef<Path>) -> OctResult<()> {
        save_coefficients(path, &self.current())
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Capture, fit, persist and publish a new calibration.
#[derive(Debug, Clone, Default)]
pub struct CalibrationEngine {
    store: CoefficientStore,
    capture_path: Option<PathBuf>,
    coefficients_path: Option<PathBuf>,
}

impl CalibrationEngine {
    /// Engine publishing into `store`.
    pub fn new(store: CoefficientStore) -> Self {
        Self {
            store,
            capture_path: None,
            coefficients_path: None,
        }
    }

    /// Also write the raw capture table here.
    pub fn with_capture_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.capture_path = Some(path.into());
        self
    }

    /// Also persist accepted coefficients here.
    pub fn with_coefficients_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.coefficients_path = Some(path.into());
        self
    }

    /// Shared store.
    pub fn store(&self) -> &CoefficientStore {
        &self.store
    }

    /// Capture a reference record with the positioner idle and derive new
    /// coefficients from it.
    #[instrument(skip_all, name = "calibration")]
    pub async fn run(&self, scheduler: &Scheduler) -> OctResult<Calibration> {
        let mut session = scheduler.begin_session()?;
        let capture = scheduler.capture_reference(&mut session).await?;
        if let Some(path) = &self.capture_path {
            save_capture(path, &capture)?;
            debug!(path = %path.display(), "reference capture saved");
        }
        self.apply(&session, &capture)
    }

    /// Fit `capture` and publish the result, persisting it first when a
    /// coefficients path is set.
    pub fn apply(&self, session: &Session, capture: &ReferenceCapture) -> OctResult<Calibration> {
        let calibration = calibrate(&capture.reference)?;
        if let Some(path) = &self.coefficients_path {
            save_coefficients(path, &calibration.coefficients)?;
        }
        self.store.replace(session, calibration.coefficients);
        info!(
            crossings = calibration.crossings.len(),
            residual_rms = calibration.residual_rms,
            "calibration accepted"
        );
        Ok(calibration)
    }
}
