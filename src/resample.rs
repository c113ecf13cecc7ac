//! Resampling from the nonlinear acquisition clock onto a uniform grid.
//!
//! The calibration polynomial maps each sample index to its corrected
//! abscissa. A natural cubic spline through `(abscissa, sample)` is then
//! evaluated on `target_len` evenly spaced points spanning the corrected
//! range `[f(0), f(n - 1)]`.

use crate::calibration::{CalibrationCoefficients, COEFFICIENT_COUNT};
use crate::path::linspace;
use crate::spline::CubicSpline;
use ndarray::{Array2, Array3, ArrayD, ArrayView2, ArrayViewD, Axis, Ix1, Ix2};
use oct_core::error::{OctError, OctResult};

/// Default length of a resampled record.
pub const DEFAULT_TARGET_LEN: usize = 1024;

/// Applies a calibration to raw records.
#[derive(Debug, Clone, PartialEq)]
pub struct Resampler {
    coefficients: CalibrationCoefficients,
    target_len: usize,
}

impl Resampler {
    /// Resampler from raw coefficients, highest degree first.
    ///
    /// Anything other than exactly eight values is a
    /// [`OctError::ConfigurationShape`] error.
    pub fn new(coefficients: &[f64]) -> OctResult<Self> {
        if coefficients.len() != COEFFICIENT_COUNT {
            return Err(OctError::ConfigurationShape {
                field: "resampler coefficients".into(),
                expected: COEFFICIENT_COUNT,
                actual: coefficients.len(),
            });
        }
        Ok(Self::from_coefficients(CalibrationCoefficients::from_slice(
            coefficients,
        )?))
    }

    /// Resampler from validated coefficients.
    pub fn from_coefficients(coefficients: CalibrationCoefficients) -> Self {
        Self {
            coefficients,
            target_len: DEFAULT_TARGET_LEN,
        }
    }

    /// Change the output length.
    pub fn with_target_len(mut self, target_len: usize) -> OctResult<Self> {
        if target_len < 2 {
            return Err(OctError::Configuration(format!(
                "resample target length must be at least 2, got {target_len}"
            )));
        }
        self.target_len = target_len;
        Ok(self)
    }

    /// Output length per record.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// Coefficients in use.
    pub fn coefficients(&self) -> &CalibrationCoefficients {
        &self.coefficients
    }

    /// Corrected abscissas for `samples` raw samples and the uniform grid over them.
    ///
    /// # Errors
    /// [`OctError::CalibrationDegenerate`] when the abscissas are not
    /// strictly increasing.
    pub fn grid(&self, samples: usize) -> OctResult<(Vec<f64>, Vec<f64>)> {
        if samples < 2 {
            return Err(OctError::invalid_shape(
                "at least 2 samples per record",
                format!("{samples} sample(s)"),
            ));
        }
        let abscissas = self.coefficients.abscissas(samples);
        if let Some(index) = self.coefficients.first_non_increasing(samples) {
            return Err(OctError::CalibrationDegenerate(format!(
                "corrected abscissas are not strictly increasing at sample {index}"
            )));
        }
        let uniform = linspace(abscissas[0], abscissas[samples - 1], self.target_len);
        Ok((abscissas, uniform))
    }

    /// Resample one record.
    pub fn resample_trace(&self, trace: &[f64]) -> OctResult<Vec<f64>> {
        let (abscissas, uniform) = self.grid(trace.len())?;
        let spline = CubicSpline::new(abscissas, trace.to_vec())?;
        Ok(spline.evaluate_many(&uniform))
    }

    /// Resample every row of `records` (`[record, sample]`).
    pub fn resample_records(&self, records: ArrayView2<'_, f64>) -> OctResult<Array2<f64>> {
        let (rows, samples) = records.dim();
        let (abscissas, uniform) = self.grid(samples)?;
        let mut output = Array2::zeros((rows, self.target_len));
        for (row, mut out) in records.outer_iter().zip(output.outer_iter_mut()) {
            let spline = CubicSpline::new(abscissas.clone(), row.to_vec())?;
            for (value, x) in out.iter_mut().zip(&uniform) {
                *value = spline.evaluate(*x);
            }
        }
        Ok(output)
    }

    /// Resample a single trace (one axis) or a record stack (two axes).
    ///
    /// Three-axis input is rejected: reduce it with [`representative_slice`]
    /// first.
    pub fn resample(&self, input: ArrayViewD<'_, f64>) -> OctResult<ArrayD<f64>> {
        match input.ndim() {
            1 => {
                let trace = input
                    .into_dimensionality::<Ix1>()
                    .map_err(|e| OctError::invalid_shape("1 axis", e.to_string()))?;
                let resampled = self.resample_trace(&trace.to_vec())?;
                Ok(ndarray::Array1::from(resampled).into_dyn())
            }
            2 => {
                let records = input
                    .into_dimensionality::<Ix2>()
                    .map_err(|e| OctError::invalid_shape("2 axes", e.to_string()))?;
                Ok(self.resample_records(records)?.into_dyn())
            }
            n => Err(OctError::invalid_shape(
                "1 or 2 axes (select a tomogram with representative_slice)",
                format!("{n} axes {:?}", input.shape()),
            )),
        }
    }
}

/// Tomogram `index` of a `[tomogram, record, sample]` tensor.
pub fn representative_slice(tensor: &Array3<f64>, index: usize) -> OctResult<ArrayView2<'_, f64>> {
    let tomograms = tensor.len_of(Axis(0));
    if index >= tomograms {
        return Err(OctError::invalid_shape(
            format!("tomogram index < {tomograms}"),
            index.to_string(),
        ));
    }
    Ok(tensor.index_axis(Axis(0), index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    #[test]
    fn coefficient_count_is_enforced() {
        assert!(matches!(
            Resampler::new(&[1.0, 0.0]),
            Err(OctError::ConfigurationShape {
                expected: 8,
                actual: 2,
                ..
            })
        ));
        assert!(Resampler::new(&[0.0; 9]).is_err());
    }

    #[test]
    fn warped_clock_round_trip() {
        let a = 2.0e-4;
        let n = 1200;
        let period = 40.0;
        let signal = |u: f64| (2.0 * std::f64::consts::PI * u / period).sin();
        let resampler = Resampler::new(&[0.0, 0.0, 0.0, 0.0, 0.0, a, 1.0, 0.0]).unwrap();

        let raw: Vec<f64> = (0..n)
            .map(|i| {
                let i = i as f64;
                signal(i + a * i * i)
            })
            .collect();
        let resampled = resampler.resample_trace(&raw).unwrap();
        assert_eq!(resampled.len(), DEFAULT_TARGET_LEN);

        let last = (n - 1) as f64;
        let truth: Vec<f64> = linspace(0.0, last + a * last * last, DEFAULT_TARGET_LEN)
            .into_iter()
            .map(signal)
            .collect();
        for k in 16..DEFAULT_TARGET_LEN - 16 {
            assert_abs_diff_eq!(resampled[k], truth[k], epsilon = 1e-3);
        }
        for k in 0..DEFAULT_TARGET_LEN {
            assert_abs_diff_eq!(resampled[k], truth[k], epsilon = 1e-2);
        }
    }

    #[test]
    fn identity_is_linear_interpolation_on_a_ramp() {
        let resampler = Resampler::from_coefficients(CalibrationCoefficients::identity())
            .with_target_len(50)
            .unwrap();
        let ramp: Vec<f64> = (0..20).map(|i| 3.0 + 0.5 * i as f64).collect();
        let resampled = resampler.resample_trace(&ramp).unwrap();
        for (x, value) in linspace(0.0, 19.0, 50).into_iter().zip(&resampled) {
            assert_abs_diff_eq!(*value, 3.0 + 0.5 * x, epsilon = 1e-9);
        }
    }

    #[test]
    fn decreasing_mapping_is_degenerate() {
        let resampler = Resampler::new(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0, 0.0]).unwrap();
        let err = resampler.resample_trace(&[0.0; 16]).unwrap_err();
        assert!(matches!(err, OctError::CalibrationDegenerate(_)));
    }

    #[test]
    fn records_are_resampled_independently() {
        let resampler = Resampler::from_coefficients(CalibrationCoefficients::identity())
            .with_target_len(8)
            .unwrap();
        let records = Array2::from_shape_fn((3, 8), |(r, s)| (r * 10 + s) as f64);
        let output = resampler.resample_records(records.view()).unwrap();
        assert_eq!(output.dim(), (3, 8));
        for r in 0..3 {
            for s in 0..8 {
                assert_abs_diff_eq!(output[[r, s]], records[[r, s]], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn three_axes_are_rejected() {
        let resampler = Resampler::from_coefficients(CalibrationCoefficients::identity());
        let tensor = Array3::<f64>::zeros((2, 3, 16));
        assert!(matches!(
            resampler.resample(tensor.view().into_dyn()),
            Err(OctError::InvalidShape { .. })
        ));

        let slice = representative_slice(&tensor, 1).unwrap();
        assert_eq!(slice.dim(), (3, 16));
        let output = resampler.resample(slice.into_dyn()).unwrap();
        assert_eq!(output.shape(), &[3, DEFAULT_TARGET_LEN]);
        assert!(representative_slice(&tensor, 2).is_err());
    }

    #[test]
    fn one_axis_dispatch() {
        let resampler = Resampler::from_coefficients(CalibrationCoefficients::identity())
            .with_target_len(4)
            .unwrap();
        let trace = Array1::from(vec![0.0, 1.0, 2.0, 3.0]);
        let output = resampler.resample(trace.view().into_dyn()).unwrap();
        assert_eq!(output.shape(), &[4]);
    }
}
