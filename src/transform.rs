//! Magnitude spectrum of resampled records.

use ndarray::{Array2, ArrayView2};
use num_complex::Complex;
use oct_core::error::{OctError, OctResult};
use rustfft::FftPlanner;

/// Full-length DFT magnitude, `|X[k]|` for `k in 0..n`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrequencyTransform;

impl FrequencyTransform {
    /// New transform.
    pub fn new() -> Self {
        Self
    }

    /// Magnitude spectrum of one record.
    ///
    /// Works on raw samples as well, which gives the uncorrected spectrum.
    pub fn magnitude(&self, record: &[f64]) -> OctResult<Vec<f64>> {
        if record.is_empty() {
            return Err(OctError::invalid_shape("non-empty record", "0 samples"));
        }
        let fft = FftPlanner::<f64>::new().plan_fft_forward(record.len());
        let mut buffer: Vec<Complex<f64>> =
            record.iter().map(|&v| Complex::new(v, 0.0)).collect();
        fft.process(&mut buffer);
        Ok(buffer.iter().map(|c| c.norm()).collect())
    }

    /// Magnitude spectrum of every row.
    pub fn magnitude_rows(&self, records: ArrayView2<'_, f64>) -> OctResult<Array2<f64>> {
        let (rows, samples) = records.dim();
        if rows == 0 || samples == 0 {
            return Err(OctError::invalid_shape(
                "non-empty [record, sample] array",
                format!("{rows}x{samples}"),
            ));
        }
        let fft = FftPlanner::<f64>::new().plan_fft_forward(samples);
        let mut output = Array2::zeros((rows, samples));
        let mut buffer = vec![Complex::new(0.0, 0.0); samples];
        for (row, mut out) in records.outer_iter().zip(output.outer_iter_mut()) {
            for (slot, &v) in buffer.iter_mut().zip(row.iter()) {
                *slot = Complex::new(v, 0.0);
            }
            fft.process(&mut buffer);
            for (value, c) in out.iter_mut().zip(&buffer) {
                *value = c.norm();
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    #[test]
    fn cosine_peaks_at_its_bin() {
        let n = 256;
        let record: Vec<f64> = (0..n).map(|i| (2.0 * PI * 10.0 * i as f64 / n as f64).cos()).collect();
        let spectrum = FrequencyTransform::new().magnitude(&record).unwrap();
        assert_eq!(spectrum.len(), n);
        assert_abs_diff_eq!(spectrum[10], n as f64 / 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(spectrum[n - 10], n as f64 / 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(spectrum[3], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn dc_bin_is_the_sum() {
        let spectrum = FrequencyTransform::new().magnitude(&[1.0, 2.0, 3.0]).unwrap();
        assert_abs_diff_eq!(spectrum[0], 6.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_input_is_a_shape_error() {
        let transform = FrequencyTransform::new();
        assert!(matches!(
            transform.magnitude(&[]),
            Err(OctError::InvalidShape { .. })
        ));
        assert!(transform
            .magnitude_rows(Array2::<f64>::zeros((0, 4)).view())
            .is_err());
    }

    #[test]
    fn rows_match_single_records() {
        let transform = FrequencyTransform::new();
        let records = Array2::from_shape_fn((2, 16), |(r, s)| ((r + 1) * s) as f64);
        let rows = transform.magnitude_rows(records.view()).unwrap();
        for r in 0..2 {
            let single = transform.magnitude(&records.row(r).to_vec()).unwrap();
            for (a, b) in rows.row(r).iter().zip(&single) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
            }
        }
    }
}
