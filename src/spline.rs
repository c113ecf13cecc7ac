//! Natural cubic spline interpolation.
//!
//! Piecewise cubics `S(x) = a + b(x-xi) + c(x-xi)^2 + d(x-xi)^3` with zero
//! second derivative at both ends. Construction solves the tridiagonal
//! system for the `c` coefficients with the Thomas algorithm.

use oct_core::error::{OctError, OctResult};
use std::cmp::Ordering;

/// Interpolating natural cubic spline.
#[derive(Debug, Clone)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// `[a, b, c, d]` per segment.
    coeffs: Vec<[f64; 4]>,
}

impl CubicSpline {
    /// Fit a spline through `(x[i], y[i])`.
    ///
    /// # Errors
    /// - [`OctError::InvalidShape`] if the lengths differ or fewer than two
    ///   points are given.
    /// - [`OctError::CalibrationDegenerate`] if `x` holds non-finite values
    ///   or is not strictly increasing.
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> OctResult<Self> {
        if x.len() != y.len() {
            return Err(OctError::invalid_shape(
                format!("{} ordinates", x.len()),
                format!("{} ordinates", y.len()),
            ));
        }
        if x.len() < 2 {
            return Err(OctError::invalid_shape(
                "at least 2 spline knots",
                format!("{} knot(s)", x.len()),
            ));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(OctError::CalibrationDegenerate(
                "spline abscissas must be finite".into(),
            ));
        }
        let non_increasing = (1..x.len()).find(|&i| x[i].partial_cmp(&x[i - 1]) != Some(Ordering::Greater));
        if let Some(i) = non_increasing {
            return Err(OctError::CalibrationDegenerate(format!(
                "spline abscissas are not strictly increasing at index {i} ({} -> {})",
                x[i - 1],
                x[i]
            )));
        }

        let coeffs = natural_coefficients(&x, &y);
        Ok(Self { x, y, coeffs })
    }

    /// Value at `x`. Outside the knot range the boundary value is returned.
    pub fn evaluate(&self, x: f64) -> f64 {
        let last = self.x.len() - 1;
        if x <= self.x[0] {
            return self.y[0];
        }
        if x >= self.x[last] {
            return self.y[last];
        }

        let segment = self.find_segment(x);
        let dx = x - self.x[segment];
        let [a, b, c, d] = self.coeffs[segment];
        a + dx * (b + dx * (c + dx * d))
    }

    /// Evaluate at every point of `xs`.
    pub fn evaluate_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.evaluate(x)).collect()
    }

    /// First and last knot.
    pub fn domain(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }

    // Binary search for the left knot of the segment holding `x`.
    fn find_segment(&self, x: f64) -> usize {
        let mut left = 0;
        let mut right = self.x.len() - 1;
        while left < right - 1 {
            let mid = (left + right) / 2;
            if x < self.x[mid] {
                right = mid;
            } else {
                left = mid;
            }
        }
        left
    }
}

fn natural_coefficients(x: &[f64], y: &[f64]) -> Vec<[f64; 4]> {
    let n = x.len();
    let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();

    let mut alpha = vec![0.0; n - 1];
    for i in 1..n - 1 {
        alpha[i] = (3.0 / h[i]) * (y[i + 1] - y[i]) - (3.0 / h[i - 1]) * (y[i] - y[i - 1]);
    }

    let mut l = vec![1.0; n];
    let mut mu = vec![0.0; n];
    let mut z = vec![0.0; n];
    for i in 1..n - 1 {
        l[i] = 2.0 * (x[i + 1] - x[i - 1]) - h[i - 1] * mu[i - 1];
        mu[i] = h[i] / l[i];
        z[i] = (alpha[i] - h[i - 1] * z[i - 1]) / l[i];
    }

    let mut c = vec![0.0; n];
    let mut coeffs = vec![[0.0; 4]; n - 1];
    for j in (0..n - 1).rev() {
        c[j] = z[j] - mu[j] * c[j + 1];
        let b = (y[j + 1] - y[j]) / h[j] - h[j] * (c[j + 1] + 2.0 * c[j]) / 3.0;
        let d = (c[j + 1] - c[j]) / (3.0 * h[j]);
        coeffs[j] = [y[j], b, c[j], d];
    }
    coeffs
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn passes_through_knots() {
        let x = vec![0.0, 1.0, 2.0, 3.0];
        let y = vec![0.0, 1.0, 4.0, 9.0];
        let spline = CubicSpline::new(x.clone(), y.clone()).unwrap();
        for (xi, yi) in x.iter().zip(&y) {
            assert_abs_diff_eq!(spline.evaluate(*xi), *yi, epsilon = 1e-12);
        }
    }

    #[test]
    fn linear_data_stays_linear() {
        let x: Vec<f64> = (0..10).map(|i| i as f64 * 0.7).collect();
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v - 1.0).collect();
        let spline = CubicSpline::new(x, y).unwrap();
        for t in [0.1, 1.33, 4.0, 6.2] {
            assert_abs_diff_eq!(spline.evaluate(t), 2.0 * t - 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn smooth_function_is_close_between_knots() {
        let x: Vec<f64> = (0..=40).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|v| v.sin()).collect();
        let spline = CubicSpline::new(x, y).unwrap();
        for t in [0.55, 1.234, 2.5, 3.33] {
            assert_abs_diff_eq!(spline.evaluate(t), f64::sin(t), epsilon = 1e-4);
        }
    }

    #[test]
    fn clamps_outside_domain() {
        let spline = CubicSpline::new(vec![0.0, 1.0, 2.0], vec![5.0, 6.0, 7.0]).unwrap();
        assert_eq!(spline.evaluate(-3.0), 5.0);
        assert_eq!(spline.evaluate(9.0), 7.0);
        assert_eq!(spline.domain(), (0.0, 2.0));
    }

    #[test]
    fn rejects_non_increasing_abscissas() {
        let err = CubicSpline::new(vec![0.0, 2.0, 1.0], vec![0.0; 3]).unwrap_err();
        assert!(matches!(err, OctError::CalibrationDegenerate(_)));
        let err = CubicSpline::new(vec![0.0, 1.0, 1.0], vec![0.0; 3]).unwrap_err();
        assert!(matches!(err, OctError::CalibrationDegenerate(_)));
    }

    #[test]
    fn rejects_short_or_mismatched_input() {
        assert!(matches!(
            CubicSpline::new(vec![0.0], vec![0.0]),
            Err(OctError::InvalidShape { .. })
        ));
        assert!(matches!(
            CubicSpline::new(vec![0.0, 1.0], vec![0.0]),
            Err(OctError::InvalidShape { .. })
        ));
    }
}
