//! Scan parameter derivation.
//!
//! The digitizer record count is the source of truth: a sweep holds
//! `line(begin, end, density).len()` records, the positioner is clocked at the
//! laser sweep frequency, so each positioner sample spans exactly one record
//! and the scan time follows as `records / laser_sweep_frequency`.

use crate::path;
use ndarray::Array3;
use oct_core::data::{Point2, Trajectory};
use oct_core::error::{OctError, OctResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Rectangle corners of a scan, in stage units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanBounds {
    /// Start X.
    pub x0: f64,
    /// Start Y.
    pub y0: f64,
    /// End X.
    pub xf: f64,
    /// End Y.
    pub yf: f64,
}

impl ScanBounds {
    /// `(x0, y0)`.
    pub fn begin(&self) -> Point2 {
        Point2::new(self.x0, self.y0)
    }

    /// `(xf, yf)`.
    pub fn end(&self) -> Point2 {
        Point2::new(self.xf, self.yf)
    }

    /// Euclidean distance between the corners.
    pub fn length(&self) -> f64 {
        self.begin().distance(&self.end())
    }
}

/// Geometry of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanKind {
    /// One sweep from `(x0, y0)` to `(xf, yf)`.
    Line,
    /// `num_tomograms` sweeps of X at evenly spaced Y.
    Volume,
}

/// Derived parameters of one scan request.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    /// Scan geometry.
    pub kind: ScanKind,
    /// Corners.
    pub bounds: ScanBounds,
    /// Points per stage unit along a sweep.
    pub density: f64,
    /// Records (and positioner samples) per sweep.
    pub num_records: usize,
    /// Sweeps per scan; always 1 for [`ScanKind::Line`].
    pub num_tomograms: usize,
    /// Samples in each lead-in and lead-out ramp of a single line.
    pub settle_samples: usize,
    /// Laser A-line rate; also the positioner scan clock rate.
    pub laser_sweep_frequency: f64,
    /// Time to sweep one line.
    pub scan_time: Duration,
    /// Sweep velocity, stage units per second.
    pub velocity: Point2,
}

impl ScanPlan {
    /// Plan a single line from `(x0, y0)` to `(xf, yf)`.
    pub fn from_bounds(
        bounds: ScanBounds,
        density: f64,
        laser_sweep_frequency: f64,
        settle_samples: usize,
    ) -> OctResult<Self> {
        Self::build(
            ScanKind::Line,
            bounds,
            density,
            laser_sweep_frequency,
            1,
            settle_samples,
        )
    }

    /// Plan a raster volume of `num_tomograms` X sweeps.
    pub fn volume(
        bounds: ScanBounds,
        density: f64,
        laser_sweep_frequency: f64,
        num_tomograms: usize,
    ) -> OctResult<Self> {
        Self::build(
            ScanKind::Volume,
            bounds,
            density,
            laser_sweep_frequency,
            num_tomograms,
            0,
        )
    }

    fn build(
        kind: ScanKind,
        bounds: ScanBounds,
        density: f64,
        laser_sweep_frequency: f64,
        num_tomograms: usize,
        settle_samples: usize,
    ) -> OctResult<Self> {
        if !(laser_sweep_frequency.is_finite() && laser_sweep_frequency > 0.0) {
            return Err(OctError::Configuration(format!(
                "laser sweep frequency must be positive, got {laser_sweep_frequency}"
            )));
        }
        if num_tomograms == 0 {
            return Err(OctError::Configuration(
                "a scan needs at least one tomogram".into(),
            ));
        }
        let (begin, end) = sweep_endpoints(kind, &bounds);
        let num_records = path::line(begin, end, density)?.len();
        let seconds = num_records as f64 / laser_sweep_frequency;
        let velocity = Point2::new((end.x - begin.x) / seconds, (end.y - begin.y) / seconds);
        Ok(Self {
            kind,
            bounds,
            density,
            num_records,
            num_tomograms,
            settle_samples,
            laser_sweep_frequency,
            scan_time: Duration::from_secs_f64(seconds),
            velocity,
        })
    }

    /// First and last point of one sweep.
    pub fn sweep(&self) -> (Point2, Point2) {
        sweep_endpoints(self.kind, &self.bounds)
    }

    /// Magnitude of [`velocity`](Self::velocity).
    pub fn speed(&self) -> f64 {
        self.velocity.x.hypot(self.velocity.y)
    }

    /// Ramped single-line trajectory.
    pub fn line_trajectory(&self) -> OctResult<Trajectory> {
        let (begin, end) = self.sweep();
        path::ramped_line(begin, end, self.settle_samples, self.density)
    }

    /// Raster grid `[num_tomograms, num_records, 2]`.
    pub fn volume_grid(&self) -> OctResult<Array3<f64>> {
        path::scan_grid(
            self.bounds.x0,
            self.bounds.xf,
            self.bounds.y0,
            self.bounds.yf,
            self.num_records,
            self.num_tomograms,
        )
    }
}

fn sweep_endpoints(kind: ScanKind, bounds: &ScanBounds) -> (Point2, Point2) {
    match kind {
        ScanKind::Line => (bounds.begin(), bounds.end()),
        ScanKind::Volume => (bounds.begin(), Point2::new(bounds.xf, bounds.y0)),
    }
}
