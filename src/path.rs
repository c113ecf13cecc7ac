//! Trajectory synthesis for the positioner.
//!
//! Time is measured in positioner samples throughout: a scan line of `N`
//! intervals occupies samples `0..=N`, its lead-in occupies `-S..0` and its
//! lead-out `N+1..=N+S`, where `S` is the settle length.
//!
//! Every junction between segments is C1 continuous. Ramps are cubics that
//! match position and velocity at both ends, which keeps the galvanometers
//! from being kicked into resonance by a velocity step.

use nalgebra::{Matrix4, Vector4};
use ndarray::Array3;
use oct_core::data::{Point2, SegmentRole, Trajectory, TrajectoryPoint};
use oct_core::error::{OctError, OctResult};

/// Position the stage rests at before and after a ramped line.
pub const REST: Point2 = Point2::ORIGIN;

/// `n` evenly spaced values from `start` to `end` inclusive.
///
/// The last value is exactly `end`; a single value is `start`.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Evenly spaced points from `begin` to `end` inclusive.
///
/// The segment is split into `ceil(length * density)` equal intervals, so the
/// spacing never exceeds `1 / density`. A zero-length segment yields the single
/// point `begin`.
pub fn line(begin: Point2, end: Point2, density: f64) -> OctResult<Vec<Point2>> {
    if !(density.is_finite() && density > 0.0) {
        return Err(OctError::Configuration(format!(
            "scan density must be positive, got {density}"
        )));
    }
    let length = begin.distance(&end);
    if !length.is_finite() {
        return Err(OctError::Configuration(
            "scan line endpoints must be finite".into(),
        ));
    }
    if length == 0.0 {
        return Ok(vec![begin]);
    }
    let intervals = (length * density).ceil().max(1.0) as usize;
    Ok((0..=intervals)
        .map(|i| {
            if i == intervals {
                end
            } else {
                begin.lerp(&end, i as f64 / intervals as f64)
            }
        })
        .collect())
}

// =============================================================================
// Cubic transitions
// =============================================================================

/// Cubic through `(t1, x1)` and `(t2, x2)` with slopes `r1` and `r2`.
///
/// Coefficients are held in the local variable `tau = t - t1`, which keeps
/// the 4x4 monomial system well conditioned far from `t = 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CubicTransition {
    /// `[c0, c1, c2, c3]` of `c0 + c1*tau + c2*tau^2 + c3*tau^3`.
    coefficients: [f64; 4],
    t1: f64,
    t2: f64,
}

impl CubicTransition {
    /// Solve for the unique cubic matching both endpoint positions and slopes.
    pub fn solve(x1: f64, x2: f64, t1: f64, t2: f64, r1: f64, r2: f64) -> OctResult<Self> {
        if ![x1, x2, t1, t2, r1, r2].iter().all(|v| v.is_finite()) {
            return Err(OctError::Configuration(
                "transition parameters must be finite".into(),
            ));
        }
        if t1 == t2 {
            return Err(OctError::Configuration(format!(
                "transition needs distinct endpoints, got t1 = t2 = {t1}"
            )));
        }
        let h = t2 - t1;
        #[rustfmt::skip]
        let system = Matrix4::new(
            1.0, 0.0, 0.0,     0.0,
            0.0, 1.0, 0.0,     0.0,
            1.0, h,   h * h,   h * h * h,
            0.0, 1.0, 2.0 * h, 3.0 * h * h,
        );
        let rhs = Vector4::new(x1, r1, x2, r2);
        let solution = system.lu().solve(&rhs).ok_or_else(|| {
            OctError::Configuration(format!("transition system over [{t1}, {t2}] is singular"))
        })?;
        Ok(Self {
            coefficients: [solution[0], solution[1], solution[2], solution[3]],
            t1,
            t2,
        })
    }

    /// Rest-to-rest move from `from` at `t1` to `to` at `t2`.
    pub fn rest_to_rest(from: f64, to: f64, t1: f64, t2: f64) -> OctResult<Self> {
        Self::solve(from, to, t1, t2, 0.0, 0.0)
    }

    /// Position at `t`.
    pub fn position(&self, t: f64) -> f64 {
        let tau = t - self.t1;
        let [c0, c1, c2, c3] = self.coefficients;
        c0 + tau * (c1 + tau * (c2 + tau * c3))
    }

    /// First derivative at `t`.
    pub fn velocity(&self, t: f64) -> f64 {
        let tau = t - self.t1;
        let [_, c1, c2, c3] = self.coefficients;
        c1 + tau * (2.0 * c2 + tau * 3.0 * c3)
    }

    /// Unit-step samples over `[t1, t2)`.
    pub fn sample(&self) -> Vec<f64> {
        let count = (self.t2 - self.t1).abs().ceil() as usize;
        let direction = (self.t2 - self.t1).signum();
        (0..count)
            .map(|k| self.position(self.t1 + direction * k as f64))
            .collect()
    }
}

/// Sample the cubic transition between `(t1, x1, r1)` and `(t2, x2, r2)` over `[t1, t2)`.
pub fn third_order_transition(
    x1: f64,
    x2: f64,
    t1: f64,
    t2: f64,
    r1: f64,
    r2: f64,
) -> OctResult<Vec<f64>> {
    Ok(CubicTransition::solve(x1, x2, t1, t2, r1, r2)?.sample())
}

/// Per-axis cubic pair.
struct PlanarTransition {
    x: CubicTransition,
    y: CubicTransition,
}

impl PlanarTransition {
    fn solve(p1: Point2, p2: Point2, t1: f64, t2: f64, r1: Point2, r2: Point2) -> OctResult<Self> {
        Ok(Self {
            x: CubicTransition::solve(p1.x, p2.x, t1, t2, r1.x, r2.x)?,
            y: CubicTransition::solve(p1.y, p2.y, t1, t2, r1.y, r2.y)?,
        })
    }

    fn at(&self, t: f64) -> Point2 {
        Point2::new(self.x.position(t), self.y.position(t))
    }
}

// =============================================================================
// Composite paths
// =============================================================================

/// Ramp from [`REST`] into a uniform sweep from `begin` to `end`, then back to rest.
///
/// The ramps span `settle_samples` samples each. Neither ramp repeats the
/// junction sample it shares with the sweep, and a ramp that would stand
/// still (sweep starting or ending at rest with zero velocity) is omitted.
/// The first lead-in and final lead-out samples are exactly [`REST`].
pub fn ramped_line(
    begin: Point2,
    end: Point2,
    settle_samples: usize,
    density: f64,
) -> OctResult<Trajectory> {
    let scan = line(begin, end, density)?;
    let intervals = scan.len() - 1;
    let step = if intervals == 0 {
        Point2::ORIGIN
    } else {
        Point2::new(
            (end.x - begin.x) / intervals as f64,
            (end.y - begin.y) / intervals as f64,
        )
    };
    let moving = step != Point2::ORIGIN;
    let settle = settle_samples as f64;
    let n = intervals as f64;

    let mut points = Vec::with_capacity(scan.len() + 2 * settle_samples);
    if settle_samples > 0 && (moving || begin != REST) {
        let ramp = PlanarTransition::solve(REST, begin, -settle, 0.0, Point2::ORIGIN, step)?;
        points.extend((0..settle_samples).map(|k| TrajectoryPoint {
            position: if k == 0 { REST } else { ramp.at(-settle + k as f64) },
            role: SegmentRole::LeadIn,
        }));
    }
    points.extend(scan.into_iter().map(|position| TrajectoryPoint {
        position,
        role: SegmentRole::Scan,
    }));
    if settle_samples > 0 && (moving || end != REST) {
        let ramp = PlanarTransition::solve(end, REST, n, n + settle, step, Point2::ORIGIN)?;
        points.extend((1..=settle_samples).map(|k| TrajectoryPoint {
            position: if k == settle_samples {
                REST
            } else {
                ramp.at(n + k as f64)
            },
            role: SegmentRole::LeadOut,
        }));
    }
    Ok(Trajectory::from_points(points))
}

/// Single fast-axis line from `x0` to `xf` at `y = 0`, ramped in from and out to rest.
pub fn single_line_path(
    x0: f64,
    xf: f64,
    settle_samples: usize,
    density: f64,
) -> OctResult<Trajectory> {
    ramped_line(Point2::new(x0, 0.0), Point2::new(xf, 0.0), settle_samples, density)
}

/// Raster grid of shape `[num_tomograms, num_records, 2]`.
///
/// Row `t` sweeps X from `x0` to `xf` at `Y = linspace(y0, yf, num_tomograms)[t]`.
/// The last axis holds `[x, y]`.
pub fn scan_grid(
    x0: f64,
    xf: f64,
    y0: f64,
    yf: f64,
    num_records: usize,
    num_tomograms: usize,
) -> OctResult<Array3<f64>> {
    if num_records == 0 || num_tomograms == 0 {
        return Err(OctError::Configuration(format!(
            "scan grid needs at least one record and one tomogram, got {num_records}x{num_tomograms}"
        )));
    }
    let xs = linspace(x0, xf, num_records);
    let ys = linspace(y0, yf, num_tomograms);
    Ok(Array3::from_shape_fn(
        (num_tomograms, num_records, 2),
        |(t, r, axis)| if axis == 0 { xs[r] } else { ys[t] },
    ))
}

/// Row `tomogram` of a [`scan_grid`] as a scan trajectory.
pub fn grid_row(grid: &Array3<f64>, tomogram: usize) -> OctResult<Trajectory> {
    let (tomograms, records, _) = grid.dim();
    if tomogram >= tomograms {
        return Err(OctError::invalid_shape(
            format!("tomogram index < {tomograms}"),
            tomogram.to_string(),
        ));
    }
    Ok(Trajectory::with_role(
        (0..records).map(|r| Point2::new(grid[[tomogram, r, 0]], grid[[tomogram, r, 1]])),
        SegmentRole::Scan,
    ))
}

/// Rest-to-rest move from `from` to `to` whose peak speed is `max_speed`.
///
/// A cubic rest-to-rest move over `T` seconds peaks at `1.5 * D / T`, so the
/// move takes `T = 1.5 * D / max_speed`. Samples cover `(0, T]`: the starting
/// position is where the stage already is, and the final sample is exactly
/// `to`. A zero-distance move is a single hold sample.
pub fn return_path(
    from: Point2,
    to: Point2,
    max_speed: f64,
    sample_rate_hz: f64,
) -> OctResult<Trajectory> {
    if !(max_speed.is_finite() && max_speed > 0.0) {
        return Err(OctError::Configuration(format!(
            "return path speed must be positive, got {max_speed}"
        )));
    }
    if !(sample_rate_hz.is_finite() && sample_rate_hz > 0.0) {
        return Err(OctError::Configuration(format!(
            "return path sample rate must be positive, got {sample_rate_hz}"
        )));
    }
    let distance = from.distance(&to);
    if distance == 0.0 {
        return Ok(Trajectory::with_role([to], SegmentRole::LeadIn));
    }
    let duration = 1.5 * distance / max_speed;
    let samples = (duration * sample_rate_hz).ceil().max(2.0) as usize;
    let n = samples as f64;
    let ramp = PlanarTransition::solve(from, to, 0.0, n, Point2::ORIGIN, Point2::ORIGIN)?;
    Ok(Trajectory::with_role(
        (1..=samples).map(|k| {
            if k == samples {
                to
            } else {
                ramp.at(k as f64)
            }
        }),
        SegmentRole::LeadIn,
    ))
}

/// One return path per tomogram: from the end of row `t` to the start of row
/// `t + 1`, the last one returning to the start of row 0.
pub fn volume_return_paths(
    grid: &Array3<f64>,
    max_speed: f64,
    sample_rate_hz: f64,
) -> OctResult<Vec<Trajectory>> {
    let (tomograms, records, _) = grid.dim();
    if tomograms == 0 || records == 0 {
        return Err(OctError::invalid_shape(
            "non-empty scan grid",
            format!("{tomograms}x{records}"),
        ));
    }
    (0..tomograms)
        .map(|t| {
            let next = (t + 1) % tomograms;
            let from = Point2::new(grid[[t, records - 1, 0]], grid[[t, records - 1, 1]]);
            let to = Point2::new(grid[[next, 0, 0]], grid[[next, 0, 1]]);
            return_path(from, to, max_speed, sample_rate_hz)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn line_is_even_and_inclusive() {
        let points = line(Point2::new(-1.0, 0.0), Point2::new(1.0, 0.0), 50.0).unwrap();
        assert_eq!(points.len(), 101);
        assert_eq!(points[0], Point2::new(-1.0, 0.0));
        assert_eq!(points[100], Point2::new(1.0, 0.0));
        let spacing = points[1].x - points[0].x;
        for pair in points.windows(2) {
            assert!(pair[1].x > pair[0].x);
            assert_abs_diff_eq!(pair[1].x - pair[0].x, spacing, epsilon = 1e-12);
        }
        assert!(spacing <= 1.0 / 50.0 + 1e-12);
    }

    #[test]
    fn line_diagonal_spacing_follows_path_length() {
        let points = line(Point2::new(0.0, 0.0), Point2::new(3.0, 4.0), 2.0).unwrap();
        assert_eq!(points.len(), 11);
        for pair in points.windows(2) {
            assert_abs_diff_eq!(pair[0].distance(&pair[1]), 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn line_rejects_non_positive_density() {
        for density in [0.0, -3.0, f64::NAN] {
            assert!(matches!(
                line(Point2::ORIGIN, Point2::new(1.0, 0.0), density),
                Err(OctError::Configuration(_))
            ));
        }
    }

    #[test]
    fn zero_length_line_has_one_point() {
        let p = Point2::new(0.3, -0.2);
        assert_eq!(line(p, p, 10.0).unwrap(), vec![p]);
    }

    #[test]
    fn transition_matches_endpoint_conditions() {
        let (x1, x2, t1, t2, r1, r2) = (0.0, 2.5, -40.0, 0.0, 0.0, 0.05);
        let cubic = CubicTransition::solve(x1, x2, t1, t2, r1, r2).unwrap();
        assert_abs_diff_eq!(cubic.position(t1), x1, epsilon = 1e-9);
        assert_abs_diff_eq!(cubic.velocity(t1), r1, epsilon = 1e-9);
        assert_abs_diff_eq!(cubic.position(t2), x2, epsilon = 1e-9);
        assert_abs_diff_eq!(cubic.velocity(t2), r2, epsilon = 1e-9);
    }

    #[test]
    fn transition_far_from_origin_stays_accurate() {
        let cubic = CubicTransition::solve(1.0, 0.0, 5000.0, 5050.0, 0.01, 0.0).unwrap();
        assert_abs_diff_eq!(cubic.position(5000.0), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cubic.position(5050.0), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cubic.velocity(5050.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn sampled_transition_is_half_open() {
        let samples = third_order_transition(0.0, 1.0, 0.0, 4.0, 0.0, 0.0).unwrap();
        assert_eq!(samples.len(), 4);
        assert_abs_diff_eq!(samples[0], 0.0, epsilon = 1e-12);
        assert!(samples[3] < 1.0);
    }

    #[test]
    fn transition_rejects_empty_interval() {
        assert!(CubicTransition::solve(0.0, 1.0, 2.0, 2.0, 0.0, 0.0).is_err());
    }

    #[test]
    fn single_line_path_has_no_duplicate_junctions() {
        let path = single_line_path(-1.0, 1.0, 50, 100.0).unwrap();
        let positions: Vec<Point2> = path.positions().collect();
        for pair in positions.windows(2) {
            assert_ne!(pair[0], pair[1]);
        }
        assert_eq!(path.len(), 50 + 201 + 50);
        assert_eq!(path.scan_span(), Some(50..251));
        assert_eq!(path.start(), Some(REST));
        assert_eq!(path.end(), Some(REST));
    }

    #[test]
    fn single_line_path_is_c1_at_junctions() {
        let path = single_line_path(-1.0, 1.0, 40, 100.0).unwrap();
        let xs: Vec<f64> = path.positions().map(|p| p.x).collect();
        let step = 2.0 / 200.0;
        // Velocity entering and leaving the sweep matches the sweep itself.
        assert_abs_diff_eq!(xs[40] - xs[39], step, epsilon = 2e-4);
        assert_abs_diff_eq!(xs[241] - xs[240], step, epsilon = 2e-4);
        // Ramps start and end at rest with near-zero velocity.
        assert_abs_diff_eq!(xs[1] - xs[0], 0.0, epsilon = 5e-3);
    }

    #[test]
    fn single_line_path_without_settle_is_just_the_line() {
        let path = single_line_path(0.0, 1.0, 0, 10.0).unwrap();
        assert_eq!(path.len(), 11);
        assert!(path.points().iter().all(|p| p.role == SegmentRole::Scan));
    }

    #[test]
    fn scan_grid_shape_and_rows() {
        let grid = scan_grid(-1.0, 1.0, -1.0, 1.0, 100, 4).unwrap();
        assert_eq!(grid.dim(), (4, 100, 2));
        for r in 0..100 {
            assert_abs_diff_eq!(grid[[0, r, 1]], -1.0);
            assert_abs_diff_eq!(grid[[3, r, 1]], 1.0);
        }
        for t in 0..4 {
            assert_abs_diff_eq!(grid[[t, 0, 0]], -1.0);
            assert_abs_diff_eq!(grid[[t, 99, 0]], 1.0);
        }
        assert_abs_diff_eq!(grid[[1, 0, 1]], -1.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn return_path_respects_speed_limit() {
        let from = Point2::new(1.0, -1.0);
        let to = Point2::new(-1.0, -0.5);
        let rate = 1000.0;
        let speed = 4.0;
        let path = return_path(from, to, speed, rate).unwrap();
        assert_eq!(path.end(), Some(to));
        let mut previous = from;
        for p in path.positions() {
            let per_sample = previous.distance(&p);
            assert!(per_sample * rate <= speed * 1.01, "speed {}", per_sample * rate);
            previous = p;
        }
    }

    #[test]
    fn volume_return_paths_wrap_to_grid_start() {
        let grid = scan_grid(-1.0, 1.0, -1.0, 1.0, 10, 3).unwrap();
        let paths = volume_return_paths(&grid, 10.0, 1000.0).unwrap();
        assert_eq!(paths.len(), 3);
        assert_eq!(paths[0].end(), Some(Point2::new(-1.0, 0.0)));
        assert_eq!(paths[2].end(), Some(Point2::new(-1.0, -1.0)));
    }

    #[test]
    fn zero_distance_return_is_a_hold() {
        let p = Point2::new(0.2, 0.2);
        let path = return_path(p, p, 1.0, 100.0).unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path.end(), Some(p));
    }
}
