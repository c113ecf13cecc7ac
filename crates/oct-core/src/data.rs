//! Plain data exchanged between path planning, the scheduler and device drivers.

use serde::{Deserialize, Serialize};

// =============================================================================
// Geometry
// =============================================================================

/// A position in the scan plane, in stage units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    /// Fast-axis coordinate.
    pub x: f64,
    /// Slow-axis coordinate.
    pub y: f64,
}

impl Point2 {
    /// Stage rest position.
    pub const ORIGIN: Point2 = Point2 { x: 0.0, y: 0.0 };

    /// Build a point.
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    pub fn distance(&self, other: &Point2) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    /// Linear interpolation between `self` (at 0) and `other` (at 1).
    pub fn lerp(&self, other: &Point2, fraction: f64) -> Point2 {
        Point2 {
            x: self.x + (other.x - self.x) * fraction,
            y: self.y + (other.y - self.y) * fraction,
        }
    }
}

// =============================================================================
// Trajectories
// =============================================================================

/// Which part of a motion a trajectory sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentRole {
    /// Acceleration from rest (or travel between slices) toward a scan start.
    LeadIn,
    /// Constant-velocity sweep while the digitizer records.
    Scan,
    /// Deceleration back to rest.
    LeadOut,
}

/// One positioner sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    /// Commanded position.
    pub position: Point2,
    /// Segment the sample belongs to.
    pub role: SegmentRole,
}

/// An ordered, immutable sequence of positioner samples.
///
/// Built once by the path planner and consumed by a single positioner write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    /// Wrap already ordered points.
    pub fn from_points(points: Vec<TrajectoryPoint>) -> Self {
        Self { points }
    }

    /// Tag every position with the same role.
    pub fn with_role(positions: impl IntoIterator<Item = Point2>, role: SegmentRole) -> Self {
        Self {
            points: positions
                .into_iter()
                .map(|position| TrajectoryPoint { position, role })
                .collect(),
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the trajectory holds no samples.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// All samples in order.
    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    /// Positions only.
    pub fn positions(&self) -> impl Iterator<Item = Point2> + '_ {
        self.points.iter().map(|p| p.position)
    }

    /// First commanded position.
    pub fn start(&self) -> Option<Point2> {
        self.points.first().map(|p| p.position)
    }

    /// Final commanded position.
    pub fn end(&self) -> Option<Point2> {
        self.points.last().map(|p| p.position)
    }

    /// Index range of samples tagged [`SegmentRole::Scan`].
    pub fn scan_span(&self) -> Option<std::ops::Range<usize>> {
        let first = self
            .points
            .iter()
            .position(|p| p.role == SegmentRole::Scan)?;
        let last = self
            .points
            .iter()
            .rposition(|p| p.role == SegmentRole::Scan)?;
        Some(first..last + 1)
    }
}

/// Per-sample output voltages for the two positioner channels.
///
/// Produced from a [`Trajectory`] by the scheduler after unit conversion and
/// limit checks. Drivers write it verbatim.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VoltageFrames {
    /// `[x_volts, y_volts]` per sample.
    pub samples: Vec<[f64; 2]>,
}

impl VoltageFrames {
    /// Number of samples per channel.
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len()
    }

    /// Final sample, which the output holds after the task finishes.
    pub fn last(&self) -> Option<[f64; 2]> {
        self.samples.last().copied()
    }
}

// =============================================================================
// Digitizer data
// =============================================================================

/// Digitizer acquisition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionStatus {
    /// Records are still being captured.
    Acquiring,
    /// All configured records are available for fetch.
    Complete,
    /// The device cannot tell.
    Unknown,
}

/// Order in which a digitizer writes fetched waveforms into the destination.
///
/// `waveform` counts `channel * num_records + record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchLayout {
    /// Each waveform is stored contiguously, one after another.
    #[default]
    RecordMajor,
    /// Sample `s` of every waveform is stored together, waveform fastest.
    SampleMajor,
}

impl FetchLayout {
    /// Flat destination index of `sample` within `waveform`.
    pub fn index(self, waveform: usize, sample: usize, waveforms: usize, samples: usize) -> usize {
        match self {
            FetchLayout::RecordMajor => waveform * samples + sample,
            FetchLayout::SampleMajor => sample * waveforms + waveform,
        }
    }
}

/// Digitizer channel selection for a fetch, in fetch order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelList(pub Vec<String>);

impl ChannelList {
    /// Single-channel selection.
    pub fn single(channel: impl Into<String>) -> Self {
        Self(vec![channel.into()])
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no channel is selected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ChannelList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_span_covers_only_scan_samples() {
        let mut points = Vec::new();
        for x in 0..3 {
            points.push(TrajectoryPoint {
                position: Point2::new(x as f64, 0.0),
                role: SegmentRole::LeadIn,
            });
        }
        for x in 3..8 {
            points.push(TrajectoryPoint {
                position: Point2::new(x as f64, 0.0),
                role: SegmentRole::Scan,
            });
        }
        points.push(TrajectoryPoint {
            position: Point2::ORIGIN,
            role: SegmentRole::LeadOut,
        });
        let trajectory = Trajectory::from_points(points);
        assert_eq!(trajectory.scan_span(), Some(3..8));
        assert_eq!(trajectory.end(), Some(Point2::ORIGIN));
    }

    #[test]
    fn fetch_layout_indexing() {
        // 2 waveforms of 3 samples.
        assert_eq!(FetchLayout::RecordMajor.index(1, 2, 2, 3), 5);
        assert_eq!(FetchLayout::SampleMajor.index(1, 2, 2, 3), 5);
        assert_eq!(FetchLayout::RecordMajor.index(1, 0, 2, 3), 3);
        assert_eq!(FetchLayout::SampleMajor.index(1, 0, 2, 3), 1);
    }

    #[test]
    fn channel_list_display() {
        let list = ChannelList(vec!["0".into(), "1".into()]);
        assert_eq!(list.to_string(), "0,1");
    }
}
