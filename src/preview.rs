//! Live preview of a continuous scan.
//!
//! The scheduler produces [`RawFrame`]s into a bounded queue; the consumer
//! here turns each into an 8-bit B-scan image:
//!
//! ```text
//! raw records ─► resample ─► |FFT| ─► 20·log10 ─► contrast·dB + brightness ─► u8
//! ```
//!
//! Coefficients are read from the shared [`CoefficientStore`] for every
//! frame, so a new calibration takes effect on the next frame.

use crate::calibration::CoefficientStore;
use crate::resample::{Resampler, DEFAULT_TARGET_LEN};
use crate::scheduler::RawFrame;
use crate::transform::FrequencyTransform;
use ndarray::{s, Array2};
use oct_core::error::{OctError, OctResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Image scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreviewSettings {
    /// Offset added after scaling, in gray levels.
    #[serde(default)]
    pub brightness: f64,
    /// Gray levels per dB.
    #[serde(default = "default_contrast")]
    pub contrast: f64,
    /// Resampled record length.
    #[serde(default = "default_target_len")]
    pub target_len: usize,
}

fn default_contrast() -> f64 {
    2.0
}

fn default_target_len() -> usize {
    DEFAULT_TARGET_LEN
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: default_contrast(),
            target_len: default_target_len(),
        }
    }
}

/// One 8-bit B-scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewFrame {
    /// Sequence number of the raw frame.
    pub sequence: u64,
    /// Pixels per row (depth bins).
    pub width: usize,
    /// Rows (one per record).
    pub height: usize,
    /// Row-major gray levels.
    pub pixels: Vec<u8>,
}

impl PreviewFrame {
    /// Row `r`, if present.
    pub fn row(&self, r: usize) -> Option<&[u8]> {
        let start = r.checked_mul(self.width)?;
        self.pixels.get(start..start + self.width)
    }
}

/// Receives processed frames.
pub trait FrameSink: Send {
    /// Take one frame.
    fn accept(&mut self, frame: PreviewFrame) -> OctResult<()>;
}

/// Keeps the most recent frame and counts deliveries.
///
/// Clones share state, so one handle can go to the consumer task while the
/// caller keeps another to read from.
#[derive(Debug, Clone, Default)]
pub struct LatestFrameSink {
    inner: Arc<Mutex<(Option<PreviewFrame>, u64)>>,
}

impl LatestFrameSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last frame received.
    pub fn latest(&self) -> Option<PreviewFrame> {
        self.inner.lock().0.clone()
    }

    /// Frames received.
    pub fn count(&self) -> u64 {
        self.inner.lock().1
    }
}

impl FrameSink for LatestFrameSink {
    fn accept(&mut self, frame: PreviewFrame) -> OctResult<()> {
        let mut inner = self.inner.lock();
        inner.0 = Some(frame);
        inner.1 += 1;
        Ok(())
    }
}

/// Turns raw frames into preview images.
#[derive(Debug, Clone)]
pub struct PreviewProcessor {
    store: CoefficientStore,
    settings: PreviewSettings,
    transform: FrequencyTransform,
}

impl PreviewProcessor {
    /// Processor reading coefficients from `store`.
    pub fn new(store: CoefficientStore, settings: PreviewSettings) -> Self {
        Self {
            store,
            settings,
            transform: FrequencyTransform::new(),
        }
    }

    /// Process the scan records of `frame`.
    ///
    /// Only the first half of the spectrum is kept; the second half mirrors
    /// it for real input.
    pub fn process(&self, frame: &RawFrame) -> OctResult<PreviewFrame> {
        let span = frame.scan_span.clone();
        if span.end > frame.records.nrows() || span.is_empty() {
            return Err(OctError::invalid_shape(
                format!("scan span within {} records", frame.records.nrows()),
                format!("{span:?}"),
            ));
        }
        let records = frame.records.slice(s![span, ..]);
        let resampler = Resampler::from_coefficients(self.store.current())
            .with_target_len(self.settings.target_len)?;
        let resampled = resampler.resample_records(records)?;
        let spectrum = self.transform.magnitude_rows(resampled.view())?;
        let depth = spectrum.ncols() / 2;
        let image = self.quantize(&spectrum.slice(s![.., ..depth]).to_owned());
        Ok(PreviewFrame {
            sequence: frame.sequence,
            width: depth,
            height: image.nrows(),
            pixels: image.into_raw_vec_and_offset().0,
        })
    }

    fn quantize(&self, magnitude: &Array2<f64>) -> Array2<u8> {
        let PreviewSettings {
            brightness,
            contrast,
            ..
        } = self.settings;
        magnitude.mapv(|m| {
            let db = 20.0 * (m + f64::EPSILON).log10();
            (contrast * db + brightness).clamp(0.0, 255.0).round() as u8
        })
    }
}

/// Bounded queue between a continuous scan and its preview consumer.
pub fn preview_channel(depth: usize) -> (mpsc::Sender<RawFrame>, mpsc::Receiver<RawFrame>) {
    mpsc::channel(depth.max(1))
}

/// Consume frames until the producer hangs up; returns the frames shown.
pub async fn run_preview<S: FrameSink>(
    mut frames: mpsc::Receiver<RawFrame>,
    processor: PreviewProcessor,
    mut sink: S,
) -> OctResult<u64> {
    let mut shown = 0;
    while let Some(frame) = frames.recv().await {
        let image = processor.process(&frame)?;
        trace!(sequence = image.sequence, "preview frame ready");
        sink.accept(image)?;
        shown += 1;
    }
    debug!(frames = shown, "preview stopped");
    Ok(shown)
}
