//! Chained command steps.
//!
//! A command line such as `calibrate fit` or `scan resample fft` runs its
//! steps left to right, each taking the [`PipelineData`] the previous one
//! produced. Acquisition steps ignore their input; processing steps reject
//! input they cannot handle with [`OctError::InvalidShape`].

use crate::calibration::{
    calibrate, load_capture, Calibration, CalibrationEngine, ReferenceCapture,
};
use crate::config::Settings;
use crate::plan::ScanPlan;
use crate::preview::{
    preview_channel, run_preview, FrameSink, LatestFrameSink, PreviewFrame, PreviewProcessor,
    PreviewSettings,
};
use crate::resample::{representative_slice, Resampler};
use crate::scheduler::Scheduler;
use crate::transform::FrequencyTransform;
use ndarray::{Array2, Array3};
use oct_core::error::{OctError, OctResult};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{info, instrument};

/// Value passed between steps.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineData {
    /// Nothing yet.
    Empty,
    /// Reference and sample channels of one record.
    Capture(ReferenceCapture),
    /// One record.
    Trace(Vec<f64>),
    /// `[record, sample]`.
    Records(Array2<f64>),
    /// `[tomogram, record, sample]`.
    Tensor(Array3<f64>),
    /// Magnitude spectra, one row per record.
    Spectrum(Array2<f64>),
    /// Fitted calibration.
    Calibration(Calibration),
    /// Last preview image.
    Image(PreviewFrame),
}

impl PipelineData {
    fn kind(&self) -> &'static str {
        match self {
            PipelineData::Empty => "nothing",
            PipelineData::Capture(_) => "capture",
            PipelineData::Trace(_) => "trace",
            PipelineData::Records(_) => "records",
            PipelineData::Tensor(_) => "tensor",
            PipelineData::Spectrum(_) => "spectrum",
            PipelineData::Calibration(_) => "calibration",
            PipelineData::Image(_) => "image",
        }
    }

    fn unsupported(&self, step: Step, expected: &str) -> OctError {
        OctError::invalid_shape(format!("{expected} for '{step}'"), self.kind())
    }
}

/// One pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Step {
    /// Capture a reference record and fit new coefficients.
    Calibrate,
    /// Read the saved reference capture.
    Load,
    /// Fit coefficients to a capture or trace.
    Fit,
    /// Resample onto the uniform grid.
    Resample,
    /// Magnitude spectrum.
    Fft,
    /// Acquire one line.
    Scan,
    /// Acquire a volume.
    Volume,
    /// Run a continuous scan with live preview.
    Preview,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Calibrate => "calibrate",
            Step::Load => "load",
            Step::Fit => "fit",
            Step::Resample => "resample",
            Step::Fft => "fft",
            Step::Scan => "scan",
            Step::Volume => "volume",
            Step::Preview => "preview",
        };
        f.write_str(name)
    }
}

/// Fixed inputs of the steps.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Single-line plan for `scan` and `preview`.
    pub line: ScanPlan,
    /// Plan for `volume`.
    pub volume: ScanPlan,
    /// Capture file read by `load`.
    pub capture_path: PathBuf,
    /// Preview scaling.
    pub preview: PreviewSettings,
    /// Queue depth between scan and preview.
    pub preview_queue_depth: usize,
    /// Frames shown before `preview` stops.
    pub preview_frames: u64,
}

impl PipelineOptions {
    /// Options from validated settings.
    pub fn from_settings(settings: &Settings, preview_frames: u64) -> OctResult<Self> {
        Ok(Self {
            line: settings.scan_plan()?,
            volume: settings.volume_plan()?,
            capture_path: settings.calibration.capture_path.clone(),
            preview: settings.preview,
            preview_queue_depth: settings.scheduler.preview_queue_depth,
            preview_frames,
        })
    }
}

/// Runs steps against one scheduler and calibration engine.
#[derive(Debug, Clone)]
pub struct Pipeline {
    scheduler: Scheduler,
    engine: CalibrationEngine,
    options: PipelineOptions,
}

impl Pipeline {
    /// New pipeline.
    pub fn new(scheduler: Scheduler, engine: CalibrationEngine, options: PipelineOptions) -> Self {
        Self {
            scheduler,
            engine,
            options,
        }
    }

    /// The calibration engine.
    pub fn engine(&self) -> &CalibrationEngine {
        &self.engine
    }

    /// Run `steps` in order, starting from [`PipelineData::Empty`].
    pub async fn run(&self, steps: &[Step]) -> OctResult<PipelineData> {
        let mut data = PipelineData::Empty;
        for &step in steps {
            data = self.run_step(step, data).await?;
            info!(%step, output = data.kind(), "step complete");
        }
        Ok(data)
    }

    /// Run one step.
    #[instrument(skip(self, input), fields(input = input.kind()))]
    pub async fn run_step(&self, step: Step, input: PipelineData) -> OctResult<PipelineData> {
        match step {
            Step::Calibrate => Ok(PipelineData::Calibration(
                self.engine.run(&self.scheduler).await?,
            )),
            Step::Load => Ok(PipelineData::Capture(load_capture(
                &self.options.capture_path,
            )?)),
            Step::Fit => self.fit(input),
            Step::Resample => self.resample(input),
            Step::Fft => fft(input),
            Step::Scan => Ok(PipelineData::Tensor(
                self.scheduler.single_scan(&self.options.line).await?.into_data(),
            )),
            Step::Volume => Ok(PipelineData::Tensor(
                self.scheduler.volume_scan(&self.options.volume).await?.into_data(),
            )),
            Step::Preview => self.preview().await,
        }
    }

    fn fit(&self, input: PipelineData) -> OctResult<PipelineData> {
        let capture = match input {
            PipelineData::Capture(capture) => capture,
            PipelineData::Trace(reference) => ReferenceCapture {
                reference,
                sample: Vec::new(),
            },
            PipelineData::Calibration(calibration) => {
                return Ok(PipelineData::Calibration(calibration))
            }
            other => return Err(other.unsupported(Step::Fit, "capture or trace")),
        };
        // Publishing needs the devices idle; a busy scanner leaves the store
        // untouched and only reports the fit.
        match self.scheduler.begin_session() {
            Ok(session) => Ok(PipelineData::Calibration(
                self.engine.apply(&session, &capture)?,
            )),
            Err(OctError::SessionBusy) => {
                Ok(PipelineData::Calibration(calibrate(&capture.reference)?))
            }
            Err(e) => Err(e),
        }
    }

    fn resample(&self, input: PipelineData) -> OctResult<PipelineData> {
        let resampler = Resampler::from_coefficients(self.engine.store().current())
            .with_target_len(self.options.preview.target_len)?;
        match input {
            PipelineData::Trace(trace) => Ok(PipelineData::Trace(resampler.resample_trace(&trace)?)),
            PipelineData::Capture(capture) => Ok(PipelineData::Trace(
                resampler.resample_trace(&capture.sample)?,
            )),
            PipelineData::Records(records) => Ok(PipelineData::Records(
                resampler.resample_records(records.view())?,
            )),
            PipelineData::Tensor(tensor) => Ok(PipelineData::Records(
                resampler.resample_records(representative_slice(&tensor, 0)?)?,
            )),
            other => Err(other.unsupported(Step::Resample, "trace, records or tensor")),
        }
    }

    async fn preview(&self) -> OctResult<PipelineData> {
        let (tx, rx) = preview_channel(self.options.preview_queue_depth);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let latest = LatestFrameSink::new();
        let sink = StopAfter {
            inner: latest.clone(),
            remaining: self.options.preview_frames.max(1),
            cancel: cancel_tx,
        };
        let processor = PreviewProcessor::new(self.engine.store().clone(), self.options.preview);
        let consumer = tokio::spawn(run_preview(rx, processor, sink));

        let acquired = self
            .scheduler
            .continuous_scan(&self.options.line, tx, cancel_rx)
            .await;
        let shown = consumer
            .await
            .map_err(|e| OctError::Configuration(format!("preview consumer failed: {e}")))??;
        let acquired = acquired?;
        info!(acquired, shown, "preview finished");
        latest
            .latest()
            .map(PipelineData::Image)
            .ok_or_else(|| OctError::invalid_shape("at least one preview frame", "none"))
    }
}

fn fft(input: PipelineData) -> OctResult<PipelineData> {
    let transform = FrequencyTransform::new();
    let spectrum = match input {
        PipelineData::Trace(trace) => {
            Array2::from_shape_vec((1, trace.len()), transform.magnitude(&trace)?)
                .map_err(|e| OctError::invalid_shape("one spectrum row", e.to_string()))?
        }
        PipelineData::Capture(capture) => {
            let magnitude = transform.magnitude(&capture.reference)?;
            Array2::from_shape_vec((1, magnitude.len()), magnitude)
                .map_err(|e| OctError::invalid_shape("one spectrum row", e.to_string()))?
        }
        PipelineData::Records(records) => transform.magnitude_rows(records.view())?,
        PipelineData::Tensor(tensor) => transform.magnitude_rows(representative_slice(&tensor, 0)?)?,
        other => return Err(other.unsupported(Step::Fft, "trace, records or tensor")),
    };
    Ok(PipelineData::Spectrum(spectrum))
}

/// Forwards frames and raises cancellation once enough have been shown.
struct StopAfter<S> {
    inner: S,
    remaining: u64,
    cancel: watch::Sender<bool>,
}

impl<S: FrameSink> FrameSink for StopAfter<S> {
    fn accept(&mut self, frame: PreviewFrame) -> OctResult<()> {
        self.inner.accept(frame)?;
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.cancel.send_replace(true);
        }
        Ok(())
    }
}
