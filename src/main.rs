//! CLI entry point for oct-scan.
//!
//! Runs a chain of pipeline steps against simulated devices configured from
//! the settings file.
//!
//! # Usage
//!
//! Fit a calibration from a fresh reference capture:
//! ```bash
//! oct-scan calibrate
//! ```
//!
//! Acquire a line and show its corrected spectrum:
//! ```bash
//! oct-scan --config config/oct.toml scan resample fft
//! ```
//!
//! Uncorrected spectrum of the saved reference:
//! ```bash
//! oct-scan load fft
//! ```
//!
//! Machine-readable summary of a volume acquisition:
//! ```bash
//! oct-scan --json --mode realistic volume
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use oct_driver_mock::{ErrorConfig, MockDigitizer, MockMode, MockPositioner};
use oct_scan::calibration::{CalibrationEngine, CoefficientStore};
use oct_scan::config::Settings;
use oct_scan::logging;
use oct_scan::pipeline::{Pipeline, PipelineData, PipelineOptions, Step};
use oct_scan::scheduler::{DeviceBank, Scheduler};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Per-call failure probability of simulated devices in chaos mode.
const CHAOS_FAILURE_RATE: f64 = 0.02;

#[derive(Parser)]
#[command(name = "oct-scan")]
#[command(about = "OCT scan acquisition, calibration and resampling", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, default_value = "config/oct.toml")]
    config: PathBuf,

    /// Simulated device timing
    #[arg(long, value_enum, default_value = "instant")]
    mode: SimulationMode,

    /// Frames shown by the `preview` step before it stops
    #[arg(long, default_value_t = 10)]
    preview_frames: u64,

    /// Only load and validate the settings
    #[arg(long)]
    check: bool,

    /// Print the result summary as JSON
    #[arg(long)]
    json: bool,

    /// Steps to run, left to right
    #[arg(value_enum, required_unless_present = "check")]
    steps: Vec<Step>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum SimulationMode {
    Instant,
    Realistic,
    Chaos,
}

impl From<SimulationMode> for MockMode {
    fn from(mode: SimulationMode) -> Self {
        match mode {
            SimulationMode::Instant => MockMode::Instant,
            SimulationMode::Realistic => MockMode::Realistic,
            SimulationMode::Chaos => MockMode::Chaos,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate().context("validating settings")?;
    logging::init_from_settings(&settings).context("initializing logging")?;
    if cli.check {
        println!("{}: ok", cli.config.display());
        return Ok(());
    }

    let mode = MockMode::from(cli.mode);
    let errors = match mode {
        MockMode::Chaos => ErrorConfig::random_failures_seeded(CHAOS_FAILURE_RATE, None),
        _ => ErrorConfig::none(),
    };
    let digitizer = MockDigitizer::new(settings.digitizer.resource.clone())
        .with_mode(mode)
        .with_errors(errors.clone())
        .with_trigger_rate(settings.laser.sweep_frequency_hz);
    let positioner = MockPositioner::new(settings.positioner.resource.clone())
        .with_mode(mode)
        .with_errors(errors);
    let scheduler = Scheduler::new(
        DeviceBank::new(Arc::new(digitizer), Arc::new(positioner)),
        settings.scheduler_settings(),
    );

    let coefficients_path = &settings.calibration.coefficients_path;
    let store = if coefficients_path.exists() {
        CoefficientStore::load(coefficients_path)
            .with_context(|| format!("loading {}", coefficients_path.display()))?
    } else {
        CoefficientStore::new(settings.coefficients()?)
    };
    let engine = CalibrationEngine::new(store)
        .with_capture_path(&settings.calibration.capture_path)
        .with_coefficients_path(coefficients_path);
    for path in [&settings.calibration.capture_path, coefficients_path] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(dir = %dir.display(), error = %e, "cannot create calibration directory");
            }
        }
    }

    let options = PipelineOptions::from_settings(&settings, cli.preview_frames)?;
    let pipeline = Pipeline::new(scheduler, engine, options);
    info!(steps = ?cli.steps, "running pipeline");
    let output = pipeline.run(&cli.steps).await.map_err(|e| {
        let device = e.failing_device().unwrap_or("-").to_string();
        anyhow::Error::new(e).context(format!("pipeline failed (device: {device})"))
    })?;
    let summary = summarize(&output);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", describe(&summary));
    }
    Ok(())
}

fn summarize(data: &PipelineData) -> Value {
    match data {
        PipelineData::Empty => json!({ "kind": "empty" }),
        PipelineData::Capture(capture) => json!({ "kind": "capture", "shape": [2, capture.len()] }),
        PipelineData::Trace(trace) => json!({ "kind": "trace", "shape": [trace.len()] }),
        PipelineData::Records(records) => json!({ "kind": "records", "shape": records.shape() }),
        PipelineData::Tensor(tensor) => json!({ "kind": "tensor", "shape": tensor.shape() }),
        PipelineData::Spectrum(spectrum) => {
            let bins = spectrum.ncols();
            let peak = spectrum
                .row(0)
                .iter()
                .take(bins / 2)
                .enumerate()
                .skip(1)
                .fold((0, 0.0_f64), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
            json!({ "kind": "spectrum", "shape": spectrum.shape(), "peak_bin": peak.0 })
        }
        PipelineData::Calibration(calibration) => json!({
            "kind": "calibration",
            "crossings": calibration.crossings.len(),
            "residual_rms": calibration.residual_rms,
            "coefficients": calibration.coefficients.values(),
        }),
        PipelineData::Image(frame) => json!({
            "kind": "image",
            "sequence": frame.sequence,
            "shape": [frame.height, frame.width],
        }),
    }
}

fn describe(summary: &Value) -> String {
    let kind = summary["kind"].as_str().unwrap_or("output");
    let mut line = kind.to_string();
    if let Some(shape) = summary["shape"].as_array() {
        let dims: Vec<String> = shape.iter().map(Value::to_string).collect();
        line.push_str(&format!(": {}", dims.join(" x ")));
    }
    for key in ["peak_bin", "crossings", "residual_rms", "sequence", "coefficients"] {
        if let Some(value) = summary.get(key) {
            line.push_str(&format!(", {key} {value}"));
        }
    }
    line
}
