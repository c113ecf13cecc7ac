//! Mock swept-source digitizer.
//!
//! Captures synthetic interferograms: the reference channel carries a fringe
//! whose phase advances nonlinearly across the record (the swept laser's
//! nonlinear k-clock), and every other channel carries a sum of reflectors
//! sharing the same nonlinear phase. That makes the output usable for
//! calibration and resampling tests, not just for exercising control flow.

use async_trait::async_trait;
use oct_core::capabilities::Digitizer;
use oct_core::data::{AcquisitionStatus, ChannelList, FetchLayout};
use oct_core::error::{DriverError, DriverErrorKind, DriverResult};
use oct_core::timing::{ExportSignal, HorizontalTiming, TriggerConfig, VerticalConfig};
use parking_lot::Mutex;
use std::f64::consts::PI;
use tokio::time::Instant;

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};

const DRIVER: &str = "mock_digitizer";

// =============================================================================
// Signal model
// =============================================================================

/// Synthetic swept-source signal.
#[derive(Debug, Clone, PartialEq)]
pub struct SweptSourceSignal {
    /// Channel that carries the reference fringe.
    pub reference_channel: String,
    /// Fringe period of the reference, in warped sample units.
    pub fringe_period: f64,
    /// Quadratic sweep nonlinearity: `k(s) = s + nonlinearity * s^2`.
    pub nonlinearity: f64,
    /// Reflector depths, in fringe cycles across a full record.
    pub reflector_depths: Vec<f64>,
    /// Uniform noise amplitude added to every sample.
    pub noise: f64,
}

impl Default for SweptSourceSignal {
    fn default() -> Self {
        Self {
            reference_channel: "0".to_string(),
            fringe_period: 24.0,
            nonlinearity: 1.5e-4,
            reflector_depths: vec![60.0, 150.0],
            noise: 0.0,
        }
    }
}

impl SweptSourceSignal {
    /// Warped (true wavenumber) position of sample `s`.
    pub fn warp(&self, s: f64) -> f64 {
        s + self.nonlinearity * s * s
    }

    /// Noise-free value of `sample` in a record of `samples` samples.
    pub fn value(&self, channel: &str, sample: usize, samples: usize) -> f64 {
        let k = self.warp(sample as f64);
        if channel == self.reference_channel {
            return (2.0 * PI * k / self.fringe_period).cos();
        }
        let span = self.warp(samples.saturating_sub(1).max(1) as f64);
        self.reflector_depths
            .iter()
            .map(|depth| (2.0 * PI * depth * k / span).cos())
            .sum()
    }
}

// =============================================================================
// Completion behavior
// =============================================================================

/// How acquisitions finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionBehavior {
    /// Report `Complete` once the status has been polled more than `n` times.
    AfterPolls(u32),
    /// Never report completion.
    Never,
    /// The first `n` acquisitions never complete; later ones complete at once.
    StallFirst(u32),
}

impl Default for CompletionBehavior {
    fn default() -> Self {
        CompletionBehavior::AfterPolls(0)
    }
}

/// Counters exposed for assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DigitizerStats {
    /// Acquisitions initiated.
    pub initiated: u32,
    /// Active acquisitions ended by `abort`.
    pub aborted: u32,
    /// Successful fetches.
    pub fetched: u32,
    /// Status polls answered.
    pub status_polls: u32,
}

#[derive(Debug)]
struct ActiveAcquisition {
    started: Instant,
    polls: u32,
    stalled: bool,
    complete: bool,
}

#[derive(Debug, Default)]
struct DigitizerState {
    horizontal: Option<HorizontalTiming>,
    trigger: Option<TriggerConfig>,
    verticals: Vec<VerticalConfig>,
    export: Option<ExportSignal>,
    acquisition: Option<ActiveAcquisition>,
    stats: DigitizerStats,
}

// =============================================================================
// MockDigitizer
// =============================================================================

/// Simulated digitizer.
///
/// # Example
///
/// ```rust,ignore
/// let digitizer = MockDigitizer::new("scope0")
///     .with_layout(FetchLayout::SampleMajor)
///     .with_completion(CompletionBehavior::AfterPolls(3));
/// ```
pub struct MockDigitizer {
    name: String,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    layout: FetchLayout,
    completion: CompletionBehavior,
    trigger_rate_hz: f64,
    record_length_override: Option<usize>,
    signal: SweptSourceSignal,
    rng: MockRng,
    state: Mutex<DigitizerState>,
}

impl MockDigitizer {
    /// Instant-mode digitizer with the default signal.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: MockMode::Instant,
            timing: TimingConfig::default(),
            errors: ErrorConfig::none(),
            layout: FetchLayout::RecordMajor,
            completion: CompletionBehavior::default(),
            trigger_rate_hz: 100_000.0,
            record_length_override: None,
            signal: SweptSourceSignal::default(),
            rng: MockRng::new(Some(0)),
            state: Mutex::new(DigitizerState::default()),
        }
    }

    /// Set the operational mode. Timed modes use [`TimingConfig::digitizer`].
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self.timing = if mode.is_timed() {
            TimingConfig::digitizer()
        } else {
            TimingConfig::default()
        };
        self
    }

    /// Inject failures.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Destination layout used by `fetch`.
    pub fn with_layout(mut self, layout: FetchLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Acquisition completion behavior.
    pub fn with_completion(mut self, completion: CompletionBehavior) -> Self {
        self.completion = completion;
        self
    }

    /// Laser sweep rate that paces records in timed modes.
    pub fn with_trigger_rate(mut self, hz: f64) -> Self {
        self.trigger_rate_hz = hz;
        self
    }

    /// Coerce the record length to `samples`, as hardware with
    /// granularity constraints does.
    pub fn with_record_length_override(mut self, samples: usize) -> Self {
        self.record_length_override = Some(samples);
        self
    }

    /// Replace the synthetic signal.
    pub fn with_signal(mut self, signal: SweptSourceSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Seed the noise generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = MockRng::new(Some(seed));
        self
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DigitizerStats {
        self.state.lock().stats
    }

    /// Horizontal timing last configured.
    pub fn configured_horizontal(&self) -> Option<HorizontalTiming> {
        self.state.lock().horizontal.clone()
    }

    /// Vertical configurations in call order.
    pub fn configured_verticals(&self) -> Vec<VerticalConfig> {
        self.state.lock().verticals.clone()
    }

    /// Exported signal, if any.
    pub fn configured_export(&self) -> Option<ExportSignal> {
        self.state.lock().export.clone()
    }

    /// Whether an acquisition is active.
    pub fn is_acquiring(&self) -> bool {
        self.state.lock().acquisition.is_some()
    }

    /// The synthetic signal in use.
    pub fn signal(&self) -> &SweptSourceSignal {
        &self.signal
    }

    async fn latency(&self) {
        if self.mode.is_timed() {
            tokio::time::sleep(self.timing.command_delay()).await;
        }
    }

    fn invalid_state(message: impl Into<String>) -> DriverError {
        DriverError::new(DRIVER, DriverErrorKind::InvalidState, message)
    }

    fn record_length(state: &DigitizerState, override_len: Option<usize>) -> DriverResult<usize> {
        let horizontal = state
            .horizontal
            .as_ref()
            .ok_or_else(|| Self::invalid_state("horizontal timing not configured"))?;
        Ok(override_len.unwrap_or(horizontal.samples_per_record))
    }
}

#[async_trait]
impl Digitizer for MockDigitizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn configure_horizontal_timing(&self, timing: &HorizontalTiming) -> DriverResult<()> {
        self.latency().await;
        self.errors
            .check_operation(DRIVER, "configure_horizontal_timing")?;
        if timing.samples_per_record == 0 || timing.num_records == 0 {
            return Err(DriverError::new(
                DRIVER,
                DriverErrorKind::InvalidParameter,
                "record length and record count must be non-zero",
            ));
        }
        let mut state = self.state.lock();
        if state.acquisition.is_some() {
            return Err(Self::invalid_state("cannot reconfigure during acquisition"));
        }
        state.horizontal = Some(timing.clone());
        Ok(())
    }

    async fn configure_trigger(&self, trigger: &TriggerConfig) -> DriverResult<()> {
        self.latency().await;
        self.errors.check_operation(DRIVER, "configure_trigger")?;
        self.state.lock().trigger = Some(trigger.clone());
        Ok(())
    }

    async fn configure_vertical(&self, vertical: &VerticalConfig) -> DriverResult<()> {
        self.latency().await;
        self.errors.check_operation(DRIVER, "configure_vertical")?;
        let mut state = self.state.lock();
        state.verticals.retain(|v| v.channel != vertical.channel);
        state.verticals.push(vertical.clone());
        Ok(())
    }

    async fn export_signal(&self, export: &ExportSignal) -> DriverResult<()> {
        self.latency().await;
        self.errors.check_operation(DRIVER, "export_signal")?;
        self.state.lock().export = Some(export.clone());
        Ok(())
    }

    async fn initiate_acquisition(&self) -> DriverResult<()> {
        self.latency().await;
        self.errors.check_operation(DRIVER, "initiate_acquisition")?;
        let mut state = self.state.lock();
        if state.horizontal.is_none() || state.trigger.is_none() {
            return Err(Self::invalid_state(
                "horizontal timing and trigger must be configured before initiate",
            ));
        }
        if state.acquisition.is_some() {
            return Err(Self::invalid_state("acquisition already in progress"));
        }
        state.stats.initiated += 1;
        let stalled = match self.completion {
            CompletionBehavior::Never => true,
            CompletionBehavior::StallFirst(n) => state.stats.initiated <= n,
            CompletionBehavior::AfterPolls(_) => false,
        };
        state.acquisition = Some(ActiveAcquisition {
            started: Instant::now(),
            polls: 0,
            stalled,
            complete: false,
        });
        tracing::trace!(device = %self.name, "acquisition initiated");
        Ok(())
    }

    async fn acquisition_status(&self) -> DriverResult<AcquisitionStatus> {
        self.errors.check_operation(DRIVER, "acquisition_status")?;
        let mut state = self.state.lock();
        state.stats.status_polls += 1;
        let records = state.horizontal.as_ref().map_or(1, |h| h.num_records);
        let Some(acquisition) = state.acquisition.as_mut() else {
            return Ok(AcquisitionStatus::Unknown);
        };
        acquisition.polls += 1;
        if !acquisition.complete && !acquisition.stalled {
            let polled_enough = match self.completion {
                CompletionBehavior::AfterPolls(n) => acquisition.polls > n,
                _ => true,
            };
            let paced = !self.mode.is_timed()
                || acquisition.started.elapsed().as_secs_f64()
                    >= records as f64 / self.trigger_rate_hz;
            acquisition.complete = polled_enough && paced;
        }
        Ok(if acquisition.complete {
            AcquisitionStatus::Complete
        } else {
            AcquisitionStatus::Acquiring
        })
    }

    fn actual_record_length(&self) -> DriverResult<usize> {
        let state = self.state.lock();
        Self::record_length(&state, self.record_length_override)
    }

    fn fetch_layout(&self) -> FetchLayout {
        self.layout
    }

    async fn fetch(&self, channels: &ChannelList, destination: &mut [f64]) -> DriverResult<()> {
        let records = {
            let state = self.state.lock();
            state.horizontal.as_ref().map_or(0, |h| h.num_records)
        };
        if self.mode.is_timed() {
            tokio::time::sleep(self.timing.transfer_delay(records * channels.len())).await;
        }
        self.errors.check_operation(DRIVER, "fetch")?;

        let mut state = self.state.lock();
        match state.acquisition.as_ref() {
            Some(acquisition) if acquisition.complete => {}
            Some(_) => return Err(Self::invalid_state("acquisition not complete")),
            None => return Err(Self::invalid_state("no acquisition to fetch")),
        }
        let samples = Self::record_length(&state, self.record_length_override)?;
        for channel in &channels.0 {
            if !state.verticals.iter().any(|v| &v.channel == channel) {
                return Err(DriverError::new(
                    DRIVER,
                    DriverErrorKind::InvalidParameter,
                    format!("channel '{}' is not configured", channel),
                ));
            }
        }
        let waveforms = channels.len() * records;
        let expected = waveforms * samples;
        if destination.len() != expected {
            return Err(DriverError::new(
                DRIVER,
                DriverErrorKind::InvalidParameter,
                format!(
                    "destination holds {} values, acquisition produced {} ({} waveforms of {})",
                    destination.len(),
                    expected,
                    waveforms,
                    samples
                ),
            ));
        }

        for (c, channel) in channels.0.iter().enumerate() {
            for record in 0..records {
                let waveform = c * records + record;
                for sample in 0..samples {
                    let index = self.layout.index(waveform, sample, waveforms, samples);
                    destination[index] = self.signal.value(channel, sample, samples)
                        + self.rng.noise(self.signal.noise);
                }
            }
        }
        state.acquisition = None;
        state.stats.fetched += 1;
        Ok(())
    }

    fn abort(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.acquisition.take().is_some() {
            state.stats.aborted += 1;
            tracing::debug!(device = %self.name, "acquisition aborted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;
    use oct_core::timing::{TriggerCoupling, TriggerSlope, VerticalCoupling};
    use std::time::Duration;

    fn horizontal(records: usize, samples: usize) -> HorizontalTiming {
        HorizontalTiming {
            samples_per_record: samples,
            sample_rate_hz: 100e6,
            num_records: records,
            ref_position_pct: 0.0,
            enforce_realtime: true,
        }
    }

    fn trigger() -> TriggerConfig {
        TriggerConfig {
            source: "TRIG".into(),
            level: 0.0,
            slope: TriggerSlope::Positive,
            coupling: TriggerCoupling::Dc,
            holdoff: Duration::ZERO,
        }
    }

    fn vertical(channel: &str) -> VerticalConfig {
        VerticalConfig {
            channel: channel.into(),
            range: 2.0,
            offset: 0.0,
            coupling: VerticalCoupling::Dc,
            probe_attenuation: 1.0,
            enabled: true,
        }
    }

    async fn armed(digitizer: &MockDigitizer, records: usize, samples: usize) {
        digitizer
            .configure_horizontal_timing(&horizontal(records, samples))
            .await
            .unwrap();
        digitizer.configure_trigger(&trigger()).await.unwrap();
        digitizer.configure_vertical(&vertical("0")).await.unwrap();
        digitizer.configure_vertical(&vertical("1")).await.unwrap();
    }

    #[tokio::test]
    async fn second_initiate_is_rejected() {
        let digitizer = MockDigitizer::new("scope0");
        armed(&digitizer, 2, 16).await;
        digitizer.initiate_acquisition().await.unwrap();
        let err = digitizer.initiate_acquisition().await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidState);

        digitizer.abort().unwrap();
        assert_eq!(digitizer.stats().aborted, 1);
        assert!(!digitizer.is_acquiring());
    }

    #[tokio::test]
    async fn completes_after_configured_polls() {
        let digitizer =
            MockDigitizer::new("scope0").with_completion(CompletionBehavior::AfterPolls(2));
        armed(&digitizer, 1, 8).await;
        digitizer.initiate_acquisition().await.unwrap();
        assert_eq!(
            digitizer.acquisition_status().await.unwrap(),
            AcquisitionStatus::Acquiring
        );
        assert_eq!(
            digitizer.acquisition_status().await.unwrap(),
            AcquisitionStatus::Acquiring
        );
        assert_eq!(
            digitizer.acquisition_status().await.unwrap(),
            AcquisitionStatus::Complete
        );
    }

    #[tokio::test]
    async fn stall_first_recovers_on_later_attempt() {
        let digitizer =
            MockDigitizer::new("scope0").with_completion(CompletionBehavior::StallFirst(1));
        armed(&digitizer, 1, 8).await;
        digitizer.initiate_acquisition().await.unwrap();
        assert_eq!(
            digitizer.acquisition_status().await.unwrap(),
            AcquisitionStatus::Acquiring
        );
        digitizer.abort().unwrap();
        digitizer.initiate_acquisition().await.unwrap();
        assert_eq!(
            digitizer.acquisition_status().await.unwrap(),
            AcquisitionStatus::Complete
        );
    }

    #[tokio::test]
    async fn fetch_rejects_wrong_destination_size() {
        let digitizer = MockDigitizer::new("scope0");
        armed(&digitizer, 3, 10).await;
        digitizer.initiate_acquisition().await.unwrap();
        digitizer.acquisition_status().await.unwrap();
        let mut short = vec![0.0; 29];
        let err = digitizer
            .fetch(&ChannelList::single("1"), &mut short)
            .await
            .unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidParameter);
    }

    #[tokio::test]
    async fn sample_major_layout_interleaves_waveforms() {
        let digitizer = MockDigitizer::new("scope0").with_layout(FetchLayout::SampleMajor);
        armed(&digitizer, 1, 32).await;
        digitizer.initiate_acquisition().await.unwrap();
        digitizer.acquisition_status().await.unwrap();
        let channels = ChannelList(vec!["0".into(), "1".into()]);
        let mut buffer = vec![0.0; 64];
        digitizer.fetch(&channels, &mut buffer).await.unwrap();

        let signal = digitizer.signal().clone();
        for s in 0..32 {
            assert_eq!(buffer[s * 2], signal.value("0", s, 32));
            assert_eq!(buffer[s * 2 + 1], signal.value("1", s, 32));
        }
        assert_eq!(digitizer.stats().fetched, 1);
    }

    #[tokio::test]
    async fn injected_rejection_surfaces_as_configuration_error() {
        let digitizer = MockDigitizer::new("scope0").with_errors(ErrorConfig::scenario(
            ErrorScenario::Reject {
                operation: "configure_trigger",
            },
        ));
        let err = digitizer.configure_trigger(&trigger()).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Configuration);
    }

    #[test]
    fn reference_fringe_starts_at_peak() {
        let signal = SweptSourceSignal::default();
        assert_eq!(signal.value("0", 0, 100), 1.0);
        assert!(signal.warp(100.0) > 100.0);
    }
}
