//! Acquisition scheduling across the digitizer and the positioner.
//!
//! One [`Session`] owns both devices for a whole scan. Every segment goes
//! through the same cycle:
//!
//! 1. **Arming**: the positioner task is created, clocked and written
//!    without starting, after the digitizer has been configured, so neither
//!    device runs before both are ready.
//! 2. **Acquiring**: digitizer first, then positioner; digitizer status is
//!    polled under a [`WaitPolicy`] until complete.
//! 3. **Fetching**: records are copied into the caller's slot. A coerced
//!    record length that no longer matches the slot is fatal.
//! 4. **Repositioning**: the scan task is waited on and closed, then the
//!    next positioning move runs as its own auto-start task.
//!
//! A digitizer timeout aborts the acquisition, lets the positioner finish its
//! finite buffer, rewinds the stage to the segment start and retries, up to
//! the configured limit. Device configuration errors end the session at once.

mod continuous;
mod guard;
mod session;
mod volume;
mod wait;

pub use continuous::RawFrame;
pub use guard::{AcquisitionGuard, TaskGuard};
pub use session::{Session, SessionState};
pub use wait::{WaitError, WaitPolicies, WaitPolicy};

use crate::calibration::ReferenceCapture;
use crate::path::return_path;
use crate::plan::ScanPlan;
use ndarray::{s, Array3, ArrayView3};
use oct_core::capabilities::{Digitizer, Positioner};
use oct_core::data::{
    AcquisitionStatus, ChannelList, FetchLayout, Point2, Trajectory, VoltageFrames,
};
use oct_core::error::{DriverError, DriverErrorKind, OctError, OctResult};
use oct_core::timing::{DigitizerSetup, PositionerSetup, SampleClockConfig};
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Devices
// =============================================================================

/// The digitizer and positioner, shared behind one session lock.
#[derive(Clone)]
pub struct DeviceBank {
    digitizer: Arc<dyn Digitizer>,
    positioner: Arc<dyn Positioner>,
    lease: Arc<Mutex<()>>,
}

impl DeviceBank {
    /// Bundle two devices.
    pub fn new(digitizer: Arc<dyn Digitizer>, positioner: Arc<dyn Positioner>) -> Self {
        Self {
            digitizer,
            positioner,
            lease: Arc::new(Mutex::new(())),
        }
    }

    /// Take exclusive hold of both devices.
    ///
    /// # Errors
    /// [`OctError::SessionBusy`] while another session holds them.
    pub fn try_session(&self) -> OctResult<Session> {
        let lease = Arc::clone(&self.lease)
            .try_lock_owned()
            .map_err(|_| OctError::SessionBusy)?;
        Ok(Session::new(lease))
    }

    /// The digitizer.
    pub fn digitizer(&self) -> &dyn Digitizer {
        self.digitizer.as_ref()
    }

    /// The positioner.
    pub fn positioner(&self) -> &dyn Positioner {
        self.positioner.as_ref()
    }
}

impl std::fmt::Debug for DeviceBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBank")
            .field("digitizer", &self.digitizer.name())
            .field("positioner", &self.positioner.name())
            .finish()
    }
}

// =============================================================================
// Output
// =============================================================================

/// Acquired records in `[tomogram, record, sample]` order.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionBuffer {
    /// Raw samples.
    pub data: Array3<f64>,
    /// Records acquired during the constant-velocity sweep. Single-line
    /// scans also record their ramps; those records lie outside this range.
    pub scan_span: Range<usize>,
}

impl AcquisitionBuffer {
    /// `(tomograms, records, samples)`.
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Only the records of the constant-velocity sweep.
    pub fn scan_records(&self) -> ArrayView3<'_, f64> {
        self.data.slice(s![.., self.scan_span.clone(), ..])
    }

    /// Hand over the tensor.
    pub fn into_data(self) -> Array3<f64> {
        self.data
    }
}

/// Scale a trajectory to output voltages and check every sample against the
/// channel limits.
///
/// Runs before any hardware call, so a path that would leave the safe range
/// never reaches the positioner.
pub fn to_voltages(setup: &PositionerSetup, trajectory: &Trajectory) -> OctResult<VoltageFrames> {
    let mut samples = Vec::with_capacity(trajectory.len());
    for (i, point) in trajectory.positions().enumerate() {
        let volts = [point.x * setup.volts_per_unit_x, point.y * setup.volts_per_unit_y];
        for (spec, v) in [(&setup.x, volts[0]), (&setup.y, volts[1])] {
            if !spec.contains(v) {
                return Err(OctError::Configuration(format!(
                    "trajectory sample {i} needs {v:.4} V on {}, outside [{}, {}]",
                    spec.physical_channel, spec.min_voltage, spec.max_voltage
                )));
            }
        }
        samples.push(volts);
    }
    if samples.is_empty() {
        return Err(OctError::Configuration("empty trajectory".into()));
    }
    Ok(VoltageFrames { samples })
}

/// Reorder a fetched block of `records` waveforms of `samples` samples into
/// `[records, samples]` row-major order.
pub(crate) fn records_from_fetch(
    layout: FetchLayout,
    raw: Vec<f64>,
    records: usize,
    samples: usize,
) -> OctResult<ndarray::Array2<f64>> {
    let shape_error = |e: ndarray::ShapeError| {
        OctError::invalid_shape(format!("{records}x{samples} fetch"), e.to_string())
    };
    match layout {
        FetchLayout::RecordMajor => {
            ndarray::Array2::from_shape_vec((records, samples), raw).map_err(shape_error)
        }
        FetchLayout::SampleMajor => Ok(ndarray::Array2::from_shape_vec((samples, records), raw)
            .map_err(shape_error)?
            .reversed_axes()
            .as_standard_layout()
            .into_owned()),
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Device setup and waits a scheduler runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Digitizer configuration.
    pub digitizer: DigitizerSetup,
    /// Positioner configuration.
    pub positioner: PositionerSetup,
    /// Poll intervals, timeouts and retries.
    pub waits: WaitPolicies,
}

/// Drives scans over a [`DeviceBank`].
#[derive(Debug, Clone)]
pub struct Scheduler {
    devices: DeviceBank,
    settings: SchedulerSettings,
}

impl Scheduler {
    /// Scheduler over `devices`.
    pub fn new(devices: DeviceBank, settings: SchedulerSettings) -> Self {
        Self { devices, settings }
    }

    /// The devices.
    pub fn devices(&self) -> &DeviceBank {
        &self.devices
    }

    /// Current settings.
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Take exclusive hold of the devices.
    pub fn begin_session(&self) -> OctResult<Session> {
        self.devices.try_session()
    }

    fn digitizer(&self) -> &dyn Digitizer {
        self.devices.digitizer()
    }

    fn sample_channel(&self) -> ChannelList {
        ChannelList::single(self.settings.digitizer.vertical_sample.channel.clone())
    }

    /// Log the outcome of a failed session, mark it aborted and park the
    /// stage when the positioner is still trustworthy.
    async fn conclude<T>(&self, session: &mut Session, result: OctResult<T>) -> OctResult<T> {
        let Err(e) = &result else {
            return result;
        };
        error!(
            device = e.failing_device().unwrap_or("-"),
            state = %session.state(),
            error = %e,
            "scan failed"
        );
        let touched_hardware = session.state() != SessionState::Idle;
        session.abort();
        if touched_hardware {
            if let Err(abort_error) = self.digitizer().abort() {
                warn!(error = %abort_error, "could not abort digitizer after failure");
            }
        }
        let positioner_failed = e.failing_device() == Some(self.devices.positioner().name());
        if touched_hardware && !positioner_failed {
            if session.position().is_none() {
                warn!("stage position unknown, not parking");
            } else if let Err(park_error) = self.park(session).await {
                warn!(error = %park_error, "could not park stage after failure");
            }
        }
        result
    }

    // -------------------------------------------------------------------------
    // Arming
    // -------------------------------------------------------------------------

    /// Configure the digitizer for `records` records per acquisition.
    async fn arm_digitizer(&self, records: usize) -> OctResult<()> {
        let digitizer = self.digitizer();
        let name = digitizer.name();
        let setup = &self.settings.digitizer;

        let horizontal = setup.horizontal.with_num_records(records);
        digitizer
            .configure_horizontal_timing(&horizontal)
            .await
            .map_err(|e| OctError::device_configuration(name, "horizontal timing", e))?;
        debug!(
            device = name,
            records,
            samples = horizontal.samples_per_record,
            "horizontal timing configured"
        );
        digitizer
            .configure_trigger(&setup.trigger)
            .await
            .map_err(|e| OctError::device_configuration(name, "trigger", e))?;
        debug!(device = name, source = %setup.trigger.source, "trigger configured");
        for (stage, vertical) in [
            ("vertical reference", &setup.vertical_reference),
            ("vertical sample", &setup.vertical_sample),
        ] {
            digitizer
                .configure_vertical(vertical)
                .await
                .map_err(|e| OctError::device_configuration(name, stage, e))?;
            debug!(device = name, channel = %vertical.channel, stage, "vertical configured");
        }
        if let Some(export) = &setup.export_signal {
            digitizer
                .export_signal(export)
                .await
                .map_err(|e| OctError::device_configuration(name, "clock export", e))?;
            debug!(device = name, terminal = %export.output_terminal, "clock exported");
        }
        Ok(())
    }

    /// Create a scan task clocked at `rate_hz` and write `frames` without starting.
    async fn arm_positioner(&self, frames: &VoltageFrames, rate_hz: f64) -> OctResult<TaskGuard> {
        let setup = &self.settings.positioner;
        let mut task = TaskGuard::create(self.devices.positioner(), setup)?;
        task.configure_clock(&SampleClockConfig::finite(
            setup.scan_clock_source.clone(),
            rate_hz,
            frames.samples_per_channel(),
        ))?;
        task.write(frames, false).await?;
        debug!(
            device = self.devices.positioner().name(),
            samples = frames.samples_per_channel(),
            rate_hz,
            "scan segment written"
        );
        Ok(task)
    }

    // -------------------------------------------------------------------------
    // Acquiring and fetching
    // -------------------------------------------------------------------------

    /// Poll the digitizer until it completes.
    async fn await_completion(&self) -> Result<(), WaitError<DriverError>> {
        let digitizer = self.digitizer();
        self.settings
            .waits
            .acquisition
            .wait_until(move || async move {
                Ok(digitizer.acquisition_status().await? == AcquisitionStatus::Complete)
            })
            .await
    }

    /// Copy the completed acquisition of `channels` into `destination`.
    async fn fetch_into(&self, channels: &ChannelList, destination: &mut [f64]) -> OctResult<()> {
        let digitizer = self.digitizer();
        let name = digitizer.name();
        let configured = self.settings.digitizer.horizontal.samples_per_record;
        let actual = digitizer
            .actual_record_length()
            .map_err(|e| OctError::device(name, "record length", e))?;
        if actual != configured {
            return Err(OctError::Configuration(format!(
                "digitizer '{name}' uses {actual} samples per record, destination expects {configured}"
            )));
        }
        if destination.len() % (actual * channels.len().max(1)) != 0 {
            return Err(OctError::Configuration(format!(
                "destination of {} values does not hold whole {actual}-sample records of {} channel(s)",
                destination.len(),
                channels.len()
            )));
        }

        let limit = self.settings.waits.fetch_timeout;
        match tokio::time::timeout(limit, digitizer.fetch(channels, destination)).await {
            Ok(result) => result.map_err(|e| OctError::device(name, "fetch", e))?,
            Err(_) => {
                return Err(OctError::device(
                    name,
                    "fetch",
                    DriverError::new(
                        name,
                        DriverErrorKind::Timeout,
                        format!("fetch did not finish within {limit:?}"),
                    ),
                ))
            }
        }
        debug!(device = name, values = destination.len(), channels = %channels, "records fetched");
        Ok(())
    }

    /// Arm, acquire and fetch one positioner segment.
    ///
    /// The session must be in `Arming` with the digitizer configured. On
    /// success the session is in `Fetching` and the scan task is returned
    /// still open, so the caller controls when it is released.
    async fn acquire_segment(
        &self,
        session: &mut Session,
        trajectory: &Trajectory,
        frames: &VoltageFrames,
        rate_hz: f64,
        channels: &ChannelList,
        destination: &mut [f64],
    ) -> OctResult<TaskGuard> {
        let digitizer = self.digitizer();
        let max_retries = self.settings.waits.max_acquisition_retries;
        let mut attempt = 0u32;

        let task = loop {
            attempt += 1;
            let mut task = self.arm_positioner(frames, rate_hz).await?;

            session.transition(SessionState::Acquiring)?;
            let acquisition = AcquisitionGuard::initiate(digitizer).await?;
            session.forget_position();
            task.start().await?;
            debug!(attempt, "segment started");

            match self.await_completion().await {
                Ok(()) => {
                    acquisition.complete();
                    break task;
                }
                Err(WaitError::Failed(e)) => {
                    return Err(OctError::device(digitizer.name(), "acquisition status", e));
                }
                Err(WaitError::TimedOut(waited)) => {
                    drop(acquisition);
                    if attempt > max_retries {
                        // The stage must come to rest at the segment end
                        // before anything plans a move from there.
                        if let Err(e) = self.finish_segment(session, task, trajectory).await {
                            warn!(error = %e, "scan task did not finish after final timeout");
                        }
                        return Err(OctError::AcquisitionTimeout {
                            device: digitizer.name().to_string(),
                            waited,
                            attempts: attempt,
                        });
                    }
                    warn!(
                        device = digitizer.name(),
                        attempt,
                        ?waited,
                        "acquisition timed out, retrying"
                    );
                    self.finish_segment(session, task, trajectory).await?;
                    session.transition(SessionState::Arming)?;
                    if let Some(start) = trajectory.start() {
                        self.move_to(session, start).await?;
                    }
                }
            }
        };

        session.transition(SessionState::Fetching)?;
        self.fetch_into(channels, destination).await?;
        Ok(task)
    }

    // -------------------------------------------------------------------------
    // Repositioning
    // -------------------------------------------------------------------------

    /// Let a scan task finish its buffer and close it.
    async fn finish_segment(
        &self,
        session: &mut Session,
        mut task: TaskGuard,
        trajectory: &Trajectory,
    ) -> OctResult<()> {
        task.wait_done(self.settings.waits.positioner_timeout).await?;
        task.close()?;
        if let Some(end) = trajectory.end() {
            session.set_position(end);
        }
        Ok(())
    }

    /// Output a positioning trajectory on the positioning clock and wait for it.
    async fn run_positioning(&self, session: &mut Session, path: &Trajectory) -> OctResult<()> {
        let setup = &self.settings.positioner;
        let frames = to_voltages(setup, path)?;
        let mut task = TaskGuard::create(self.devices.positioner(), setup)?;
        task.configure_clock(&setup.positioning.for_samples(frames.samples_per_channel()))?;
        session.forget_position();
        task.write(&frames, true).await?;
        task.wait_done(self.settings.waits.positioner_timeout).await?;
        task.close()?;
        if let Some(end) = path.end() {
            session.set_position(end);
        }
        Ok(())
    }

    /// Move the stage from its last commanded position to `target` at the
    /// positioner's maximum speed.
    ///
    /// # Errors
    /// A positioner error with [`DriverErrorKind::InvalidState`] when the
    /// session no longer knows where the stage is.
    pub async fn move_to(&self, session: &mut Session, target: Point2) -> OctResult<()> {
        let name = self.devices.positioner().name();
        let from = session.position().ok_or_else(|| {
            OctError::device(
                name,
                "positioning move",
                DriverError::new(name, DriverErrorKind::InvalidState, "stage position unknown"),
            )
        })?;
        if from == target {
            return Ok(());
        }
        let setup = &self.settings.positioner;
        let path = return_path(from, target, setup.max_speed, setup.positioning.rate_hz)?;
        debug!(?from, ?target, samples = path.len(), "positioning move");
        self.run_positioning(session, &path).await
    }

    /// Return the stage to the origin.
    pub async fn park(&self, session: &mut Session) -> OctResult<()> {
        self.move_to(session, Point2::ORIGIN).await?;
        debug!("stage parked");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Scans
    // -------------------------------------------------------------------------

    /// Acquire one ramped line.
    ///
    /// The digitizer records one record per positioner sample, ramps
    /// included; [`AcquisitionBuffer::scan_span`] marks the sweep.
    #[instrument(skip_all, name = "single_scan", fields(records = plan.num_records))]
    pub async fn single_scan(&self, plan: &ScanPlan) -> OctResult<AcquisitionBuffer> {
        let trajectory = plan.line_trajectory()?;
        let frames = to_voltages(&self.settings.positioner, &trajectory)?;
        let mut session = self.begin_session()?;
        let result = self
            .single_scan_in(&mut session, plan, &trajectory, &frames)
            .await;
        self.conclude(&mut session, result).await
    }

    async fn single_scan_in(
        &self,
        session: &mut Session,
        plan: &ScanPlan,
        trajectory: &Trajectory,
        frames: &VoltageFrames,
    ) -> OctResult<AcquisitionBuffer> {
        if let Some(start) = trajectory.start() {
            self.move_to(session, start).await?;
        }
        let records = frames.samples_per_channel();
        let samples = self.settings.digitizer.horizontal.samples_per_record;

        session.transition(SessionState::Arming)?;
        self.arm_digitizer(records).await?;
        let mut raw = vec![0.0; records * samples];
        let task = self
            .acquire_segment(
                session,
                trajectory,
                frames,
                plan.laser_sweep_frequency,
                &self.sample_channel(),
                &mut raw,
            )
            .await?;

        session.transition(SessionState::Repositioning)?;
        self.finish_segment(session, task, trajectory).await?;
        session.transition(SessionState::Done)?;

        let layout = self.digitizer().fetch_layout();
        let data = records_from_fetch(layout, raw, records, samples)?.insert_axis(ndarray::Axis(0));
        info!(records, samples, "single scan complete");
        Ok(AcquisitionBuffer {
            data,
            scan_span: trajectory.scan_span().unwrap_or(0..records),
        })
    }

    /// Capture one record of the reference and sample channels with the
    /// positioner idle.
    pub async fn capture_reference(&self, session: &mut Session) -> OctResult<ReferenceCapture> {
        let digitizer = self.digitizer();
        let setup = &self.settings.digitizer;
        let samples = setup.horizontal.samples_per_record;
        let channels = ChannelList(vec![
            setup.vertical_reference.channel.clone(),
            setup.vertical_sample.channel.clone(),
        ]);

        let result = async {
            session.transition(SessionState::Arming)?;
            self.arm_digitizer(1).await?;
            session.transition(SessionState::Acquiring)?;
            let acquisition = AcquisitionGuard::initiate(digitizer).await?;
            match self.await_completion().await {
                Ok(()) => acquisition.complete(),
                Err(WaitError::Failed(e)) => {
                    return Err(OctError::device(digitizer.name(), "acquisition status", e))
                }
                Err(WaitError::TimedOut(waited)) => {
                    return Err(OctError::AcquisitionTimeout {
                        device: digitizer.name().to_string(),
                        waited,
                        attempts: 1,
                    })
                }
            }
            session.transition(SessionState::Fetching)?;
            let mut raw = vec![0.0; 2 * samples];
            self.fetch_into(&channels, &mut raw).await?;
            session.transition(SessionState::Done)?;

            let layout = digitizer.fetch_layout();
            let channel = |w: usize| -> Vec<f64> {
                (0..samples)
                    .map(|s| raw[layout.index(w, s, 2, samples)])
                    .collect()
            };
            Ok(ReferenceCapture {
                reference: channel(0),
                sample: channel(1),
            })
        }
        .await;
        self.conclude(session, result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oct_core::data::SegmentRole;
    use oct_core::timing::{PositioningClock, VoltageChannelSpec};

    fn positioner_setup() -> PositionerSetup {
        let channel = |name: &str| VoltageChannelSpec {
            physical_channel: name.into(),
            min_voltage: -2.0,
            max_voltage: 2.0,
        };
        PositionerSetup {
            x: channel("ao0"),
            y: channel("ao1"),
            volts_per_unit_x: 2.0,
            volts_per_unit_y: 1.0,
            positioning: PositioningClock {
                source: "OnboardClock".into(),
                rate_hz: 1000.0,
                active_edge: Default::default(),
            },
            scan_clock_source: "PFI0".into(),
            max_speed: 5.0,
        }
    }

    #[test]
    fn voltages_are_scaled_per_axis() {
        let trajectory = Trajectory::with_role(
            [Point2::new(0.5, -1.0), Point2::new(-0.25, 2.0)],
            SegmentRole::Scan,
        );
        let frames = to_voltages(&positioner_setup(), &trajectory).unwrap();
        assert_eq!(frames.samples, vec![[1.0, -1.0], [-0.5, 2.0]]);
    }

    #[test]
    fn out_of_range_voltage_is_a_configuration_error() {
        let trajectory = Trajectory::with_role([Point2::new(1.5, 0.0)], SegmentRole::Scan);
        let err = to_voltages(&positioner_setup(), &trajectory).unwrap_err();
        assert!(matches!(err, OctError::Configuration(ref m) if m.contains("ao0")));
    }

    #[test]
    fn sample_major_fetch_is_transposed() {
        // Two records of three samples, stored sample by sample.
        let raw = vec![0.0, 10.0, 1.0, 11.0, 2.0, 12.0];
        let records = records_from_fetch(FetchLayout::SampleMajor, raw, 2, 3).unwrap();
        assert_eq!(records.row(0).to_vec(), vec![0.0, 1.0, 2.0]);
        assert_eq!(records.row(1).to_vec(), vec![10.0, 11.0, 12.0]);

        let direct = records_from_fetch(
            FetchLayout::RecordMajor,
            vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0],
            2,
            3,
        )
        .unwrap();
        assert_eq!(direct, records);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn retry_is_logged_with_the_device() {
        use oct_core::timing::{DigitizerSetup, HorizontalTiming, TriggerConfig, VerticalConfig};
        use oct_driver_mock::{CompletionBehavior, MockDigitizer, MockPositioner};

        let vertical = |channel: &str| VerticalConfig {
            channel: channel.into(),
            range: 1.0,
            offset: 0.0,
            coupling: Default::default(),
            probe_attenuation: 1.0,
            enabled: true,
        };
        let mut positioner = positioner_setup();
        positioner.volts_per_unit_x = 1.0;
        let settings = SchedulerSettings {
            digitizer: DigitizerSetup {
                horizontal: HorizontalTiming::builder()
                    .samples_per_record(16)
                    .sample_rate_hz(1e6)
                    .build()
                    .unwrap(),
                trigger: TriggerConfig {
                    source: "TRIG".into(),
                    level: 0.0,
                    slope: Default::default(),
                    coupling: Default::default(),
                    holdoff: std::time::Duration::ZERO,
                },
                vertical_reference: vertical("0"),
                vertical_sample: vertical("1"),
                export_signal: None,
            },
            positioner,
            waits: WaitPolicies::default(),
        };
        let scheduler = Scheduler::new(
            DeviceBank::new(
                Arc::new(
                    MockDigitizer::new("scope").with_completion(CompletionBehavior::StallFirst(1)),
                ),
                Arc::new(MockPositioner::new("galvo")),
            ),
            settings,
        );
        let plan = ScanPlan::from_bounds(
            crate::plan::ScanBounds {
                x0: -1.0,
                y0: 0.0,
                xf: 1.0,
                yf: 0.0,
            },
            4.0,
            1000.0,
            2,
        )
        .unwrap();

        scheduler.single_scan(&plan).await.unwrap();
        assert!(logs_contain("acquisition timed out, retrying"));
        assert!(logs_contain("scope"));
        assert!(logs_contain("single scan complete"));
    }
}
