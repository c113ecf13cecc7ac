//! Volumetric acquisition: one tomogram per grid row.

use super::{to_voltages, AcquisitionBuffer, Scheduler, Session, SessionState};
use crate::path::{grid_row, volume_return_paths};
use crate::plan::{ScanKind, ScanPlan};
use ndarray::{Array3, Axis};
use oct_core::data::{FetchLayout, Point2, Trajectory, VoltageFrames};
use oct_core::error::{OctError, OctResult};
use tracing::{debug, info, instrument};

/// Everything a volume needs, built before the devices are touched.
struct VolumePlan {
    rows: Vec<(Trajectory, VoltageFrames)>,
    returns: Vec<Trajectory>,
    start: Point2,
}

impl Scheduler {
    fn plan_volume(&self, plan: &ScanPlan) -> OctResult<VolumePlan> {
        if plan.kind != ScanKind::Volume {
            return Err(OctError::Configuration(
                "volume scan requested with a line plan".into(),
            ));
        }
        let setup = &self.settings.positioner;
        let grid = plan.volume_grid()?;
        let rows = (0..plan.num_tomograms)
            .map(|t| {
                let row = grid_row(&grid, t)?;
                let frames = to_voltages(setup, &row)?;
                Ok((row, frames))
            })
            .collect::<OctResult<Vec<_>>>()?;

        // Return moves are capped by the sweep speed so the stage never slews
        // faster than it scans; a stationary sweep falls back to the limit.
        let sweep_speed = plan.speed();
        let speed = if sweep_speed > 0.0 {
            sweep_speed.min(setup.max_speed)
        } else {
            setup.max_speed
        };
        let returns = volume_return_paths(&grid, speed, setup.positioning.rate_hz)?;
        for path in &returns {
            to_voltages(setup, path)?;
        }
        let start = rows
            .first()
            .and_then(|(row, _)| row.start())
            .unwrap_or(Point2::ORIGIN);
        Ok(VolumePlan {
            rows,
            returns,
            start,
        })
    }

    /// Acquire `num_tomograms` sweeps into a `[tomogram, record, sample]`
    /// tensor.
    ///
    /// Each tomogram is a full arm/acquire/fetch/reposition cycle. The stage
    /// ends at the start of the grid.
    #[instrument(
        skip_all,
        name = "volume_scan",
        fields(tomograms = plan.num_tomograms, records = plan.num_records)
    )]
    pub async fn volume_scan(&self, plan: &ScanPlan) -> OctResult<AcquisitionBuffer> {
        let volume = self.plan_volume(plan)?;
        let mut session = self.begin_session()?;
        let result = self.volume_scan_in(&mut session, plan, &volume).await;
        self.conclude(&mut session, result).await
    }

    async fn volume_scan_in(
        &self,
        session: &mut Session,
        plan: &ScanPlan,
        volume: &VolumePlan,
    ) -> OctResult<AcquisitionBuffer> {
        let tomograms = plan.num_tomograms;
        let records = plan.num_records;
        let samples = self.settings.digitizer.horizontal.samples_per_record;
        let layout = self.digitizer().fetch_layout();
        let channels = self.sample_channel();

        self.move_to(session, volume.start).await?;

        // Native fetch order per slice.
        let mut native = match layout {
            FetchLayout::RecordMajor => Array3::<f64>::zeros((tomograms, records, samples)),
            FetchLayout::SampleMajor => Array3::<f64>::zeros((tomograms, samples, records)),
        };

        for (t, ((row, frames), return_path)) in
            volume.rows.iter().zip(&volume.returns).enumerate()
        {
            session.transition(SessionState::Arming)?;
            if t == 0 {
                self.arm_digitizer(records).await?;
            }
            let mut slice = native.index_axis_mut(Axis(0), t);
            let destination = slice.as_slice_mut().ok_or_else(|| {
                OctError::invalid_shape("contiguous tomogram slice", "strided view")
            })?;
            let task = self
                .acquire_segment(
                    session,
                    row,
                    frames,
                    plan.laser_sweep_frequency,
                    &channels,
                    destination,
                )
                .await?;

            session.transition(SessionState::Repositioning)?;
            self.finish_segment(session, task, row).await?;
            self.run_positioning(session, return_path).await?;
            debug!(tomogram = t, "tomogram acquired");
        }
        session.transition(SessionState::Done)?;

        let data = match layout {
            FetchLayout::RecordMajor => native,
            FetchLayout::SampleMajor => native
                .permuted_axes([0, 2, 1])
                .as_standard_layout()
                .into_owned(),
        };
        info!(tomograms, records, samples, "volume scan complete");
        Ok(AcquisitionBuffer {
            data,
            scan_span: 0..records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::{DeviceBank, SchedulerSettings, WaitPolicies};
    use super::*;
    use crate::plan::ScanBounds;
    use oct_core::timing::{
        DigitizerSetup, HorizontalTiming, PositionerSetup, PositioningClock, TriggerConfig,
        VerticalConfig, VoltageChannelSpec,
    };
    use oct_driver_mock::{MockDigitizer, MockPositioner};
    use std::sync::Arc;
    use std::time::Duration;

    fn settings(samples: usize) -> SchedulerSettings {
        let vertical = |channel: &str| VerticalConfig {
            channel: channel.into(),
            range: 2.0,
            offset: 0.0,
            coupling: Default::default(),
            probe_attenuation: 1.0,
            enabled: true,
        };
        let output = |name: &str| VoltageChannelSpec {
            physical_channel: name.into(),
            min_voltage: -5.0,
            max_voltage: 5.0,
        };
        SchedulerSettings {
            digitizer: DigitizerSetup {
                horizontal: HorizontalTiming::builder()
                    .samples_per_record(samples)
                    .sample_rate_hz(1e6)
                    .build()
                    .unwrap(),
                trigger: TriggerConfig {
                    source: "TRIG".into(),
                    level: 0.0,
                    slope: Default::default(),
                    coupling: Default::default(),
                    holdoff: Duration::ZERO,
                },
                vertical_reference: vertical("0"),
                vertical_sample: vertical("1"),
                export_signal: None,
            },
            positioner: PositionerSetup {
                x: output("ao0"),
                y: output("ao1"),
                volts_per_unit_x: 1.0,
                volts_per_unit_y: 1.0,
                positioning: PositioningClock {
                    source: "OnboardClock".into(),
                    rate_hz: 1000.0,
                    active_edge: Default::default(),
                },
                scan_clock_source: "PFI0".into(),
                max_speed: 10.0,
            },
            waits: WaitPolicies::default(),
        }
    }

    fn plan() -> ScanPlan {
        let bounds = ScanBounds {
            x0: -1.0,
            y0: -0.5,
            xf: 1.0,
            yf: 0.5,
        };
        ScanPlan::volume(bounds, 2.0, 1000.0, 3).unwrap()
    }

    #[tokio::test]
    async fn every_tomogram_gets_a_scan_and_a_return_task() {
        let positioner = Arc::new(MockPositioner::new("galvo"));
        let digitizer = Arc::new(MockDigitizer::new("scope"));
        let scheduler = Scheduler::new(
            DeviceBank::new(digitizer.clone(), positioner.clone()),
            settings(8),
        );

        let buffer = scheduler.volume_scan(&plan()).await.unwrap();
        assert_eq!(buffer.dim(), (3, 5, 8));
        assert_eq!(buffer.scan_span, 0..5);

        let ledger = positioner.ledger();
        let scan_writes = ledger.writes.iter().filter(|w| !w.auto_start).count();
        assert_eq!(scan_writes, 3);
        assert_eq!(ledger.tasks_created, ledger.tasks_closed);
        assert_eq!(ledger.double_closes, 0);
        assert_eq!(ledger.leaked, 0);
        assert_eq!(digitizer.stats().fetched, 3);
        assert_eq!(digitizer.configured_horizontal().unwrap().num_records, 5);
    }

    #[tokio::test]
    async fn line_plan_is_rejected_before_hardware() {
        let positioner = Arc::new(MockPositioner::new("galvo"));
        let scheduler = Scheduler::new(
            DeviceBank::new(Arc::new(MockDigitizer::new("scope")), positioner.clone()),
            settings(8),
        );
        let line = ScanPlan::from_bounds(plan().bounds, 2.0, 1000.0, 2).unwrap();
        let err = scheduler.volume_scan(&line).await.unwrap_err();
        assert!(matches!(err, OctError::Configuration(_)));
        assert_eq!(positioner.ledger().tasks_created, 0);
    }
}
