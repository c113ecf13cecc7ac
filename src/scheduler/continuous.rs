//! Repeated acquisition of one line until cancelled.

use super::{records_from_fetch, to_voltages, Scheduler, Session, SessionState};
use crate::plan::ScanPlan;
use ndarray::Array2;
use oct_core::data::{Trajectory, VoltageFrames};
use oct_core::error::{OctError, OctResult};
use std::ops::Range;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument};

/// One acquisition of a continuous scan, in `[record, sample]` order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    /// Zero-based frame number.
    pub sequence: u64,
    /// Raw sample-channel records.
    pub records: Array2<f64>,
    /// Records of the constant-velocity sweep.
    pub scan_span: Range<usize>,
}

impl Scheduler {
    /// Acquire the line of `plan` over and over, sending each frame to `frames`.
    ///
    /// `cancel` is checked between iterations; an acquisition in flight always
    /// completes. The queue is bounded, so a slow consumer holds the scan back
    /// instead of growing memory. The scan also ends when the receiver is
    /// dropped. On every exit the stage is parked at the origin.
    ///
    /// Returns the number of frames delivered.
    ///
    /// # Errors
    /// [`OctError::Cancelled`] when cancellation is already set before the
    /// first acquisition; otherwise any device or timeout error.
    #[instrument(skip_all, name = "continuous_scan", fields(records = plan.num_records))]
    pub async fn continuous_scan(
        &self,
        plan: &ScanPlan,
        frames: mpsc::Sender<RawFrame>,
        mut cancel: watch::Receiver<bool>,
    ) -> OctResult<u64> {
        let trajectory = plan.line_trajectory()?;
        let voltages = to_voltages(&self.settings.positioner, &trajectory)?;
        if *cancel.borrow() {
            return Err(OctError::Cancelled);
        }
        let mut session = self.begin_session()?;
        let result = self
            .continuous_in(
                &mut session,
                plan,
                &trajectory,
                &voltages,
                &frames,
                &mut cancel,
            )
            .await;
        let result = self.conclude(&mut session, result).await?;
        self.park(&mut session).await?;
        info!(frames = result, "continuous scan stopped");
        Ok(result)
    }

    async fn continuous_in(
        &self,
        session: &mut Session,
        plan: &ScanPlan,
        trajectory: &Trajectory,
        voltages: &VoltageFrames,
        frames: &mpsc::Sender<RawFrame>,
        cancel: &mut watch::Receiver<bool>,
    ) -> OctResult<u64> {
        let records = voltages.samples_per_channel();
        let samples = self.settings.digitizer.horizontal.samples_per_record;
        let channels = self.sample_channel();
        let scan_span = trajectory.scan_span().unwrap_or(0..records);
        let start = trajectory.start();

        session.transition(SessionState::Arming)?;
        if let Some(start) = start {
            self.move_to(session, start).await?;
        }
        self.arm_digitizer(records).await?;

        let mut sequence = 0u64;
        loop {
            let mut raw = vec![0.0; records * samples];
            let task = self
                .acquire_segment(
                    session,
                    trajectory,
                    voltages,
                    plan.laser_sweep_frequency,
                    &channels,
                    &mut raw,
                )
                .await?;
            session.transition(SessionState::Repositioning)?;
            self.finish_segment(session, task, trajectory).await?;

            let frame = RawFrame {
                sequence,
                records: records_from_fetch(self.digitizer().fetch_layout(), raw, records, samples)?,
                scan_span: scan_span.clone(),
            };
            // A fetched frame goes out whenever the queue has room; cancel
            // only wins while the consumer is behind.
            tokio::select! {
                biased;
                sent = frames.send(frame) => {
                    if sent.is_err() {
                        debug!(sequence, "frame receiver dropped");
                        break;
                    }
                    sequence += 1;
                }
                _ = wait_for_cancel(cancel) => {
                    debug!(sequence, "cancelled while the consumer was behind");
                    break;
                }
            }

            if *cancel.borrow() {
                debug!(sequence, "cancellation observed");
                break;
            }
            if let Some(start) = start {
                self.move_to(session, start).await?;
            }
            session.transition(SessionState::Arming)?;
        }
        session.transition(SessionState::Done)?;
        Ok(sequence)
    }
}

/// Resolve once cancellation is set. Never resolves if the sender is gone
/// without having set it.
async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|&c| c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
