//! Scoped ownership of device resources.
//!
//! Every positioner task and digitizer acquisition opened during a session
//! is held by a guard. The normal path releases it explicitly; any other
//! exit (an error, a timeout, a cancelled future) releases it on drop.

use oct_core::capabilities::{Digitizer, OutputTask, Positioner};
use oct_core::data::VoltageFrames;
use oct_core::error::{OctError, OctResult};
use oct_core::timing::{PositionerSetup, SampleClockConfig};
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Positioner tasks
// =============================================================================

/// An open positioner output task.
///
/// [`close`](TaskGuard::close) consumes the guard, so a task is stopped and
/// closed exactly once whichever way the guard ends.
pub struct TaskGuard {
    device: String,
    task: Option<Box<dyn OutputTask>>,
}

impl TaskGuard {
    /// Create a task with the X and Y channels of `setup`.
    pub fn create(positioner: &dyn Positioner, setup: &PositionerSetup) -> OctResult<Self> {
        let device = positioner.name().to_string();
        let task = positioner
            .create_task()
            .map_err(|e| OctError::device_configuration(&device, "create task", e))?;
        let mut guard = Self {
            device,
            task: Some(task),
        };
        for (stage, spec) in [("x channel", &setup.x), ("y channel", &setup.y)] {
            guard
                .task_mut()?
                .create_voltage_channel(spec)
                .map_err(|e| OctError::device_configuration(&guard.device, stage, e))?;
        }
        Ok(guard)
    }

    fn task_mut(&mut self) -> OctResult<&mut Box<dyn OutputTask>> {
        self.task.as_mut().ok_or_else(|| OctError::ResourceLeak {
            device: self.device.clone(),
            detail: "output task used after release".into(),
        })
    }

    /// Configure the sample clock.
    pub fn configure_clock(&mut self, clock: &SampleClockConfig) -> OctResult<()> {
        let device = self.device.clone();
        self.task_mut()?
            .configure_timing_sample_clock(clock)
            .map_err(|e| OctError::device_configuration(device, "sample clock", e))
    }

    /// Write the buffer, starting generation when `auto_start` is set.
    pub async fn write(&mut self, frames: &VoltageFrames, auto_start: bool) -> OctResult<()> {
        let device = self.device.clone();
        self.task_mut()?
            .write(frames, auto_start)
            .await
            .map_err(|e| OctError::device_configuration(device, "write", e))
    }

    /// Start a written buffer.
    pub async fn start(&mut self) -> OctResult<()> {
        let device = self.device.clone();
        self.task_mut()?
            .start()
            .await
            .map_err(|e| OctError::device(device, "start", e))
    }

    /// Wait for generation to finish, at most `limit`.
    pub async fn wait_done(&mut self, limit: Duration) -> OctResult<()> {
        let device = self.device.clone();
        let task = self.task_mut()?;
        match tokio::time::timeout(limit, task.wait_until_done()).await {
            Ok(result) => result.map_err(|e| OctError::device(device, "wait until done", e)),
            Err(_) => Err(OctError::PositionerTimeout {
                device,
                waited: limit,
            }),
        }
    }

    /// Stop and close the task.
    pub fn close(mut self) -> OctResult<()> {
        match self.task.take() {
            Some(task) => release(&self.device, task),
            None => Ok(()),
        }
    }
}

fn release(device: &str, mut task: Box<dyn OutputTask>) -> OctResult<()> {
    let stopped = task
        .stop()
        .map_err(|e| OctError::device(device, "stop", e));
    let closed = task
        .close()
        .map_err(|e| OctError::device(device, "close", e));
    debug!(device, "output task released");
    stopped.and(closed)
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            warn!(device = %self.device, "output task released by guard");
            if let Err(e) = release(&self.device, task) {
                warn!(device = %self.device, error = %e, "output task release failed");
            }
        }
    }
}

impl std::fmt::Debug for TaskGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGuard")
            .field("device", &self.device)
            .field("open", &self.task.is_some())
            .finish()
    }
}

// =============================================================================
// Digitizer acquisitions
// =============================================================================

/// A running digitizer acquisition; aborted on drop unless completed.
pub struct AcquisitionGuard<'a> {
    digitizer: &'a dyn Digitizer,
    active: bool,
}

impl<'a> AcquisitionGuard<'a> {
    /// Initiate an acquisition.
    pub async fn initiate(digitizer: &'a dyn Digitizer) -> OctResult<Self> {
        digitizer
            .initiate_acquisition()
            .await
            .map_err(|e| OctError::device(digitizer.name(), "initiate", e))?;
        Ok(Self {
            digitizer,
            active: true,
        })
    }

    /// The acquisition completed; nothing to abort.
    pub fn complete(mut self) {
        self.active = false;
    }
}

impl Drop for AcquisitionGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            match self.digitizer.abort() {
                Ok(()) => debug!(device = self.digitizer.name(), "acquisition aborted by guard"),
                Err(e) => warn!(device = self.digitizer.name(), error = %e, "abort failed"),
            }
        }
    }
}
