//! Mock galvanometer positioner (two analog output channels).
//!
//! Every task the positioner hands out reports into a shared
//! [`PositionerLedger`], so tests can check how many tasks were created,
//! closed, closed twice or dropped while still open, and which voltages the
//! outputs were left holding.

use async_trait::async_trait;
use oct_core::capabilities::{OutputTask, Positioner};
use oct_core::data::VoltageFrames;
use oct_core::error::{DriverError, DriverErrorKind, DriverResult};
use oct_core::timing::{SampleClockConfig, SampleMode, VoltageChannelSpec};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

use crate::common::{ErrorConfig, MockMode, TimingConfig};

const DRIVER: &str = "mock_positioner";

/// How `wait_until_done` resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskCompletion {
    /// Resolve immediately.
    #[default]
    Immediate,
    /// Resolve once the buffer would have been output at the clock rate.
    Paced,
    /// Never resolve.
    Hang,
}

/// One buffer written to a task.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Task that received the write.
    pub task_id: u32,
    /// Written samples.
    pub frames: VoltageFrames,
    /// Whether generation started with the write.
    pub auto_start: bool,
    /// Clock in force at write time.
    pub clock: SampleClockConfig,
}

/// Shared bookkeeping across all tasks of one positioner.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionerLedger {
    /// Tasks handed out.
    pub tasks_created: u32,
    /// Tasks closed (first close only).
    pub tasks_closed: u32,
    /// `close` calls on an already closed task.
    pub double_closes: u32,
    /// Tasks dropped without `close`.
    pub leaked: u32,
    /// Tasks currently open.
    pub open_tasks: u32,
    /// Generations started.
    pub starts: u32,
    /// `stop` calls on a running task.
    pub stops: u32,
    /// Every accepted write, in order.
    pub writes: Vec<WriteRecord>,
    /// Voltages the outputs currently hold.
    pub output: [f64; 2],
}

/// Simulated positioner.
pub struct MockPositioner {
    name: String,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    completion: TaskCompletion,
    ledger: Arc<Mutex<PositionerLedger>>,
}

impl MockPositioner {
    /// Instant-mode positioner whose tasks finish immediately.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: MockMode::Instant,
            timing: TimingConfig::default(),
            errors: ErrorConfig::none(),
            completion: TaskCompletion::Immediate,
            ledger: Arc::new(Mutex::new(PositionerLedger::default())),
        }
    }

    /// Set the operational mode. Timed modes pace task completion.
    pub fn with_mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        if mode.is_timed() {
            self.timing = TimingConfig::positioner();
            self.completion = TaskCompletion::Paced;
        }
        self
    }

    /// Inject failures.
    pub fn with_errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = errors;
        self
    }

    /// Override how tasks finish.
    pub fn with_completion(mut self, completion: TaskCompletion) -> Self {
        self.completion = completion;
        self
    }

    /// Snapshot of the shared ledger.
    pub fn ledger(&self) -> PositionerLedger {
        self.ledger.lock().clone()
    }
}

impl Positioner for MockPositioner {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_task(&self) -> DriverResult<Box<dyn OutputTask>> {
        self.errors.check_operation(DRIVER, "create_task")?;
        let id = {
            let mut ledger = self.ledger.lock();
            ledger.tasks_created += 1;
            ledger.open_tasks += 1;
            ledger.tasks_created
        };
        tracing::trace!(device = %self.name, task = id, "output task created");
        Ok(Box::new(MockOutputTask {
            id,
            mode: self.mode,
            timing: self.timing,
            errors: self.errors.clone(),
            completion: self.completion,
            ledger: Arc::clone(&self.ledger),
            channels: Vec::new(),
            clock: None,
            frames: None,
            started_at: None,
            running: false,
            finished: false,
            closed: false,
        }))
    }
}

struct MockOutputTask {
    id: u32,
    mode: MockMode,
    timing: TimingConfig,
    errors: ErrorConfig,
    completion: TaskCompletion,
    ledger: Arc<Mutex<PositionerLedger>>,
    channels: Vec<VoltageChannelSpec>,
    clock: Option<SampleClockConfig>,
    frames: Option<VoltageFrames>,
    started_at: Option<Instant>,
    running: bool,
    finished: bool,
    closed: bool,
}

impl MockOutputTask {
    fn invalid_state(message: impl Into<String>) -> DriverError {
        DriverError::new(DRIVER, DriverErrorKind::InvalidState, message)
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.closed {
            return Err(Self::invalid_state("task is closed"));
        }
        Ok(())
    }

    fn begin(&mut self) {
        self.running = true;
        self.finished = false;
        self.started_at = Some(Instant::now());
        self.ledger.lock().starts += 1;
    }

    fn finish(&mut self) {
        self.running = false;
        self.finished = true;
        if let Some(last) = self.frames.as_ref().and_then(VoltageFrames::last) {
            self.ledger.lock().output = last;
        }
    }

    /// Sample being output right now, judged by elapsed time.
    fn current_sample(&self) -> Option<[f64; 2]> {
        let frames = self.frames.as_ref()?;
        let clock = self.clock.as_ref()?;
        let elapsed = self.started_at?.elapsed().as_secs_f64();
        let index = ((elapsed * clock.rate_hz) as usize).min(frames.samples.len().saturating_sub(1));
        frames.samples.get(index).copied()
    }

    fn check_limits(&self, frames: &VoltageFrames) -> DriverResult<()> {
        for (i, sample) in frames.samples.iter().enumerate() {
            for (axis, spec) in self.channels.iter().enumerate() {
                if !spec.contains(sample[axis]) {
                    return Err(DriverError::new(
                        DRIVER,
                        DriverErrorKind::InvalidParameter,
                        format!(
                            "sample {} on {} is {} V, outside [{}, {}]",
                            i, spec.physical_channel, sample[axis], spec.min_voltage, spec.max_voltage
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OutputTask for MockOutputTask {
    fn create_voltage_channel(&mut self, spec: &VoltageChannelSpec) -> DriverResult<()> {
        self.ensure_open()?;
        self.errors.check_operation(DRIVER, "create_voltage_channel")?;
        if self.channels.len() == 2 {
            return Err(Self::invalid_state("task already has two channels"));
        }
        self.channels.push(spec.clone());
        Ok(())
    }

    fn configure_timing_sample_clock(&mut self, clock: &SampleClockConfig) -> DriverResult<()> {
        self.ensure_open()?;
        self.errors
            .check_operation(DRIVER, "configure_timing_sample_clock")?;
        if clock.rate_hz.is_nan() || clock.rate_hz <= 0.0 {
            return Err(DriverError::new(
                DRIVER,
                DriverErrorKind::InvalidParameter,
                format!("sample clock rate {} Hz is invalid", clock.rate_hz),
            ));
        }
        self.clock = Some(clock.clone());
        Ok(())
    }

    async fn write(&mut self, frames: &VoltageFrames, auto_start: bool) -> DriverResult<()> {
        if self.mode.is_timed() {
            tokio::time::sleep(self.timing.command_delay()).await;
        }
        self.ensure_open()?;
        self.errors.check_operation(DRIVER, "write")?;
        if self.channels.len() != 2 {
            return Err(Self::invalid_state("both axis channels must exist before write"));
        }
        let clock = self
            .clock
            .clone()
            .ok_or_else(|| Self::invalid_state("sample clock not configured"))?;
        if self.running {
            return Err(Self::invalid_state("cannot write while generating"));
        }
        if clock.sample_mode == SampleMode::Finite
            && frames.samples_per_channel() != clock.samples_per_channel
        {
            return Err(DriverError::new(
                DRIVER,
                DriverErrorKind::InvalidParameter,
                format!(
                    "wrote {} samples per channel, clock expects {}",
                    frames.samples_per_channel(),
                    clock.samples_per_channel
                ),
            ));
        }
        self.check_limits(frames)?;

        self.frames = Some(frames.clone());
        self.ledger.lock().writes.push(WriteRecord {
            task_id: self.id,
            frames: frames.clone(),
            auto_start,
            clock,
        });
        if auto_start {
            self.begin();
        }
        Ok(())
    }

    async fn start(&mut self) -> DriverResult<()> {
        self.ensure_open()?;
        self.errors.check_operation(DRIVER, "start")?;
        if self.frames.is_none() {
            return Err(Self::invalid_state("nothing written"));
        }
        if self.running {
            return Err(Self::invalid_state("task already running"));
        }
        self.begin();
        Ok(())
    }

    async fn wait_until_done(&mut self) -> DriverResult<()> {
        self.ensure_open()?;
        self.errors.check_operation(DRIVER, "wait_until_done")?;
        if self.finished {
            return Ok(());
        }
        if !self.running {
            return Err(Self::invalid_state("task was never started"));
        }
        match self.completion {
            TaskCompletion::Immediate => {}
            TaskCompletion::Paced => {
                let total = self
                    .clock
                    .as_ref()
                    .map(SampleClockConfig::generation_time)
                    .unwrap_or_default();
                let elapsed = self.started_at.map(|t| t.elapsed()).unwrap_or_default();
                tokio::time::sleep(total.saturating_sub(elapsed)).await;
            }
            TaskCompletion::Hang => std::future::pending::<()>().await,
        }
        self.finish();
        Ok(())
    }

    fn stop(&mut self) -> DriverResult<()> {
        self.ensure_open()?;
        if self.running {
            let held = if self.completion == TaskCompletion::Immediate {
                self.frames.as_ref().and_then(VoltageFrames::last)
            } else {
                self.current_sample()
            };
            self.running = false;
            let mut ledger = self.ledger.lock();
            ledger.stops += 1;
            if let Some(held) = held {
                ledger.output = held;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        let mut ledger = self.ledger.lock();
        if self.closed {
            ledger.double_closes += 1;
            return Err(Self::invalid_state("task already closed"));
        }
        self.closed = true;
        self.running = false;
        ledger.tasks_closed += 1;
        ledger.open_tasks = ledger.open_tasks.saturating_sub(1);
        Ok(())
    }
}

impl Drop for MockOutputTask {
    fn drop(&mut self) {
        if !self.closed {
            let mut ledger = self.ledger.lock();
            ledger.leaked += 1;
            ledger.open_tasks = ledger.open_tasks.saturating_sub(1);
            tracing::warn!(task = self.id, "output task dropped without close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str) -> VoltageChannelSpec {
        VoltageChannelSpec {
            physical_channel: name.into(),
            min_voltage: -5.0,
            max_voltage: 5.0,
        }
    }

    fn frames(values: &[[f64; 2]]) -> VoltageFrames {
        VoltageFrames {
            samples: values.to_vec(),
        }
    }

    async fn configured(positioner: &MockPositioner, samples: usize) -> Box<dyn OutputTask> {
        let mut task = positioner.create_task().unwrap();
        task.create_voltage_channel(&channel("ao0")).unwrap();
        task.create_voltage_channel(&channel("ao1")).unwrap();
        task.configure_timing_sample_clock(&SampleClockConfig::finite(
            "OnboardClock",
            1000.0,
            samples,
        ))
        .unwrap();
        task
    }

    #[tokio::test]
    async fn write_start_wait_close() {
        let positioner = MockPositioner::new("galvo");
        let mut task = configured(&positioner, 2).await;
        task.write(&frames(&[[0.0, 0.0], [1.0, -1.0]]), false)
            .await
            .unwrap();
        assert_eq!(positioner.ledger().starts, 0);
        task.start().await.unwrap();
        task.wait_until_done().await.unwrap();
        task.close().unwrap();

        let ledger = positioner.ledger();
        assert_eq!(ledger.output, [1.0, -1.0]);
        assert_eq!(ledger.tasks_closed, 1);
        assert_eq!(ledger.open_tasks, 0);
        assert!(!ledger.writes[0].auto_start);
    }

    #[tokio::test]
    async fn out_of_range_write_is_rejected_before_output() {
        let positioner = MockPositioner::new("galvo");
        let mut task = configured(&positioner, 1).await;
        let err = task.write(&frames(&[[6.0, 0.0]]), true).await.unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidParameter);
        assert!(positioner.ledger().writes.is_empty());
        assert_eq!(positioner.ledger().output, [0.0, 0.0]);
        task.close().unwrap();
    }

    #[tokio::test]
    async fn sample_count_must_match_clock() {
        let positioner = MockPositioner::new("galvo");
        let mut task = configured(&positioner, 3).await;
        assert!(task.write(&frames(&[[0.0, 0.0]]), false).await.is_err());
        task.close().unwrap();
    }

    #[tokio::test]
    async fn double_close_and_leak_are_counted() {
        let positioner = MockPositioner::new("galvo");
        let mut task = positioner.create_task().unwrap();
        task.close().unwrap();
        assert!(task.close().is_err());
        drop(task);

        let leaked = positioner.create_task().unwrap();
        drop(leaked);

        let ledger = positioner.ledger();
        assert_eq!(ledger.tasks_created, 2);
        assert_eq!(ledger.tasks_closed, 1);
        assert_eq!(ledger.double_closes, 1);
        assert_eq!(ledger.leaked, 1);
        assert_eq!(ledger.open_tasks, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn paced_completion_waits_for_generation_time() {
        let positioner = MockPositioner::new("galvo").with_completion(TaskCompletion::Paced);
        let mut task = configured(&positioner, 500).await;
        let samples = vec![[0.5, 0.5]; 500];
        task.write(&frames(&samples), true).await.unwrap();
        let started = Instant::now();
        task.wait_until_done().await.unwrap();
        assert!(started.elapsed() >= std::time::Duration::from_millis(500));
        task.close().unwrap();
    }
}
