//! Scheduler behavior against the mock digitizer and positioner: timeouts,
//! retries, exclusive sessions and resource release on every exit path.

mod common;

use common::{line_plan, scheduler, volume_plan, LASER_HZ};
use oct_core::data::FetchLayout;
use oct_core::error::OctError;
use oct_driver_mock::{
    CompletionBehavior, ErrorConfig, ErrorScenario, MockDigitizer, MockPositioner, TaskCompletion,
};
use oct_scan::plan::{ScanBounds, ScanPlan};

// =============================================================================
// Timeouts and retries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn acquisition_timeout_after_retries_releases_everything() {
    let (scheduler, digitizer, positioner) = scheduler(
        MockDigitizer::new("scope").with_completion(CompletionBehavior::Never),
        MockPositioner::new("galvo"),
        64,
    );

    let err = scheduler.single_scan(&line_plan()).await.unwrap_err();
    match &err {
        OctError::AcquisitionTimeout {
            device, attempts, ..
        } => {
            assert_eq!(device, "scope");
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected an acquisition timeout, got {other:?}"),
    }
    assert_eq!(err.failing_device(), Some("scope"));

    let stats = digitizer.stats();
    assert_eq!(stats.initiated, 3);
    assert_eq!(stats.aborted, 3);
    assert_eq!(stats.fetched, 0);
    assert!(!digitizer.is_acquiring());

    let ledger = positioner.ledger();
    assert_eq!(ledger.tasks_created, 3);
    assert_eq!(ledger.tasks_closed, 3);
    assert_eq!(ledger.double_closes, 0);
    assert_eq!(ledger.leaked, 0);
    assert_eq!(ledger.open_tasks, 0);

    // The devices are free again.
    assert!(scheduler.begin_session().is_ok());
}

#[tokio::test(start_paused = true)]
async fn stalled_acquisition_is_retried() {
    let (scheduler, digitizer, positioner) = scheduler(
        MockDigitizer::new("scope").with_completion(CompletionBehavior::StallFirst(1)),
        MockPositioner::new("galvo"),
        64,
    );

    let buffer = scheduler.single_scan(&line_plan()).await.unwrap();
    assert_eq!(buffer.dim().0, 1);

    let stats = digitizer.stats();
    assert_eq!(stats.initiated, 2);
    assert_eq!(stats.aborted, 1);
    assert_eq!(stats.fetched, 1);

    let ledger = positioner.ledger();
    assert_eq!(ledger.tasks_created, 2);
    assert_eq!(ledger.tasks_closed, 2);
    assert_eq!(ledger.leaked, 0);
    // Both scan writes wait for the trigger instead of starting on write.
    assert_eq!(ledger.writes.len(), 2);
    assert!(ledger.writes.iter().all(|w| !w.auto_start));
}

#[tokio::test(start_paused = true)]
async fn hanging_positioner_times_out_without_parking() {
    let (scheduler, _digitizer, positioner) = scheduler(
        MockDigitizer::new("scope"),
        MockPositioner::new("galvo").with_completion(TaskCompletion::Hang),
        64,
    );

    let err = scheduler.single_scan(&line_plan()).await.unwrap_err();
    assert!(matches!(err, OctError::PositionerTimeout { ref device, .. } if device == "galvo"));

    let ledger = positioner.ledger();
    assert_eq!(ledger.tasks_created, 1, "no park move after a positioner failure");
    assert_eq!(ledger.tasks_closed, 1);
    assert_eq!(ledger.leaked, 0);
}

#[tokio::test(start_paused = true)]
async fn park_after_final_timeout_starts_where_the_row_ended() {
    let (scheduler, digitizer, positioner) = scheduler(
        MockDigitizer::new("scope").with_completion(CompletionBehavior::Never),
        MockPositioner::new("galvo"),
        16,
    );

    let err = scheduler.volume_scan(&volume_plan(2)).await.unwrap_err();
    assert!(matches!(err, OctError::AcquisitionTimeout { attempts: 3, .. }), "{err}");
    assert!(!digitizer.is_acquiring());

    let ledger = positioner.ledger();
    let held = ledger
        .writes
        .iter()
        .rev()
        .find(|w| !w.auto_start)
        .and_then(|w| w.frames.last())
        .unwrap();
    let park = ledger.writes.last().unwrap();
    assert!(park.auto_start);
    let first = park.frames.samples[0];
    let step = (first[0] - held[0]).abs().max((first[1] - held[1]).abs());
    assert!(step < 0.2, "voltage step of {step} at park start");
    assert_eq!(ledger.output, [0.0, 0.0]);
    assert_eq!(ledger.leaked, 0);
    assert_eq!(ledger.open_tasks, 0);
}

#[tokio::test]
async fn failed_fetch_leaves_the_stage_where_it_stopped() {
    let (scheduler, _digitizer, positioner) = scheduler(
        MockDigitizer::new("scope").with_errors(ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "fetch",
        })),
        MockPositioner::new("galvo"),
        16,
    );

    let err = scheduler.volume_scan(&volume_plan(2)).await.unwrap_err();
    assert_eq!(err.failing_device(), Some("scope"));

    // The scan task was released mid-buffer, so no park is planned.
    let ledger = positioner.ledger();
    assert_eq!(ledger.writes.len(), 2);
    assert!(ledger.writes[0].auto_start);
    assert!(!ledger.writes[1].auto_start);
    assert_eq!(ledger.leaked, 0);
    assert_eq!(ledger.open_tasks, 0);
}

// =============================================================================
// Sessions and validation
// =============================================================================

#[tokio::test]
async fn second_session_is_refused() {
    let (scheduler, digitizer, positioner) = scheduler(
        MockDigitizer::new("scope"),
        MockPositioner::new("galvo"),
        64,
    );

    let held = scheduler.begin_session().unwrap();
    let err = scheduler.single_scan(&line_plan()).await.unwrap_err();
    assert!(matches!(err, OctError::SessionBusy));
    assert!(err.is_recoverable());
    assert_eq!(digitizer.stats().initiated, 0);
    assert_eq!(positioner.ledger().tasks_created, 0);

    drop(held);
    assert!(scheduler.single_scan(&line_plan()).await.is_ok());
}

#[tokio::test]
async fn out_of_range_path_is_rejected_before_hardware() {
    let (scheduler, digitizer, positioner) = scheduler(
        MockDigitizer::new("scope"),
        MockPositioner::new("galvo"),
        64,
    );
    let bounds = ScanBounds {
        x0: -1.0,
        y0: 0.0,
        xf: 8.0,
        yf: 0.0,
    };
    let plan = ScanPlan::from_bounds(bounds, 2.0, LASER_HZ, 4).unwrap();

    let err = scheduler.single_scan(&plan).await.unwrap_err();
    assert!(matches!(err, OctError::Configuration(ref m) if m.contains("ao0")), "{err}");
    assert_eq!(digitizer.stats().initiated, 0);
    assert_eq!(positioner.ledger().tasks_created, 0);
}

#[tokio::test]
async fn coerced_record_length_is_a_configuration_error() {
    let (scheduler, digitizer, positioner) = scheduler(
        MockDigitizer::new("scope").with_record_length_override(48),
        MockPositioner::new("galvo"),
        64,
    );

    let err = scheduler.single_scan(&line_plan()).await.unwrap_err();
    assert!(matches!(err, OctError::Configuration(ref m) if m.contains("48")), "{err}");
    assert_eq!(digitizer.stats().fetched, 0);
    assert!(!digitizer.is_acquiring());

    let ledger = positioner.ledger();
    assert_eq!(ledger.leaked, 0);
    assert_eq!(ledger.open_tasks, 0);
}

#[tokio::test]
async fn rejected_configuration_aborts_and_parks() {
    let (scheduler, digitizer, positioner) = scheduler(
        MockDigitizer::new("scope").with_errors(ErrorConfig::scenario(ErrorScenario::Reject {
            operation: "configure_trigger",
        })),
        MockPositioner::new("galvo"),
        16,
    );

    let err = scheduler.volume_scan(&volume_plan(2)).await.unwrap_err();
    match &err {
        OctError::DeviceConfiguration { device, stage, .. } => {
            assert_eq!(device, "scope");
            assert_eq!(stage, "trigger");
        }
        other => panic!("expected a configuration rejection, got {other:?}"),
    }
    assert!(!err.is_recoverable());
    assert_eq!(digitizer.stats().initiated, 0);

    // Moved to the start corner, then parked at the origin.
    let ledger = positioner.ledger();
    assert_eq!(ledger.tasks_created, 2);
    assert_eq!(ledger.leaked, 0);
    assert_eq!(ledger.output, [0.0, 0.0]);
    assert!(ledger.writes.iter().all(|w| w.auto_start));
}

// =============================================================================
// Buffers and layouts
// =============================================================================

#[tokio::test]
async fn single_scan_shape_and_span() {
    let plan = line_plan();
    let (scheduler, digitizer, _positioner) = scheduler(
        MockDigitizer::new("scope"),
        MockPositioner::new("galvo"),
        64,
    );

    let buffer = scheduler.single_scan(&plan).await.unwrap();
    let records = plan.num_records + 2 * plan.settle_samples;
    assert_eq!(buffer.dim(), (1, records, 64));
    assert_eq!(buffer.scan_span, 4..4 + plan.num_records);
    assert_eq!(buffer.scan_records().dim(), (1, plan.num_records, 64));
    assert_eq!(
        digitizer.configured_horizontal().unwrap().num_records,
        records
    );
}

#[tokio::test]
async fn fetch_layout_does_not_change_single_scan_data() {
    let mut buffers = Vec::new();
    for layout in [FetchLayout::RecordMajor, FetchLayout::SampleMajor] {
        let (scheduler, _digitizer, _positioner) = scheduler(
            MockDigitizer::new("scope").with_layout(layout),
            MockPositioner::new("galvo"),
            32,
        );
        buffers.push(scheduler.single_scan(&line_plan()).await.unwrap().into_data());
    }
    assert_eq!(buffers[0], buffers[1]);
}

#[tokio::test]
async fn fetch_layout_does_not_change_volume_data() {
    let mut buffers = Vec::new();
    for layout in [FetchLayout::RecordMajor, FetchLayout::SampleMajor] {
        let (scheduler, digitizer, positioner) = scheduler(
            MockDigitizer::new("scope").with_layout(layout),
            MockPositioner::new("galvo"),
            16,
        );
        let plan = volume_plan(4);
        let buffer = scheduler.volume_scan(&plan).await.unwrap();
        assert_eq!(buffer.dim(), (4, plan.num_records, 16));
        assert_eq!(digitizer.stats().fetched, 4);
        let ledger = positioner.ledger();
        assert_eq!(ledger.leaked, 0);
        assert_eq!(ledger.open_tasks, 0);
        buffers.push(buffer.into_data());
    }
    assert_eq!(buffers[0], buffers[1]);
}
