//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use oct_core::timing::{
    DigitizerSetup, HorizontalTiming, PositionerSetup, PositioningClock, TriggerConfig,
    VerticalConfig, VoltageChannelSpec,
};
use oct_driver_mock::{MockDigitizer, MockPositioner};
use oct_scan::plan::{ScanBounds, ScanPlan};
use oct_scan::scheduler::{DeviceBank, Scheduler, SchedulerSettings, WaitPolicies, WaitPolicy};
use std::sync::Arc;
use std::time::Duration;

pub const LASER_HZ: f64 = 1000.0;

fn vertical(channel: &str) -> VerticalConfig {
    VerticalConfig {
        channel: channel.into(),
        range: 2.0,
        offset: 0.0,
        coupling: Default::default(),
        probe_attenuation: 1.0,
        enabled: true,
    }
}

fn output(name: &str) -> VoltageChannelSpec {
    VoltageChannelSpec {
        physical_channel: name.into(),
        min_voltage: -5.0,
        max_voltage: 5.0,
    }
}

/// Settings for `samples` samples per record with quick waits.
pub fn settings(samples: usize) -> SchedulerSettings {
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
        waits: WaitPolicies {
            acquisition: WaitPolicy::new(Duration::from_millis(10), Duration::from_millis(200)),
            positioner_timeout: Duration::from_secs(1),
            fetch_timeout: Duration::from_secs(1),
            max_acquisition_retries: 2,
        },
    }
}

/// Scheduler over the given mocks, returning handles for assertions.
pub fn scheduler(
    digitizer: MockDigitizer,
    positioner: MockPositioner,
    samples: usize,
) -> (Scheduler, Arc<MockDigitizer>, Arc<MockPositioner>) {
    let digitizer = Arc::new(digitizer);
    let positioner = Arc::new(positioner);
    let scheduler = Scheduler::new(
        DeviceBank::new(digitizer.clone(), positioner.clone()),
        settings(samples),
    );
    (scheduler, digitizer, positioner)
}

pub fn line_plan() -> ScanPlan {
    let bounds = ScanBounds {
        x0: -1.0,
        y0: 0.0,
        xf: 1.0,
        yf: 0.0,
    };
    ScanPlan::from_bounds(bounds, 5.0, LASER_HZ, 4).unwrap()
}

pub fn volume_plan(tomograms: usize) -> ScanPlan {
    let bounds = ScanBounds {
        x0: -1.0,
        y0: -0.5,
        xf: 1.0,
        yf: 0.5,
    };
    ScanPlan::volume(bounds, 3.0, LASER_HZ, tomograms).unwrap()
}
