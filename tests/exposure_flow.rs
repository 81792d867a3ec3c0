mod common;

use common::{Bench, LAYER_HEIGHT_NM, finish, wait_for_state};
use resin_rs::errors::{ExposureError, FanId};
use resin_rs::exposure::estimate::TimingModel;
use resin_rs::exposure::resin::layer_volume_ml;
use resin_rs::exposure::stats::PrintStatistics;
use resin_rs::hardware::{Axis, Hardware};
use resin_rs::project::{LayerProfile, ManifestProjectStore, ProjectStore};
use resin_rs::simulator::SimEvent;
use resin_rs::state::{ExposureCheck, ExposureCheckResult};
use resin_rs::{ExposureState, PrinterWarning};
use std::collections::VecDeque;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

#[tokio::test(start_paused = true)]
async fn test_two_layer_print_finishes() {
    let bench = Bench::new(2);
    let exposure = bench.exposure();
    assert_ok!(exposure.read_project(&bench.project).await);
    assert_eq!(exposure.state(), ExposureState::Confirm);

    let project = ManifestProjectStore::new(None).open(&bench.project).await.unwrap();
    let timing = TimingModel::from_config(&bench.config);
    let peel = timing.layer_peel_move_time(LAYER_HEIGHT_NM, &LayerProfile::slow()).unwrap();
    let estimate = exposure.snapshot().estimated_total_time_ms;
    assert_eq!(estimate, timing.estimate_total_ms(&project).unwrap());
    assert_eq!(estimate, 2000 + 2 * peel + 2 * (1000 + 20 + 124));

    exposure.confirm_start().unwrap();
    wait_for_state(&exposure, ExposureState::PourInResin).await;
    exposure.confirm_resin_in().unwrap();
    assert_eq!(finish(&exposure).await, ExposureState::Finished);

    let data = exposure.snapshot();
    assert_eq!(data.actual_layer, 2);
    assert_eq!(data.slow_layers_done, 2);
    assert!(data.fatal_error.is_none());
    assert!(data.print_start_time.is_some() && data.print_end_time.is_some());
    assert_eq!(exposure.progress(), 1.0);
    assert_eq!(exposure.estimate_remaining_ms(), 0);
    for check in ExposureCheck::ALL {
        assert_eq!(data.check_results.get(&check), Some(&ExposureCheckResult::Success), "{:?}", check);
    }

    // Both layers large enough for the slow profile; only the last one is
    // peeled without moving the tower up
    let peels = bench.printer.peels();
    assert_eq!(peels.len(), 2);
    assert!(peels.iter().all(|(profile, _, _)| *profile == LayerProfile::slow()));
    assert_eq!(peels[0].1, 2 * LAYER_HEIGHT_NM);
    assert!(!peels[0].2);
    assert!(peels[1].2);

    assert!(!bench.printer.hw.fans_running());
    assert!(!bench.printer.image.is_counting_usage());
    assert!(bench.config.paths.previous_prints.join("numbers.toml").exists());
    assert!(bench.config.paths.last_project.exists());

    let stats = PrintStatistics::load(&bench.config.paths.statistics).unwrap();
    assert_eq!(stats.started_projects, 1);
    assert_eq!(stats.finished_projects, 1);
    assert_eq!(stats.layers, 2);

    exposure.acknowledge().unwrap();
    assert_eq!(exposure.state(), ExposureState::Done);
}

#[tokio::test(start_paused = true)]
async fn test_homing_skipped_when_axes_synced() {
    let bench = Bench::new(1);
    bench.printer.hw.tower().sync_and_wait(0).await.unwrap();
    bench.printer.hw.tilt().sync_and_wait(0).await.unwrap();
    let exposure = bench.exposure();
    exposure.read_project(&bench.project).await.unwrap();
    let mut states = exposure.subscribe();
    exposure.confirm_start().unwrap();
    wait_for_state(&exposure, ExposureState::PourInResin).await;
    let first = states.recv().await.unwrap();
    assert_eq!(first.field, "state");
    assert_eq!(first.value, serde_json::json!("POUR_IN_RESIN"));
    exposure.cancel().unwrap();
    assert_eq!(finish(&exposure).await, ExposureState::Canceled);
    assert!(exposure.snapshot().canceled);
}

#[tokio::test(start_paused = true)]
async fn test_not_uv_calibrated_fails_on_read() {
    let bench = Bench::with(2, |c| c.printer.uv_pwm_print = 0, |_| {});
    let exposure = bench.exposure();
    let err = exposure.read_project(&bench.project).await.unwrap_err();
    assert!(matches!(*err, ExposureError::NotUvCalibrated));
    let data = exposure.snapshot();
    assert_eq!(data.state, ExposureState::Failure);
    assert!(matches!(data.fatal_error.as_deref(), Some(ExposureError::NotUvCalibrated)));
    assert_err!(exposure.confirm_start());
}

#[tokio::test(start_paused = true)]
async fn test_missing_project_fails_on_read() {
    let bench = Bench::new(1);
    let exposure = bench.exposure();
    let missing = bench.dir.path().join("nope.toml");
    let err = exposure.read_project(&missing.to_string_lossy()).await.unwrap_err();
    assert!(matches!(*err, ExposureError::Project(_)));
    assert_eq!(exposure.state(), ExposureState::Failure);
}

#[tokio::test(start_paused = true)]
async fn test_resin_too_low_aborts_before_printing() {
    let bench = Bench::new(2);
    bench.printer.with_faults(|f| f.resin_volume_ml = 10.0);
    let exposure = bench.start().await;
    assert_eq!(finish(&exposure).await, ExposureState::Failure);

    let data = exposure.snapshot();
    assert!(matches!(data.fatal_error.as_deref(), Some(ExposureError::ResinTooLow { .. })));
    assert_eq!(data.check_results.get(&ExposureCheck::Resin), Some(&ExposureCheckResult::Failure));
    assert_eq!(data.actual_layer, 0);
    assert!(data.print_start_time.is_none());
    assert!(bench.printer.peels().is_empty());
    // Not a motion fault, the platform goes up
    assert!(bench.printer.events().contains(&SimEvent::TowerMove(bench.config.printer.tower_height_nm)));
}

#[tokio::test(start_paused = true)]
async fn test_resin_measurement_retried() {
    let bench = Bench::new(1);
    bench.printer.with_faults(|f| f.resin_measurements = VecDeque::from([0.0, 250.0]));
    let exposure = bench.start().await;
    assert_eq!(finish(&exposure).await, ExposureState::Finished);
    assert_eq!(exposure.snapshot().resin_volume_ml, Some(150.0));
}

#[tokio::test(start_paused = true)]
async fn test_fan_failure_aborts_checks() {
    let bench = Bench::new(1);
    bench.printer.with_faults(|f| f.failed_fans = vec![FanId::Blower]);
    let exposure = bench.start().await;
    assert_eq!(finish(&exposure).await, ExposureState::Failure);
    match exposure.snapshot().fatal_error.as_deref() {
        Some(ExposureError::FanFailed { fans }) => assert_eq!(fans, &vec![FanId::Blower]),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_fan_check_override() {
    let bench = Bench::with(1, |c| c.printer.fan_check_override = true, |_| {});
    bench.printer.with_faults(|f| f.failed_fans = vec![FanId::Rear]);
    let exposure = bench.start().await;
    let mut warnings = exposure.subscribe_warnings();
    assert_eq!(finish(&exposure).await, ExposureState::Finished);
    // Failed fans are reported once as an overheating warning while printing
    assert_eq!(
        warnings.recv().await.unwrap(),
        PrinterWarning::ExpectOverheating { fans: "Rear".to_string() }
    );
}

#[tokio::test(start_paused = true)]
async fn test_tower_start_position_failure() {
    let bench = Bench::new(1);
    bench.printer.with_faults(|f| f.tower_move_fails = true);
    let exposure = bench.start().await;
    assert_eq!(finish(&exposure).await, ExposureState::Failure);
    let data = exposure.snapshot();
    assert!(matches!(data.fatal_error.as_deref(), Some(ExposureError::TowerMoveFailed)));
    assert_eq!(
        data.check_results.get(&ExposureCheck::StartPositions),
        Some(&ExposureCheckResult::Failure)
    );
}

#[tokio::test(start_paused = true)]
async fn test_homing_failure() {
    let bench = Bench::new(1);
    bench.printer.with_faults(|f| f.tilt_home_failures = 10);
    let exposure = bench.exposure();
    exposure.read_project(&bench.project).await.unwrap();
    exposure.confirm_start().unwrap();
    assert_eq!(finish(&exposure).await, ExposureState::Failure);
    assert!(matches!(exposure.snapshot().fatal_error.as_deref(), Some(ExposureError::TiltHomeFailed)));
}

#[tokio::test(start_paused = true)]
async fn test_stuck_recovery_repeats_layer() {
    let bench = Bench::new(2);
    bench.printer.with_faults(|f| f.peel_failures = 1);
    let exposure = bench.start().await;

    wait_for_state(&exposure, ExposureState::Stuck).await;
    let data = exposure.snapshot();
    assert_eq!(data.actual_layer, 0);
    assert_eq!(data.tower_position_nm, LAYER_HEIGHT_NM);
    assert!(bench.printer.events().contains(&SimEvent::TiltReleased));

    exposure.continue_printing().unwrap();
    assert_eq!(finish(&exposure).await, ExposureState::Finished);
    assert_eq!(exposure.snapshot().actual_layer, 2);
    // The stuck layer is peeled again to the same target
    let peels = bench.printer.peels();
    assert_eq!(peels.len(), 3);
    assert_eq!(peels[0].1, peels[1].1);
}

#[tokio::test(start_paused = true)]
async fn test_stuck_back_fails_job() {
    let bench = Bench::new(2);
    bench.printer.with_faults(|f| f.peel_failures = 1);
    let exposure = bench.start().await;
    wait_for_state(&exposure, ExposureState::Stuck).await;
    exposure.back().unwrap();
    assert_eq!(finish(&exposure).await, ExposureState::Failure);

    let data = exposure.snapshot();
    assert!(matches!(data.fatal_error.as_deref(), Some(ExposureError::TiltFailed)));
    assert_eq!(data.actual_layer, 0);
    // Motion fault: the platform stays where it is
    assert!(!bench.printer.events().contains(&SimEvent::TowerMove(bench.config.printer.tower_height_nm)));
}

#[tokio::test(start_paused = true)]
async fn test_resin_low_feed_me_and_refill() {
    let bench = Bench::with(3, |_| {}, |m| m.used_material_ml = 1.0);
    bench.printer.with_faults(|f| {
        f.resin_volume_ml = 70.0;
        f.white_pixels = 250_000_000;
    });
    let exposure = bench.start().await;

    wait_for_state(&exposure, ExposureState::FeedMe).await;
    let used = layer_volume_ml(250_000_000, bench.config.printer.pixel_size_nm, LAYER_HEIGHT_NM);
    let data = exposure.snapshot();
    assert_eq!(data.actual_layer, 1);
    assert!(data.resin_low);
    assert_eq!(data.resin_remain_ml, Some(70.0 - used));

    exposure.continue_printing().unwrap();
    assert_eq!(finish(&exposure).await, ExposureState::Finished);

    let max = bench.config.resin.max_volume_ml;
    let data = exposure.snapshot();
    assert_eq!(data.resin_volume_ml, Some(max + used));
    assert!(!data.resin_low);
    assert!(bench.printer.events().contains(&SimEvent::Stir));
}

#[tokio::test(start_paused = true)]
async fn test_feedme_command_without_refill() {
    let bench = Bench::new(4);
    bench.printer.with_faults(|f| f.white_pixels = 1000);
    let exposure = bench.start().await;
    wait_for_state(&exposure, ExposureState::Printing).await;
    exposure.feedme().unwrap();
    wait_for_state(&exposure, ExposureState::FeedMe).await;
    let volume = exposure.snapshot().resin_volume_ml;
    exposure.back().unwrap();
    assert_eq!(finish(&exposure).await, ExposureState::Finished);
    assert_eq!(exposure.snapshot().resin_volume_ml, volume);
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_layer_until_continue() {
    let bench = Bench::new(5);
    let exposure = bench.start().await;
    wait_for_state(&exposure, ExposureState::Printing).await;
    exposure.pause().unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    let paused_at = exposure.snapshot().actual_layer;
    assert!(paused_at < 5);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(exposure.snapshot().actual_layer, paused_at);
    assert_eq!(exposure.state(), ExposureState::Printing);

    exposure.continue_printing().unwrap();
    assert_eq!(finish(&exposure).await, ExposureState::Finished);
    assert_eq!(exposure.snapshot().actual_layer, 5);
}

#[tokio::test(start_paused = true)]
async fn test_first_layer_waits_after_stirring_check() {
    let bench = Bench::with(1, |c| c.printer.stirring_delay_ms = 600_000, |_| {});
    let exposure = bench.start().await;
    wait_for_state(&exposure, ExposureState::Printing).await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(!bench.printer.events().contains(&SimEvent::Blit));

    assert_eq!(finish(&exposure).await, ExposureState::Finished);
    assert!(bench.printer.events().contains(&SimEvent::Blit));
    assert_eq!(
        exposure.snapshot().check_results.get(&ExposureCheck::Stirring),
        Some(&ExposureCheckResult::Success)
    );
}

#[tokio::test(start_paused = true)]
async fn test_periodic_up_and_down() {
    let bench = Bench::with(
        4,
        |c| {
            c.printer.up_and_down_every_layer = 2;
            c.printer.up_and_down_z_offset_nm = 10_000;
        },
        |_| {},
    );
    let exposure = bench.start().await;
    assert_eq!(finish(&exposure).await, ExposureState::Finished);

    let top = bench.config.printer.tower_height_nm;
    let events = bench.printer.events();
    let tops = events.iter().filter(|e| **e == SimEvent::TowerMove(top)).count();
    // Once after the second layer and once at the end
    assert_eq!(tops, 2);
    let after_top = events
        .iter()
        .skip_while(|e| **e != SimEvent::TowerMove(top))
        .skip(1)
        .find(|e| matches!(e, SimEvent::TowerMove(_)));
    assert_eq!(after_top, Some(&SimEvent::TowerMove(3 * LAYER_HEIGHT_NM + 10_000)));
}

#[tokio::test(start_paused = true)]
async fn test_injected_tower_failure() {
    let bench = Bench::new(10);
    let exposure = bench.start().await;
    wait_for_state(&exposure, ExposureState::Printing).await;
    exposure.inject_fatal_error().unwrap();
    assert_eq!(finish(&exposure).await, ExposureState::Failure);
    assert!(matches!(exposure.snapshot().fatal_error.as_deref(), Some(ExposureError::TowerFailed)));
}

#[tokio::test(start_paused = true)]
async fn test_calibration_regions_blanked() {
    let bench = Bench::with(
        1,
        |_| {},
        |m| {
            m.calibrate_regions = 4;
            m.calibrate_time_ms = 500;
        },
    );
    let exposure = bench.start().await;
    assert_eq!(finish(&exposure).await, ExposureState::Finished);
    let blanked: Vec<SimEvent> = bench
        .printer
        .events()
        .into_iter()
        .filter(|e| matches!(e, SimEvent::BlankArea { .. }))
        .collect();
    assert_eq!(blanked.len(), 4);
    assert_eq!(blanked[3], SimEvent::BlankArea { index: 3, last: true });
}

#[tokio::test(start_paused = true)]
async fn test_overheat_waits_for_cool_down() {
    let bench = Bench::new(2);
    bench.printer.with_faults(|f| f.uv_overheat = true);
    let exposure = bench.start().await;

    wait_for_state(&exposure, ExposureState::CoolingDown).await;
    assert_eq!(bench.printer.hw.power_led().mode(), resin_rs::hardware::PowerLedMode::Error);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(exposure.state(), ExposureState::CoolingDown);
    assert_eq!(exposure.snapshot().actual_layer, 0);
    assert!(bench.printer.events().contains(&SimEvent::Beep));

    bench.printer.with_faults(|f| f.uv_overheat = false);
    assert_eq!(finish(&exposure).await, ExposureState::Finished);
    assert_eq!(bench.printer.hw.power_led().mode(), resin_rs::hardware::PowerLedMode::Normal);
}
