//! Calibration mode against the simulated ASM.

mod common;

use common::{simulated_server, wait_for, within};
use mb_driver_asm::{AcquisitionServer, AsmError};

const LOOP_START: &str = "/scan/start_calibration_loop";

/// Listener counts of every attribute the calibration loop follows.
fn trigger_listeners(server: &AcquisitionServer) -> Vec<(&'static str, usize)> {
    let scanner = server.scanner();
    let descanner = server.descanner();
    vec![
        ("descanner rotation", descanner.rotation().listener_count()),
        ("descanner scanOffset", descanner.scan_offset().listener_count()),
        ("descanner scanGain", descanner.scan_gain().listener_count()),
        ("scanner dwellTime", scanner.dwell_time().listener_count()),
        ("scanner rotation", scanner.rotation().listener_count()),
        ("scanner scanDelay", scanner.scan_delay().listener_count()),
        ("scanner scanOffset", scanner.scan_offset().listener_count()),
        ("scanner scanGain", scanner.scan_gain().listener_count()),
        (
            "mppc cellCompleteResolution",
            server.mppc().cell_complete_resolution().listener_count(),
        ),
    ]
}

fn assert_listeners(server: &AcquisitionServer, expected: usize) {
    for (name, count) in trigger_listeners(server) {
        assert_eq!(count, expected, "listeners on {}", name);
    }
}

#[tokio::test]
async fn entering_and_leaving_calibration_mode() {
    let (asm, server) = simulated_server().await;
    let scanner = server.scanner();
    let descanner = server.descanner();
    scanner.scan_gain().set((0.5, -0.5)).unwrap();

    assert_listeners(&server, 0);

    within(server.set_calibration_mode(true)).await.unwrap();
    assert!(server.calibration_mode().get());
    assert_listeners(&server, 1);
    assert_eq!(scanner.scan_gain().get(), (1.0, 1.0));
    assert_eq!(descanner.scan_gain().get(), (1.0, 0.0));

    let running = asm.calibration_loop().expect("calibration loop should run");
    assert_eq!(server.calibration_parameters(), Some(running.clone()));
    assert_eq!(running.dwell_time, scanner.ticks_dwell_time());
    assert_eq!(running.x_descan_offset, 4000);
    assert!(running.y_descan_setpoints.iter().all(|&v| v == 0));
    assert_eq!(running.x_scan_setpoints.len(), 9000);

    // Entering twice is a no-op.
    within(server.set_calibration_mode(true)).await.unwrap();
    assert_eq!(asm.request_count(LOOP_START), 1);
    assert_listeners(&server, 1);

    within(server.set_calibration_mode(false)).await.unwrap();
    assert!(!server.calibration_mode().get());
    assert!(asm.calibration_loop().is_none());
    assert!(server.calibration_parameters().is_none());
    assert_listeners(&server, 0);
    assert_eq!(scanner.scan_gain().get(), (1.0, 1.0));
    assert_eq!(descanner.scan_gain().get(), (1.0, 1.0));
    server.terminate().await;
}

#[tokio::test]
async fn configuration_changes_restart_the_loop() {
    let (asm, server) = simulated_server().await;
    within(server.set_calibration_mode(true)).await.unwrap();
    let before = asm.calibration_loop().unwrap();

    server.scanner().dwell_time().set(8e-7).unwrap();
    wait_for("calibration loop restart", || {
        asm.calibration_loop()
            .is_some_and(|running| running.dwell_time != before.dwell_time)
    })
    .await;
    let after = asm.calibration_loop().unwrap();
    assert_eq!(after.dwell_time, 4);
    assert!(after.x_descan_setpoints.len() > before.x_descan_setpoints.len());

    server.descanner().scan_offset().set((1000, 2000)).unwrap();
    wait_for("descan offset in loop", || {
        asm.calibration_loop()
            .is_some_and(|running| running.x_descan_offset == 1000)
    })
    .await;
    wait_for("parameters to follow", || {
        server
            .calibration_parameters()
            .is_some_and(|parameters| parameters.y_descan_offset == 2000)
    })
    .await;

    within(server.set_calibration_mode(false)).await.unwrap();
    let starts = asm.request_count(LOOP_START);
    server.scanner().dwell_time().set(1e-6).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(asm.request_count(LOOP_START), starts);
    server.terminate().await;
}

#[tokio::test]
async fn calibration_removes_data_subscribers() {
    let (asm, server) = simulated_server().await;
    let data = server.mppc().data();
    data.subscribe(|_| {}).unwrap();
    wait_for("mega-field to open", || asm.open_megafield().is_some()).await;

    within(server.set_calibration_mode(true)).await.unwrap();
    assert_eq!(data.listener_count(), 0);
    wait_for("mega-field to close", || asm.open_megafield().is_none()).await;

    within(server.set_calibration_mode(false)).await.unwrap();
    server.terminate().await;
}

#[tokio::test]
async fn out_of_band_frequency_leaves_calibration_off() {
    let (asm, server) = simulated_server().await;
    let scanner = server.scanner();
    scanner.dwell_time().set(1e-4).unwrap();
    scanner.scan_gain().set((0.25, 0.25)).unwrap();

    let err = within(server.set_calibration_mode(true)).await.unwrap_err();
    assert!(matches!(err, AsmError::Configuration(_)));
    assert!(!server.calibration_mode().get());
    assert!(asm.calibration_loop().is_none());
    assert_listeners(&server, 0);
    assert_eq!(scanner.scan_gain().get(), (0.25, 0.25));
    assert_eq!(server.descanner().scan_gain().get(), (10.0, 10.0));
    server.terminate().await;
}

#[tokio::test]
async fn terminate_leaves_calibration_mode() {
    let (asm, server) = simulated_server().await;
    within(server.set_calibration_mode(true)).await.unwrap();
    within(server.terminate()).await;
    assert!(!server.calibration_mode().get());
    assert!(asm.calibration_loop().is_none());
}
