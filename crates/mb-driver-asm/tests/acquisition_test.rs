//! End-to-end acquisitions against the simulated ASM.

mod common;

use common::{simulated_server, wait_for, within};
use mb_core::data::{MD_FIELD_POSITION, MD_HW_NAME};
use mb_driver_asm::simulator::THUMBNAIL_SIZE;
use mb_driver_asm::{AsmError, DataContent, SequencerState};
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn single_field_with_every_content() {
    let (asm, server) = simulated_server().await;
    let mppc = server.mppc();
    let data = mppc.data();

    let empty = within(data.get_with(DataContent::Empty, (0, 0))).await.unwrap();
    assert_eq!(empty.shape(), (1, 1));
    assert_eq!(empty.metadata[MD_FIELD_POSITION], json!([0, 0]));

    let thumbnail = within(data.get_with(DataContent::Thumbnail, (0, 0)))
        .await
        .unwrap();
    assert_eq!(thumbnail.shape(), (THUMBNAIL_SIZE as usize, THUMBNAIL_SIZE as usize));
    assert_eq!(thumbnail.bit_depth, 8);

    server.scanner().resolution().set((160, 160)).unwrap();
    let full = within(data.get_with(DataContent::Full, (1, 2))).await.unwrap();
    assert_eq!(full.shape(), (160, 160));
    assert_eq!(full.bit_depth, 16);
    assert_eq!(full.metadata[MD_FIELD_POSITION], json!([160, 320]));
    assert_eq!(full.metadata[MD_HW_NAME], json!("ASM, MPPC"));

    // Every single field acquisition closes its mega-field.
    wait_for("mega-field to close", || asm.open_megafield().is_none()).await;
    assert_eq!(asm.request_count("/scan/start_mega_field"), 3);
    assert_eq!(asm.request_count("/scan/field"), 2);
    server.terminate().await;
}

#[tokio::test]
async fn get_uses_the_data_content_attribute() {
    let (_asm, server) = simulated_server().await;
    server.mppc().data_content().set(DataContent::Thumbnail).unwrap();
    let image = within(server.mppc().data().get()).await.unwrap();
    assert_eq!(image.width, THUMBNAIL_SIZE);
    server.terminate().await;
}

#[tokio::test]
async fn streaming_delivers_fields_in_order() {
    let (asm, server) = simulated_server().await;
    let data = server.mppc().data();

    let (sender, mut images) = mpsc::unbounded_channel();
    let id = data
        .subscribe(move |image| {
            let _ = sender.send(image.metadata[MD_FIELD_POSITION].clone());
        })
        .unwrap();

    let resolution = server.scanner().resolution().get();
    let mut expected = Vec::new();
    for x in 0..3_u32 {
        for y in 0..4_u32 {
            data.next((x, y)).unwrap();
            expected.push(json!([x * resolution.0, y * resolution.1]));
        }
    }

    let mut received = Vec::new();
    for _ in 0..expected.len() {
        received.push(within(images.recv()).await.unwrap());
    }
    assert_eq!(received, expected);
    let scanned: Vec<_> = asm
        .scanned_fields()
        .iter()
        .map(|field| json!([field.position_x, field.position_y]))
        .collect();
    assert_eq!(scanned, expected);
    assert!(asm.open_megafield().is_some());

    assert!(data.unsubscribe(id));
    assert!(!data.unsubscribe(id));
    wait_for("mega-field to close", || asm.open_megafield().is_none()).await;
    server.terminate().await;
}

#[tokio::test]
async fn single_field_is_refused_while_streaming() {
    let (asm, server) = simulated_server().await;
    let data = server.mppc().data();
    let id = data.subscribe(|_| {}).unwrap();
    wait_for("mega-field to open", || asm.open_megafield().is_some()).await;

    asm.clear_requests();
    let err = data.get_with(DataContent::Thumbnail, (0, 0)).await.unwrap_err();
    assert!(matches!(err, AsmError::AcquisitionBusy { listeners: 1 }));
    assert!(asm.requests().is_empty());

    data.unsubscribe(id);
    server.terminate().await;
}

#[tokio::test]
async fn cell_parameters_are_sent_row_major() {
    let (asm, server) = simulated_server().await;
    let mppc = server.mppc();

    let gains: Vec<Vec<f64>> = (0..8)
        .map(|row| (0..8).map(|col| f64::from(row * 8 + col) / 10.0).collect())
        .collect();
    mppc.cell_digital_gain().set(gains).unwrap();
    mppc.filename().set("row_major".to_string()).unwrap();

    let id = mppc.data().subscribe(|_| {}).unwrap();
    wait_for("mega-field to open", || asm.open_megafield().is_some()).await;
    let megafield = asm.open_megafield().unwrap();
    assert_eq!(megafield.mega_field_id, "row_major");
    assert_eq!(megafield.storage_directory, "/images");
    let sent: Vec<f64> = megafield
        .cell_parameters
        .iter()
        .map(|cell| cell.digital_gain)
        .collect();
    let expected: Vec<f64> = (0..64).map(|i| f64::from(i) / 10.0).collect();
    assert_eq!(sent, expected);

    mppc.data().unsubscribe(id);
    server.terminate().await;
}

#[tokio::test]
async fn failed_field_stops_the_worker_until_next_start() {
    let (asm, server) = simulated_server().await;
    let mppc = server.mppc();

    asm.fail_endpoint("/scan/scan_field", 500);
    let err = within(mppc.data().get_with(DataContent::Empty, (0, 0)))
        .await
        .unwrap_err();
    assert!(matches!(err, AsmError::WorkerStopped));
    wait_for("worker to end", || {
        mppc.acquisition_state() == SequencerState::Terminated
    })
    .await;
    assert!(asm.open_megafield().is_none());

    asm.clear_failures();
    let image = within(mppc.data().get_with(DataContent::Empty, (0, 0))).await;
    assert!(image.is_ok());
    server.terminate().await;
}

#[tokio::test]
async fn cancel_drops_queued_fields() {
    let asm = std::sync::Arc::new(
        mb_driver_asm::SimulatedAsm::new().with_scan_delay(std::time::Duration::from_millis(20)),
    );
    let server = common::server_with(asm.clone(), common::test_config()).await;
    let data = server.mppc().data();

    let _id = data.subscribe(|_| {}).unwrap();
    for x in 0..50 {
        data.next((x, 0)).unwrap();
    }
    wait_for("first field", || !asm.scanned_fields().is_empty()).await;

    within(server.mppc().cancel_acquisition()).await.unwrap();
    assert_eq!(server.mppc().sequencer().pending(), 0);
    wait_for("mega-field to close", || asm.open_megafield().is_none()).await;
    assert!(asm.scanned_fields().len() < 50);
    server.terminate().await;
}

#[tokio::test]
async fn terminated_worker_restarts_on_next_acquisition() {
    let (_asm, server) = simulated_server().await;
    let mppc = server.mppc();

    within(mppc.data().get_with(DataContent::Empty, (0, 0))).await.unwrap();
    within(mppc.terminate()).await;
    assert_eq!(mppc.acquisition_state(), SequencerState::Terminated);
    assert!(!mppc.sequencer().is_worker_alive());

    within(mppc.data().get_with(DataContent::Empty, (0, 0))).await.unwrap();
    assert!(mppc.sequencer().is_worker_alive());
    server.terminate().await;
}
