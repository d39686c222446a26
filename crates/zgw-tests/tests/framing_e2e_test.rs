//! Malformed frames, generic NACKs and the shipped configuration

mod common;

use std::time::Duration;

use common::{Tester, GATEWAY, TESTER};
use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;
use zgw_doip::doip::payload::RoutingActivationResponse;
use zgw_doip::{ConnectionError, DoipFrame, EngineConfig, FramingError, PayloadType};

async fn write_raw(tester: &mut Tester, hex_frame: &str) {
    let bytes = hex::decode(hex_frame).unwrap();
    let io = tester.peer.get_mut();
    io.write_all(&bytes).await.unwrap();
    io.flush().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_version_mismatch_closes_connection() {
    let mut tester = Tester::start(EngineConfig::default());

    write_raw(&mut tester, "03fd000500000007").await;
    tester.expect_closed(Duration::from_secs(1)).await;

    let result = tester.handle.join().await;
    assert!(matches!(
        result,
        Err(ConnectionError::Framing(FramingError::VersionMismatch {
            version: 0x03,
            inverse: 0xFD
        }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_payload_closes_connection() {
    let mut config = EngineConfig::default();
    config.doip.max_payload_length = 4096;
    let mut tester = Tester::start(config);
    tester.activate().await;

    write_raw(&mut tester, "02fd800100002000").await;
    tester.expect_closed(Duration::from_secs(1)).await;

    let result = tester.handle.join().await;
    assert!(matches!(
        result,
        Err(ConnectionError::Framing(FramingError::PayloadTooLarge {
            length: 0x2000,
            max: 4096
        }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_payload_type_is_nacked() {
    let mut tester = Tester::start(EngineConfig::default());

    tester
        .send(DoipFrame::new(PayloadType::from(0x4001), vec![0xAA, 0xBB]))
        .await;
    let nack = tester.recv().await;
    assert_eq!(nack.payload_type, PayloadType::GenericNack);
    assert_eq!(nack.payload.as_ref(), &[0x01]);

    // The connection survives
    tester.activate().await;
    tester.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_short_activation_request_is_nacked() {
    let mut tester = Tester::start(EngineConfig::default());

    tester
        .send(DoipFrame::new(
            PayloadType::RoutingActivationRequest,
            vec![0x0E, 0x00, 0x00],
        ))
        .await;
    let nack = tester.recv().await;
    assert_eq!(nack.payload_type, PayloadType::GenericNack);
    assert_eq!(nack.payload.as_ref(), &[0x04]);
    assert!(!tester.handle.is_active());

    tester.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_frame_split_across_writes() {
    let mut tester = Tester::start(EngineConfig::default());

    write_raw(&mut tester, "02fd0005000000").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    write_raw(&mut tester, "07").await;
    write_raw(&mut tester, "0e0000").await;
    write_raw(&mut tester, "00000000").await;

    let frame = tester.recv().await;
    assert_eq!(frame.payload_type, PayloadType::RoutingActivationResponse);
    let response = RoutingActivationResponse::parse(&frame.payload).unwrap();
    assert_eq!(response.tester_address, TESTER);
    assert_eq!(response.entity_address, GATEWAY);

    // Wire bytes: entity address first, then tester, code 0x10, reserved
    assert_eq!(frame.payload.as_ref(), &hex::decode("01000e001000000000").unwrap()[..]);

    tester.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_diagnostic_nacks() {
    let mut tester = Tester::start(EngineConfig::default());
    tester.activate().await;

    // Unknown source address
    write_raw(&mut tester, "02fd8001000000071234010022f194").await;
    let nack = tester.recv().await;
    assert_eq!(nack.payload_type, PayloadType::DiagnosticMessageNack);
    assert_eq!(nack.payload.as_ref(), &hex::decode("0100123402").unwrap()[..]);

    // Unknown target address
    write_raw(&mut tester, "02fd8001000000070e00777722f194").await;
    let nack = tester.recv().await;
    assert_eq!(nack.payload_type, PayloadType::DiagnosticMessageNack);
    assert_eq!(nack.payload.as_ref(), &hex::decode("01000e0003").unwrap()[..]);

    tester.shutdown().await.unwrap();
}

#[test]
fn test_shipped_config_matches_defaults() {
    let shipped =
        EngineConfig::from_toml_str(include_str!("../../zgw-gateway/config/zgw-gateway.toml"))
            .unwrap();
    let defaults = EngineConfig::default();

    assert_eq!(shipped.local_logical_address, defaults.local_logical_address);
    assert_eq!(shipped.ecu_id, defaults.ecu_id);
    assert_eq!(
        shipped.routing.alive_check_interval(),
        defaults.routing.alive_check_interval()
    );
    assert_eq!(
        shipped.routing.alive_check_timeout(),
        defaults.routing.alive_check_timeout()
    );
    assert_eq!(shipped.doip.max_payload_length, defaults.doip.max_payload_length);
    assert_eq!(shipped.transfer.limits(), defaults.transfer.limits());
    assert_eq!(shipped.transfer.verify_package, defaults.transfer.verify_package);
    assert_eq!(
        shipped.identity.vci_record(),
        defaults.identity.vci_record()
    );
    assert_eq!(
        shipped.identity.health_record(),
        defaults.identity.health_record()
    );
    assert_eq!(
        shipped.identity.readiness_record(),
        defaults.identity.readiness_record()
    );
}
