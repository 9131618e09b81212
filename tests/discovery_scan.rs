//! Tests for the discovery scan against simulated devices.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use common::*;
use miio::crypto::Token;
use miio::discovery::Discovery;

const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[tokio::test]
async fn provisioned_device_reports_its_token() {
    let fake = FakeDevice::spawn(test_token(), TEST_DEVICE_ID, TEST_STAMP, ReplyMode::Echo).await;

    let found = Discovery::new()
        .with_port(fake.port())
        .with_window(Duration::from_millis(300))
        .probe(&[LOOPBACK])
        .await;

    let device = found
        .iter()
        .find(|d| d.device_id == TEST_DEVICE_ID)
        .expect("device discovered");
    assert_eq!(device.address.ip(), LOOPBACK);
    assert_eq!(device.token, Some(test_token()));
}

#[tokio::test]
async fn unprovisioned_device_is_found_with_token_unset() {
    // Checksum field of the reply is all 0xFF: device found, token unknown
    let fake = FakeDevice::spawn(Token::UNSET, 0x0042_4242, TEST_STAMP, ReplyMode::Silent).await;

    let found = Discovery::new()
        .with_port(fake.port())
        .with_window(Duration::from_millis(300))
        .probe(&[LOOPBACK])
        .await;

    let device = found
        .iter()
        .find(|d| d.device_id == 0x0042_4242)
        .expect("device must be reported, not treated as an error");
    assert_eq!(device.token, None);
}

#[tokio::test]
async fn duplicate_replies_are_reported_once() {
    // The probe is sent twice per target, so the device answers twice
    let fake = FakeDevice::spawn(test_token(), TEST_DEVICE_ID, TEST_STAMP, ReplyMode::Echo).await;

    let found = Discovery::new()
        .with_port(fake.port())
        .with_window(Duration::from_millis(300))
        .probe(&[LOOPBACK])
        .await;

    let hits = found.iter().filter(|d| d.device_id == TEST_DEVICE_ID).count();
    assert_eq!(hits, 1);
}

#[tokio::test]
async fn silent_network_yields_an_empty_scan() {
    let found = Discovery::new()
        .with_port(1) // closed port
        .with_window(Duration::from_millis(100))
        .probe(&[LOOPBACK])
        .await;
    assert!(found.is_empty());
}
