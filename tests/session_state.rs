//! Tests for the session state machine and request-id continuity.

use std::net::SocketAddr;
use std::time::Duration;

use miio::session::{DeviceSession, SessionState};

fn addr() -> SocketAddr {
    "192.168.1.20:54321".parse().expect("test addr")
}

#[test]
fn fresh_session_is_uninitialized() {
    let session = DeviceSession::new(addr(), 0);
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert!(!session.is_ready());
    assert!(session.stamp_expired());
    assert!(session.current_stamp().is_none());
}

#[test]
fn handshake_makes_the_session_ready() {
    let mut session = DeviceSession::new(addr(), 0);
    session.begin_handshake();
    assert_eq!(session.state(), SessionState::Handshaking);

    session.complete_handshake(0x00aabbcc, 6015);
    assert_eq!(session.state(), SessionState::Ready);
    assert!(session.is_ready());
    assert_eq!(session.device_id(), 0x00aabbcc);
    // Just captured, so the device clock equals the handshake stamp
    assert_eq!(session.current_stamp(), Some(6015));
}

#[test]
fn request_ids_increase_and_survive_disconnects() {
    let mut session = DeviceSession::new(addr(), 0);
    assert_eq!(session.next_request_id(), 1);
    assert_eq!(session.next_request_id(), 2);

    session.complete_handshake(1, 100);
    session.mark_disconnected();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.current_stamp().is_none());

    // Ids keep climbing; a stale response can never alias a new request
    assert_eq!(session.next_request_id(), 3);
}

#[test]
fn recreated_session_carries_the_counter_forward() {
    let mut first = DeviceSession::new(addr(), 0);
    for _ in 0..41 {
        first.next_request_id();
    }
    assert_eq!(first.last_id(), 41);

    // Simulated socket failure: the session is rebuilt from its last id
    let mut second = DeviceSession::new(addr(), first.last_id());
    assert_eq!(second.next_request_id(), 42);
}

#[test]
fn expired_stamp_takes_the_session_out_of_ready() {
    let mut session = DeviceSession::new(addr(), 0).with_stamp_ttl(Duration::from_millis(10));
    session.complete_handshake(1, 100);
    assert!(session.is_ready());

    std::thread::sleep(Duration::from_millis(30));
    assert!(session.stamp_expired());
    assert_eq!(session.state(), SessionState::Ready);
    assert!(!session.is_ready(), "a stale stamp must force a re-handshake");

    // A fresh handshake restores the session with the new stamp
    session.complete_handshake(1, 130);
    assert!(session.is_ready());
    assert_eq!(session.current_stamp(), Some(130));
}

#[test]
fn disconnect_then_handshake_recovers() {
    let mut session = DeviceSession::new(addr(), 10);
    session.complete_handshake(1, 50);
    session.mark_disconnected();
    assert!(!session.is_ready());

    session.begin_handshake();
    session.complete_handshake(1, 80);
    assert!(session.is_ready());
    assert_eq!(session.next_request_id(), 11);
}
