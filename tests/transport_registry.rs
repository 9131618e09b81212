//! Tests for socket sharing and listener fan-out.

use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use miio::transport::{Datagram, SocketRegistry};

async fn recv(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Datagram>) -> Option<Datagram> {
    timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
}

#[tokio::test]
async fn listeners_on_the_same_port_share_one_socket() {
    let registry = SocketRegistry::new();
    let (first, mut rx1) = registry.register(0).await.expect("first listener");
    let port = first.local_port();

    // Same fixed port: the socket and receive loop are reused
    let (second, mut rx2) = registry.register(port).await.expect("second listener");
    assert_eq!(second.local_port(), port);

    let sender = UdpSocket::bind("127.0.0.1:0").await.expect("sender socket");
    sender
        .send_to(b"fan-out", ("127.0.0.1", port))
        .await
        .expect("send");

    // Both listeners see a copy of the datagram
    let a = recv(&mut rx1).await.expect("first copy");
    let b = recv(&mut rx2).await.expect("second copy");
    assert_eq!(a.data.as_ref(), b"fan-out");
    assert_eq!(b.data.as_ref(), b"fan-out");

    registry.unregister(&first).await;
    registry.unregister(&second).await;
}

#[tokio::test]
async fn one_dead_listener_does_not_block_the_others() {
    let registry = SocketRegistry::new();
    let (first, rx1) = registry.register(0).await.expect("first listener");
    let port = first.local_port();
    let (second, mut rx2) = registry.register(port).await.expect("second listener");

    // First listener goes away without unregistering
    drop(rx1);

    let sender = UdpSocket::bind("127.0.0.1:0").await.expect("sender socket");
    sender
        .send_to(b"still delivered", ("127.0.0.1", port))
        .await
        .expect("send");

    let datagram = recv(&mut rx2).await.expect("surviving listener notified");
    assert_eq!(datagram.data.as_ref(), b"still delivered");

    registry.unregister(&first).await;
    registry.unregister(&second).await;
}

#[tokio::test]
async fn socket_closes_when_the_last_listener_leaves() {
    let registry = SocketRegistry::new();
    let (binding, mut rx) = registry.register(0).await.expect("listener");
    let port = binding.local_port();

    registry.unregister(&binding).await;
    // Unregister is idempotent
    registry.unregister(&binding).await;

    // The receive task is gone, so the channel drains and closes
    let got = recv(&mut rx).await;
    assert!(got.is_none());

    // The port can be bound again once every handle to the socket is gone
    drop(binding);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let rebound = UdpSocket::bind(("127.0.0.1", port)).await;
    assert!(rebound.is_ok(), "port {port} should be free after close");
}

#[tokio::test]
async fn ephemeral_registrations_get_distinct_sockets() {
    let registry = SocketRegistry::new();
    let (a, _rx_a) = registry.register(0).await.expect("first");
    let (b, _rx_b) = registry.register(0).await.expect("second");
    assert_ne!(a.local_port(), b.local_port());

    registry.shutdown().await;
}
