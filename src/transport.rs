//! Shared UDP transport.
//!
//! One socket may serve several logical listeners (device sessions and
//! discovery sharing a port), so sockets are deduplicated by local port in a
//! [`SocketRegistry`]. The registry is an explicitly constructed object that
//! callers inject; there is no process-wide static.
//!
//! Each socket runs one background receive task. Every inbound datagram is
//! copied and handed to every registered listener; a listener that has gone
//! away is logged and skipped, never stopping delivery to the others.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::constants::BUFFER_LENGTH;
use crate::error::Result;

/// One inbound UDP datagram, copied out of the receive buffer.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub data: Bytes,
    pub source: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    tx: mpsc::UnboundedSender<Datagram>,
}

/// A bound socket plus its registered listeners and receive task.
pub struct SharedSocket {
    socket: Arc<UdpSocket>,
    local_port: u16,
    listeners: Mutex<Vec<ListenerEntry>>,
    cancel: CancellationToken,
}

impl SharedSocket {
    /// Fire-and-forget send. I/O failure is returned to the caller and not
    /// retried here.
    pub async fn send(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        debug!("sending {} bytes to {}", data.len(), target);
        self.socket.send_to(data, target).await?;
        Ok(())
    }

    /// Allow sending to broadcast addresses (discovery).
    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        self.socket.set_broadcast(on)?;
        Ok(())
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    fn dispatch(&self, datagram: Datagram) {
        let listeners = self.listeners.lock().expect("listener table poisoned");
        trace!(
            "dispatching {} bytes from {} to {} listeners",
            datagram.data.len(),
            datagram.source,
            listeners.len()
        );
        for entry in listeners.iter() {
            if entry.tx.send(datagram.clone()).is_err() {
                debug!("listener {:?} gone, skipping", entry.id);
            }
        }
    }
}

/// Handle returned by [`SocketRegistry::register`]. Holds the shared socket
/// open; pass it back to [`SocketRegistry::unregister`] to release it.
pub struct SocketBinding {
    shared: Arc<SharedSocket>,
    listener: ListenerId,
}

impl SocketBinding {
    pub async fn send(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        self.shared.send(data, target).await
    }

    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        self.shared.set_broadcast(on)
    }

    pub fn local_port(&self) -> u16 {
        self.shared.local_port()
    }
}

/// Deduplicates UDP sockets by local port and owns their receive tasks.
pub struct SocketRegistry {
    sockets: AsyncMutex<HashMap<u16, Arc<SharedSocket>>>,
    next_listener: AtomicU64,
}

impl SocketRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(SocketRegistry {
            sockets: AsyncMutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
        })
    }

    /// Register a listener on the socket bound to `port`. Port 0 always
    /// binds a fresh ephemeral socket; a fixed port reuses the existing
    /// socket and receive loop. The socket is opened and its receive task
    /// started lazily on first registration.
    pub async fn register(
        &self,
        port: u16,
    ) -> Result<(SocketBinding, mpsc::UnboundedReceiver<Datagram>)> {
        let mut sockets = self.sockets.lock().await;

        let shared = match sockets.get(&port) {
            Some(existing) if port != 0 => Arc::clone(existing),
            _ => {
                let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
                let local_port = socket.local_addr()?.port();
                debug!("opened UDP socket on port {local_port}");
                let shared = Arc::new(SharedSocket {
                    socket: Arc::new(socket),
                    local_port,
                    listeners: Mutex::new(Vec::new()),
                    cancel: CancellationToken::new(),
                });
                spawn_receive_task(Arc::clone(&shared));
                sockets.insert(local_port, Arc::clone(&shared));
                shared
            }
        };

        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        shared
            .listeners
            .lock()
            .expect("listener table poisoned")
            .push(ListenerEntry { id, tx });
        trace!("listener {id:?} registered on port {}", shared.local_port);

        Ok((SocketBinding { shared, listener: id }, rx))
    }

    /// Remove a listener. When the last listener leaves, the receive task is
    /// cancelled and the socket closed. Idempotent.
    pub async fn unregister(&self, binding: &SocketBinding) {
        let mut sockets = self.sockets.lock().await;
        let port = binding.shared.local_port;
        let empty = {
            let mut listeners = binding
                .shared
                .listeners
                .lock()
                .expect("listener table poisoned");
            listeners.retain(|e| e.id != binding.listener);
            listeners.is_empty()
        };
        if empty {
            debug!("closing socket on port {port}, no listeners left");
            binding.shared.cancel.cancel();
            sockets.remove(&port);
        }
    }

    /// Cancel every receive task and drop every socket.
    pub async fn shutdown(&self) {
        let mut sockets = self.sockets.lock().await;
        for (port, shared) in sockets.drain() {
            debug!("closing socket on port {port}");
            shared.cancel.cancel();
        }
    }
}

fn spawn_receive_task(shared: Arc<SharedSocket>) {
    let socket = Arc::clone(&shared.socket);
    let cancel = shared.cancel.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; BUFFER_LENGTH];
        debug!("receive task started on port {}", shared.local_port);
        loop {
            tokio::select! {
                // Deliberate shutdown, not a transport fault
                _ = cancel.cancelled() => {
                    debug!("receive task on port {} interrupted", shared.local_port);
                    break;
                }
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, source)) => {
                        trace!("received {len} bytes from {source}");
                        shared.dispatch(Datagram {
                            data: Bytes::copy_from_slice(&buf[..len]),
                            source,
                        });
                    }
                    Err(e) => {
                        warn!("receive error on port {}: {e}", shared.local_port);
                        break;
                    }
                },
            }
        }
        debug!("receive task on port {} ended", shared.local_port);
    });
}
