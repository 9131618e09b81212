//! The per-device protocol engine handle.
//!
//! A [`MiIoDevice`] ties a [`DeviceSession`], a [`CommandQueue`] and a shared
//! transport registration together. Commands are fire-and-forget: `send`
//! returns the request id and the decoded response arrives later on the
//! event channel, matched by id. The handshake runs lazily before the first
//! command and again whenever the device clock stamp goes stale.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::constants::{COMMAND_PORT, HANDSHAKE_TIMEOUT, MAX_PROPERTIES};
use crate::crypto::{Keyring, Token};
use crate::error::{MiIoError, Result};
use crate::packet::Packet;
use crate::queue::{CommandClass, CommandQueue};
use crate::session::DeviceSession;
use crate::transport::{Datagram, SocketBinding, SocketRegistry};

/// Static device configuration supplied by the collaborator layer.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub token: Token,
    /// Known device id; used when a handshake reply carries none.
    #[serde(default)]
    pub device_id: Option<u32>,
    /// Request-id counter carried over from a previous engine instance so
    /// ids keep increasing across restarts of the handle.
    #[serde(default)]
    pub last_id: u32,
}

fn default_port() -> u16 {
    COMMAND_PORT
}

impl DeviceConfig {
    pub fn new(host: impl Into<String>, token: Token) -> Self {
        DeviceConfig {
            host: host.into(),
            port: COMMAND_PORT,
            token,
            device_id: None,
            last_id: 0,
        }
    }
}

/// Result half of a decoded JSON response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseResult {
    Ok(Value),
    Err(Value),
}

/// Asynchronous notifications to the collaborator layer.
#[derive(Debug, Clone)]
pub enum MiIoEvent {
    /// Handshake completed; the session is ready.
    Connected { device_id: u32 },
    /// The session was lost; the queue was cleared.
    Disconnected { reason: String },
    /// A response was correlated to an earlier request.
    Response {
        id: u32,
        method: String,
        result: ResponseResult,
    },
}

struct DeviceInner {
    config: DeviceConfig,
    addr: SocketAddr,
    keyring: Option<Keyring>,
    session: std::sync::Mutex<DeviceSession>,
    queue: CommandQueue,
    binding: SocketBinding,
    registry: Arc<SocketRegistry>,
    events: broadcast::Sender<MiIoEvent>,
    // Bumped on every completed handshake so waiters can tell a fresh
    // reply from an older Ready state
    handshake_gen: watch::Sender<u64>,
    cancel: CancellationToken,
}

/// Handle to one MiIO device.
pub struct MiIoDevice {
    inner: Arc<DeviceInner>,
}

impl MiIoDevice {
    /// Resolve the device address, register on the shared transport and
    /// start the background receive task. No packet is sent yet; the
    /// handshake runs on first use or via [`send_ping`](Self::send_ping).
    pub async fn connect(config: DeviceConfig, registry: Arc<SocketRegistry>) -> Result<Self> {
        let addr = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await?
            .next()
            .ok_or_else(|| {
                MiIoError::Transport(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("cannot resolve {}", config.host),
                ))
            })?;

        let keyring = if config.token.is_unset() {
            None
        } else {
            Some(Keyring::derive(&config.token))
        };

        let (binding, rx) = registry.register(0).await?;
        let (events, _) = broadcast::channel(16);
        let (handshake_gen, _) = watch::channel(0);

        let inner = Arc::new(DeviceInner {
            session: std::sync::Mutex::new(DeviceSession::new(addr, config.last_id)),
            config,
            addr,
            keyring,
            queue: CommandQueue::default(),
            binding,
            registry,
            events,
            handshake_gen,
            cancel: CancellationToken::new(),
        });

        info!("engine for {} listening on port {}", addr, inner.binding.local_port());
        tokio::spawn(run_receive(Arc::clone(&inner), rx));

        Ok(MiIoDevice { inner })
    }

    /// Subscribe to [`MiIoEvent`] notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<MiIoEvent> {
        self.inner.events.subscribe()
    }

    /// The last request id handed out; persist it and feed it back through
    /// [`DeviceConfig::last_id`] when recreating the handle.
    pub fn last_id(&self) -> u32 {
        self.inner.session.lock().expect("session lock poisoned").last_id()
    }

    pub fn device_id(&self) -> u32 {
        self.inner
            .session
            .lock()
            .expect("session lock poisoned")
            .device_id()
    }

    /// Send the handshake probe and wait for the reply. On timeout the
    /// session stays in `Handshaking`; the caller's periodic poll retries.
    pub async fn send_ping(&self) -> Result<()> {
        let inner = &self.inner;
        let gen_before = *inner.handshake_gen.borrow();
        inner
            .session
            .lock()
            .expect("session lock poisoned")
            .begin_handshake();

        let hello = Packet::hello().to_bytes()?;
        if let Err(e) = inner.binding.send(&hello, inner.addr).await {
            inner.fault("handshake send failed");
            return Err(e);
        }

        let mut gen_rx = inner.handshake_gen.subscribe();
        match timeout(HANDSHAKE_TIMEOUT, gen_rx.wait_for(|g| *g > gen_before)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(MiIoError::Protocol("receive task gone".into())),
            Err(_) => {
                debug!("no handshake reply from {} within {:?}", inner.addr, HANDSHAKE_TIMEOUT);
                Err(MiIoError::HandshakeTimeout(HANDSHAKE_TIMEOUT))
            }
        }
    }

    /// Queue a manually triggered command. Returns the request id used for
    /// correlation; the response arrives as an [`MiIoEvent::Response`].
    pub async fn send(&self, method: &str, params: Value) -> Result<u32> {
        self.inner.queue.purge_expired();
        self.dispatch(method, params).await
    }

    /// Send a command and wait for its response, with a caller-chosen
    /// timeout. Convenience over `send` + event matching.
    pub async fn execute(
        &self,
        method: &str,
        params: Value,
        wait: std::time::Duration,
    ) -> Result<ResponseResult> {
        let mut events = self.subscribe();
        let id = self.send(method, params).await?;
        let reply = timeout(wait, async {
            loop {
                match events.recv().await {
                    Ok(MiIoEvent::Response { id: rid, result, .. }) if rid == id => {
                        return Ok(result);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event subscriber lagged by {n}, continuing");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(MiIoError::Protocol("event channel closed".into()));
                    }
                }
            }
        })
        .await;
        match reply {
            Ok(result) => result,
            Err(_) => Err(MiIoError::RequestTimeout(id, wait)),
        }
    }

    /// Poll device properties with `get_prop`, chunked to the per-request
    /// batch limit. Chunks that hit the backpressure ceiling are skipped for
    /// this cycle, not queued; manual commands are unaffected.
    pub async fn refresh_properties(&self, properties: &[&str]) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        for chunk in properties.chunks(MAX_PROPERTIES) {
            self.inner.queue.purge_expired();
            if !self.inner.queue.accepts(CommandClass::Refresh) {
                debug!(
                    "{} requests outstanding, skipping refresh of {:?} this cycle",
                    self.inner.queue.len(),
                    chunk
                );
                continue;
            }
            let params = Value::Array(chunk.iter().map(|p| Value::from(*p)).collect());
            ids.push(self.dispatch("get_prop", params).await?);
        }
        Ok(ids)
    }

    /// Queue the `miio.info` identification command.
    pub async fn info(&self) -> Result<u32> {
        self.send("miio.info", json!([])).await
    }

    /// Requests sent but not yet answered.
    pub fn pending_requests(&self) -> usize {
        self.inner.queue.len()
    }

    /// Drop the session and forget everything in flight, as after a send
    /// failure. The transport registration stays open and the next command
    /// re-handshakes lazily.
    pub fn reset(&self) {
        self.inner.fault("reset by caller");
    }

    /// Stop the receive task and release the transport registration.
    /// Idempotent.
    pub async fn close(&self) {
        debug!("closing engine for {}", self.inner.addr);
        self.inner.cancel.cancel();
        self.inner.registry.unregister(&self.inner.binding).await;
    }

    /// Encrypt, frame and send one command, recording it as pending.
    async fn dispatch(&self, method: &str, params: Value) -> Result<u32> {
        let inner = &self.inner;

        let ready = inner
            .session
            .lock()
            .expect("session lock poisoned")
            .is_ready();
        if !ready {
            self.send_ping().await?;
        }

        let keyring = inner.keyring.as_ref().ok_or_else(|| {
            MiIoError::CryptoConfiguration("no token configured for this device".into())
        })?;

        let (id, device_id, stamp) = {
            let mut session = inner.session.lock().expect("session lock poisoned");
            let stamp = session.current_stamp().ok_or_else(|| {
                MiIoError::Protocol("session lost its stamp before send".into())
            })?;
            (session.next_request_id(), session.device_id(), stamp)
        };

        let body = json!({ "id": id, "method": method, "params": params });
        let packet = Packet::command(device_id, stamp, keyring, body.to_string().as_bytes())?;
        let bytes = packet.to_bytes()?;

        debug!("queueing {method} to {} as request {id}", inner.addr);
        if let Err(e) = inner.binding.send(&bytes, inner.addr).await {
            inner.fault("send failed");
            return Err(e);
        }
        inner.queue.record(id, method);
        Ok(id)
    }
}

impl DeviceInner {
    fn emit(&self, event: MiIoEvent) {
        let _ = self.events.send(event);
    }

    /// Unrecoverable fault: drop the session, clear the queue and notify.
    /// The next command re-handshakes lazily.
    fn fault(&self, reason: &str) {
        self.session
            .lock()
            .expect("session lock poisoned")
            .mark_disconnected();
        self.queue.clear();
        self.emit(MiIoEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Decode one datagram. Any fault here is isolated to the datagram:
    /// logged and dropped, never propagated into the receive loop.
    fn handle_datagram(&self, datagram: Datagram) {
        if datagram.source.ip() != self.addr.ip() {
            trace!("ignoring datagram from unrelated source {}", datagram.source);
            return;
        }

        let packet = match Packet::parse(&datagram.data) {
            Ok(p) => p,
            Err(e) => {
                debug!("dropping datagram from {}: {e}", datagram.source);
                return;
            }
        };

        if packet.is_handshake() {
            self.handle_handshake_reply(&packet);
            return;
        }

        let Some(keyring) = self.keyring.as_ref() else {
            debug!("data packet from {} but no token configured, dropping", self.addr);
            return;
        };
        let plaintext = match packet.decrypt_payload(keyring) {
            Ok(p) => p,
            Err(MiIoError::ChecksumMismatch) => {
                debug!("checksum mismatch on datagram from {}, ignoring", self.addr);
                return;
            }
            Err(e) => {
                warn!("cannot decrypt datagram from {}: {e}", self.addr);
                return;
            }
        };

        // Some firmwares NUL-terminate the JSON body
        let trimmed = match plaintext.iter().rposition(|&b| b != 0) {
            Some(end) => &plaintext[..=end],
            None => &plaintext[..],
        };
        let value: Value = match serde_json::from_slice(trimmed) {
            Ok(v) => v,
            Err(e) => {
                warn!("response from {} is not valid JSON: {e}", self.addr);
                return;
            }
        };
        let Some(id) = value.get("id").and_then(Value::as_u64) else {
            warn!("response from {} carries no id, dropping", self.addr);
            return;
        };

        let Some(pending) = self.queue.resolve(id as u32) else {
            return;
        };
        let result = match value.get("error") {
            Some(err) => ResponseResult::Err(err.clone()),
            None => ResponseResult::Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        trace!("request {id} ({}) resolved", pending.method);
        self.emit(MiIoEvent::Response {
            id: id as u32,
            method: pending.method,
            result,
        });
    }

    fn handle_handshake_reply(&self, packet: &Packet) {
        let device_id = if packet.device_id != 0 {
            packet.device_id
        } else {
            self.config.device_id.unwrap_or(0)
        };
        self.session
            .lock()
            .expect("session lock poisoned")
            .complete_handshake(device_id, packet.stamp);
        self.handshake_gen.send_modify(|g| *g += 1);
        self.emit(MiIoEvent::Connected { device_id });
    }
}

async fn run_receive(inner: Arc<DeviceInner>, mut rx: mpsc::UnboundedReceiver<Datagram>) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                debug!("engine task for {} stopping", inner.addr);
                break;
            }
            datagram = rx.recv() => match datagram {
                Some(datagram) => inner.handle_datagram(datagram),
                None => {
                    debug!("transport channel for {} closed", inner.addr);
                    break;
                }
            },
        }
    }
}
