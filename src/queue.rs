//! In-flight request tracking and correlation.
//!
//! Commands are fire-and-forget; the response carries only the request id,
//! so the queue remembers the method name for the caller. Periodic refresh
//! traffic is shed once the pending count hits the ceiling, while manually
//! triggered commands always go through.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::constants::{MAX_PENDING_REQUESTS, REQUEST_TIMEOUT};

/// Whether a command came from a user action or the periodic poll. Only
/// refresh traffic is subject to the backpressure ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    Manual,
    Refresh,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: u32,
    pub method: String,
    pub queued_at: Instant,
}

#[derive(Debug)]
pub struct CommandQueue {
    pending: Mutex<HashMap<u32, PendingRequest>>,
    timeout: Duration,
    ceiling: usize,
}

impl Default for CommandQueue {
    fn default() -> Self {
        CommandQueue::new(REQUEST_TIMEOUT, MAX_PENDING_REQUESTS)
    }
}

impl CommandQueue {
    pub fn new(timeout: Duration, ceiling: usize) -> Self {
        CommandQueue {
            pending: Mutex::new(HashMap::new()),
            timeout,
            ceiling,
        }
    }

    /// Whether a command of this class may be sent right now. Refresh sends
    /// are skipped for the cycle once the ceiling is reached; they are not
    /// queued and not errors.
    pub fn accepts(&self, class: CommandClass) -> bool {
        match class {
            CommandClass::Manual => true,
            CommandClass::Refresh => self.len() < self.ceiling,
        }
    }

    pub fn record(&self, id: u32, method: &str) {
        let mut pending = self.pending.lock().expect("pending table poisoned");
        pending.insert(
            id,
            PendingRequest {
                id,
                method: method.to_string(),
                queued_at: Instant::now(),
            },
        );
    }

    /// Match an inbound response id to its pending request, removing it.
    /// `None` for an unexpected, duplicate, or late response.
    pub fn resolve(&self, id: u32) -> Option<PendingRequest> {
        let mut pending = self.pending.lock().expect("pending table poisoned");
        let hit = pending.remove(&id);
        if hit.is_none() {
            debug!("response id {id} matches no pending request, dropping");
        }
        hit
    }

    /// Drop pending requests older than the timeout. Called opportunistically
    /// before enqueueing; devices silently drop requests and the entries
    /// would otherwise leak. The original caller is not notified.
    pub fn purge_expired(&self) -> Vec<PendingRequest> {
        let mut pending = self.pending.lock().expect("pending table poisoned");
        let timeout = self.timeout;
        let expired: Vec<u32> = pending
            .values()
            .filter(|p| p.queued_at.elapsed() > timeout)
            .map(|p| p.id)
            .collect();
        expired
            .iter()
            .filter_map(|id| {
                let p = pending.remove(id)?;
                warn!("request {} ({}) timed out without a response", p.id, p.method);
                Some(p)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("pending table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget everything in flight; used when the session is lost.
    pub fn clear(&self) {
        let mut pending = self.pending.lock().expect("pending table poisoned");
        if !pending.is_empty() {
            debug!("clearing {} pending requests", pending.len());
            pending.clear();
        }
    }
}
