//! Acknowledgment tracking with bounded retry.
//!
//! Each acknowledged send becomes a pending entry with its own timer task.
//! The entry resolves exactly once: through [`AckTracker::acknowledge`]
//! (success callback) or by running out of attempts (failure callback).
//! [`AckTracker::shutdown`] discards every entry without a callback.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::config::AckPolicy;
use crate::error::{panic_message, TransportError};
use crate::iface::{MeshTransport, NodeId, PacketId};

/// Callback receiving the packet id of a resolved send.
pub type AckCallback = Arc<dyn Fn(PacketId) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct PendingAck {
    pub packet_id: PacketId,
    pub destination: Option<NodeId>,
    pub sent_at: Instant,
    pub attempt: u32,
    pub payload: Arc<[u8]>,
}

struct Entry {
    pending: PendingAck,
    timer: CancellationToken,
}

enum TimerStep {
    Resend {
        payload: Arc<[u8]>,
        destination: Option<NodeId>,
        attempt: u32,
    },
    Expire,
    Done,
}

struct TrackerInner {
    label: String,
    transport: Arc<dyn MeshTransport>,
    policy: AckPolicy,
    on_success: AckCallback,
    on_failure: AckCallback,
    pending: Mutex<HashMap<PacketId, Entry>>,
    shutdown: CancellationToken,
    // Held for reading while a callback runs; `shutdown` takes it for writing.
    callbacks_open: RwLock<bool>,
}

impl TrackerInner {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<PacketId, Entry>> {
        self.pending.lock().expect("ack tracker mutex poisoned")
    }

    /// Runs `callback` unless shut down. A panicking callback is logged.
    fn fire(&self, callback: &AckCallback, packet_id: PacketId) {
        let open = self
            .callbacks_open
            .read()
            .expect("ack callback gate poisoned");
        if !*open {
            return;
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(packet_id))) {
            log::error!(
                "ack({}): callback for packet {} panicked: {}",
                self.label,
                packet_id,
                panic_message(panic.as_ref())
            );
        }
    }

    fn next_step(&self, packet_id: PacketId) -> TimerStep {
        let mut pending = self.pending();
        let Some(entry) = pending.get_mut(&packet_id) else {
            return TimerStep::Done;
        };
        if entry.pending.attempt < self.policy.max_attempts {
            entry.pending.attempt += 1;
            entry.pending.sent_at = Instant::now();
            return TimerStep::Resend {
                payload: entry.pending.payload.clone(),
                destination: entry.pending.destination,
                attempt: entry.pending.attempt,
            };
        }
        pending.remove(&packet_id);
        TimerStep::Expire
    }
}

/// Outstanding acknowledged sends of one session run.
pub struct AckTracker {
    inner: Arc<TrackerInner>,
}

impl AckTracker {
    pub fn new(
        label: impl Into<String>,
        transport: Arc<dyn MeshTransport>,
        policy: AckPolicy,
        on_success: AckCallback,
        on_failure: AckCallback,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                label: label.into(),
                transport,
                policy,
                on_success,
                on_failure,
                pending: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                callbacks_open: RwLock::new(true),
            }),
        }
    }

    /// Sends `payload` with acknowledgment requested and starts its retry timer.
    ///
    /// If the first send fails the entry is withdrawn and the error returned;
    /// no callback fires for it.
    pub async fn track(
        &self,
        packet_id: PacketId,
        payload: Vec<u8>,
        destination: Option<NodeId>,
    ) -> Result<(), TransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::NotStarted);
        }

        let payload: Arc<[u8]> = payload.into();
        let timer = self.inner.shutdown.child_token();
        self.inner.pending().insert(
            packet_id,
            Entry {
                pending: PendingAck {
                    packet_id,
                    destination,
                    sent_at: Instant::now(),
                    attempt: 1,
                    payload: payload.clone(),
                },
                timer: timer.clone(),
            },
        );

        let sent = self
            .inner
            .transport
            .send(&payload, destination, Some(packet_id))
            .await;
        if let Err(err) = sent {
            self.inner.pending().remove(&packet_id);
            timer.cancel();
            return Err(err);
        }

        tokio::spawn(retry_timer(self.inner.clone(), packet_id, timer));
        Ok(())
    }

    /// Resolves `packet_id`. Returns `false` for unknown or already resolved ids.
    pub fn acknowledge(&self, packet_id: PacketId) -> bool {
        let Some(entry) = self.inner.pending().remove(&packet_id) else {
            return false;
        };
        entry.timer.cancel();
        log::debug!(
            "ack({}): packet {} acknowledged after {} attempt(s) in {:?}",
            self.inner.label,
            packet_id,
            entry.pending.attempt,
            entry.pending.sent_at.elapsed()
        );
        self.inner.fire(&self.inner.on_success, packet_id);
        true
    }

    /// Cancels every timer and discards pending entries without callbacks.
    ///
    /// Once this returns no callback of this tracker runs again. Callbacks
    /// must not call it themselves.
    pub fn shutdown(&self) {
        *self
            .inner
            .callbacks_open
            .write()
            .expect("ack callback gate poisoned") = false;
        self.inner.shutdown.cancel();
        let discarded = {
            let mut pending = self.inner.pending();
            let count = pending.len();
            pending.clear();
            count
        };
        if discarded > 0 {
            log::info!(
                "ack({}): discarded {} pending packet(s)",
                self.inner.label,
                discarded
            );
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn is_pending(&self, packet_id: PacketId) -> bool {
        self.inner.pending().contains_key(&packet_id)
    }

    pub fn pending(&self, packet_id: PacketId) -> Option<PendingAck> {
        self.inner
            .pending()
            .get(&packet_id)
            .map(|entry| entry.pending.clone())
    }
}

impl Drop for AckTracker {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn retry_timer(inner: Arc<TrackerInner>, packet_id: PacketId, timer: CancellationToken) {
    loop {
        tokio::select! {
            _ = timer.cancelled() => return,
            _ = tokio::time::sleep(inner.policy.retry_interval) => {}
        }

        match inner.next_step(packet_id) {
            TimerStep::Done => return,
            TimerStep::Resend {
                payload,
                destination,
                attempt,
            } => {
                log::debug!(
                    "ack({}): resending packet {} attempt {}/{}",
                    inner.label,
                    packet_id,
                    attempt,
                    inner.policy.max_attempts
                );
                let resent = inner
                    .transport
                    .send(&payload, destination, Some(packet_id))
                    .await;
                if let Err(err) = resent {
                    log::warn!(
                        "ack({}): resend of packet {} failed: {}",
                        inner.label,
                        packet_id,
                        err
                    );
                }
            }
            TimerStep::Expire => {
                log::warn!(
                    "ack({}): packet {} unacknowledged after {} attempt(s)",
                    inner.label,
                    packet_id,
                    inner.policy.max_attempts
                );
                inner.fire(&inner.on_failure, packet_id);
                return;
            }
        }
    }
}
