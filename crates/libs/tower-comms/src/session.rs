//! Node session: the public face of tower comms.
//!
//! Wires a transport to the envelope codec, the acknowledgment tracker and
//! the message router.
//!
//! ```no_run
//! use tower_comms::{NodeConfig, TowerSession};
//! use tower_proto::PingData;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let session = TowerSession::builder(NodeConfig::simulated(2, "tower-2"))
//!     .on_ack_success(|id| println!("packet {id} delivered"))
//!     .on_ack_failure(|id| println!("packet {id} lost"))
//!     .build()?;
//! session.register_ping_handler(|msg| {
//!     println!("ping from {}: {} Hz", msg.header.node_id, msg.payload.frequency);
//!     Ok(())
//! });
//! session.start().await?;
//! session.send_ping(&PingData::default(), Some(1), true).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_proto::{
    decode, BaseHeader, ConfigData, Envelope, ErrorData, MessageKind, Payload, PingData,
    RequestConfigData,
};

use crate::ack::{AckCallback, AckTracker};
use crate::config::{AckPolicy, NodeConfig, TransportChoice};
use crate::error::{ConfigError, HandlerError, SendError, TransportError};
use crate::iface::{
    InboundEvent, MeshTransport, MeshtasticTransport, NodeId, NodePosition, PacketId,
    SimulatedMesh, INBOUND_QUEUE, MAX_PACKET_ID,
};
use crate::router::{MessageRouter, Received};

pub struct TowerSessionBuilder {
    config: NodeConfig,
    ack_policy: AckPolicy,
    on_ack_success: Option<AckCallback>,
    on_ack_failure: Option<AckCallback>,
    simulated_mesh: Option<SimulatedMesh>,
    transport: Option<Arc<dyn MeshTransport>>,
}

impl TowerSessionBuilder {
    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn on_ack_success(mut self, callback: impl Fn(PacketId) + Send + Sync + 'static) -> Self {
        let callback: AckCallback = Arc::new(callback);
        self.on_ack_success = Some(callback);
        self
    }

    pub fn on_ack_failure(mut self, callback: impl Fn(PacketId) + Send + Sync + 'static) -> Self {
        let callback: AckCallback = Arc::new(callback);
        self.on_ack_failure = Some(callback);
        self
    }

    /// Mesh a simulated node attaches to instead of [`SimulatedMesh::global`].
    pub fn simulated_mesh(mut self, mesh: SimulatedMesh) -> Self {
        self.simulated_mesh = Some(mesh);
        self
    }

    /// Uses `transport` instead of the one `config` selects.
    pub fn transport(mut self, transport: Arc<dyn MeshTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<TowerSession, ConfigError> {
        let choice = self.config.validate()?;
        self.ack_policy.validate()?;

        let label = match &choice {
            TransportChoice::Meshtastic { device } => device.clone(),
            TransportChoice::Simulated { user_id, .. } => user_id.clone(),
        };
        let transport = match (self.transport, choice) {
            (Some(transport), _) => transport,
            (None, TransportChoice::Meshtastic { device }) => {
                Arc::new(MeshtasticTransport::serial(device)) as Arc<dyn MeshTransport>
            }
            (None, TransportChoice::Simulated { node_id, user_id }) => {
                let mesh = self.simulated_mesh.unwrap_or_else(SimulatedMesh::global);
                Arc::new(mesh.attach(node_id, user_id)) as Arc<dyn MeshTransport>
            }
        };

        Ok(TowerSession {
            label,
            config: self.config,
            ack_policy: self.ack_policy,
            on_ack_success: self.on_ack_success.unwrap_or_else(ignore_ack),
            on_ack_failure: self.on_ack_failure.unwrap_or_else(ignore_ack),
            transport,
            router: Arc::new(MessageRouter::new()),
            next_packet_id: AtomicU64::new(1),
            tracker: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(None),
        })
    }
}

/// Takes the next id from `counter`, wrapping from [`MAX_PACKET_ID`] to 1.
fn next_packet_id(counter: &AtomicU64) -> PacketId {
    let step = |id: PacketId| Some(if id >= MAX_PACKET_ID { 1 } else { id + 1 });
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, step)
        .unwrap_or_else(|id| id)
}

fn ignore_ack() -> AckCallback {
    Arc::new(|_: PacketId| {})
}

struct Running {
    tracker: Arc<AckTracker>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

/// One node's communication session.
pub struct TowerSession {
    label: String,
    config: NodeConfig,
    ack_policy: AckPolicy,
    on_ack_success: AckCallback,
    on_ack_failure: AckCallback,
    transport: Arc<dyn MeshTransport>,
    router: Arc<MessageRouter>,
    next_packet_id: AtomicU64,
    tracker: Mutex<Option<Arc<AckTracker>>>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
}

impl TowerSession {
    pub fn builder(config: NodeConfig) -> TowerSessionBuilder {
        TowerSessionBuilder {
            config,
            ack_policy: AckPolicy::default(),
            on_ack_success: None,
            on_ack_failure: None,
            simulated_mesh: None,
            transport: None,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ack_policy(&self) -> AckPolicy {
        self.ack_policy
    }

    /// Opens the transport and begins delivering inbound messages. Idempotent.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Ok(());
        }

        let tracker = Arc::new(AckTracker::new(
            self.label.clone(),
            self.transport.clone(),
            self.ack_policy,
            self.on_ack_success.clone(),
            self.on_ack_failure.clone(),
        ));
        let cancel = CancellationToken::new();
        let (sink, inbound) = mpsc::channel(INBOUND_QUEUE);
        self.transport.register_inbound(sink);
        let worker = tokio::spawn(inbound_loop(
            self.label.clone(),
            inbound,
            tracker.clone(),
            self.router.clone(),
            cancel.clone(),
        ));

        if let Err(err) = self.transport.start().await {
            tracker.shutdown();
            cancel.cancel();
            log::warn!(
                "session({}): transport failed to start: {}",
                self.label,
                err
            );
            return Err(err);
        }

        *self.tracker_slot() = Some(tracker.clone());
        *lifecycle = Some(Running {
            tracker,
            cancel,
            worker,
        });
        log::info!(
            "session({}): started node={:?} user={:?}",
            self.label,
            self.transport.node_id(),
            self.transport.user_id()
        );
        Ok(())
    }

    /// Stops delivery, discards pending acknowledgments and closes the
    /// transport. No ack callback fires after this returns. Idempotent.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return;
        };

        self.tracker_slot().take();
        running.tracker.shutdown();
        running.cancel.cancel();
        self.transport.stop().await;
        let _ = running.worker.await;
        log::info!("session({}): stopped", self.label);
    }

    pub fn is_running(&self) -> bool {
        self.tracker_slot().is_some()
    }

    fn tracker_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<AckTracker>>> {
        self.tracker.lock().expect("session tracker mutex poisoned")
    }

    fn header(&self) -> BaseHeader {
        let node_id = self
            .transport
            .node_id()
            .or(self.config.numeric_id)
            .unwrap_or(0);
        BaseHeader::now(node_id as i32)
    }

    /// Encodes and sends `payload`; returns its packet id when `want_ack`.
    pub async fn send<T: Payload>(
        &self,
        payload: T,
        destination: Option<NodeId>,
        want_ack: bool,
    ) -> Result<Option<PacketId>, SendError> {
        let tracker = self.tracker_slot().clone();
        let Some(tracker) = tracker else {
            return Err(SendError::NotStarted);
        };

        let bytes = Envelope::new(self.header(), payload.into_body()).encode();
        if !want_ack {
            self.transport.send(&bytes, destination, None).await?;
            return Ok(None);
        }

        let packet_id = next_packet_id(&self.next_packet_id);
        tracker.track(packet_id, bytes, destination).await?;
        log::debug!(
            "session({}): sent {} as packet {} to {:?}",
            self.label,
            T::KIND,
            packet_id,
            destination
        );
        Ok(Some(packet_id))
    }

    pub async fn send_request_config(
        &self,
        destination: Option<NodeId>,
        want_ack: bool,
    ) -> Result<Option<PacketId>, SendError> {
        self.send(RequestConfigData, destination, want_ack).await
    }

    pub async fn send_config(
        &self,
        config: &ConfigData,
        destination: Option<NodeId>,
        want_ack: bool,
    ) -> Result<Option<PacketId>, SendError> {
        self.send(config.clone(), destination, want_ack).await
    }

    pub async fn send_ping(
        &self,
        ping: &PingData,
        destination: Option<NodeId>,
        want_ack: bool,
    ) -> Result<Option<PacketId>, SendError> {
        self.send(ping.clone(), destination, want_ack).await
    }

    pub async fn send_error(
        &self,
        message: impl Into<String>,
        destination: Option<NodeId>,
        want_ack: bool,
    ) -> Result<Option<PacketId>, SendError> {
        self.send(ErrorData::new(message), destination, want_ack)
            .await
    }

    pub fn register_handler<T, F>(&self, handler: F)
    where
        T: Payload,
        F: Fn(Received<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.router.register::<T, F>(handler);
    }

    pub fn register_handler_once<T, F>(&self, handler: F)
    where
        T: Payload,
        F: Fn(Received<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.router.register_once::<T, F>(handler);
    }

    pub fn unregister_handler(&self, kind: MessageKind) -> bool {
        self.router.unregister(kind)
    }

    pub fn register_request_config_handler<F>(&self, handler: F)
    where
        F: Fn(Received<RequestConfigData>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_handler::<RequestConfigData, F>(handler);
    }

    pub fn register_config_handler<F>(&self, handler: F)
    where
        F: Fn(Received<ConfigData>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_handler::<ConfigData, F>(handler);
    }

    pub fn register_ping_handler<F>(&self, handler: F)
    where
        F: Fn(Received<PingData>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_handler::<PingData, F>(handler);
    }

    pub fn register_error_handler<F>(&self, handler: F)
    where
        F: Fn(Received<ErrorData>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_handler::<ErrorData, F>(handler);
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.transport.node_id()
    }

    pub fn user_id(&self) -> Option<String> {
        self.transport.user_id()
    }

    /// User id of another node on the mesh, if the transport has seen it.
    pub fn node_user_id(&self, node: NodeId) -> Option<String> {
        self.transport.node_user_id(node)
    }

    pub fn neighbors(&self) -> Vec<NodeId> {
        self.transport.neighbors()
    }

    pub fn node_position(&self) -> Option<NodePosition> {
        self.transport.position()
    }

    /// Acknowledged sends still awaiting an outcome.
    pub fn pending_acks(&self) -> usize {
        self.tracker_slot()
            .as_ref()
            .map_or(0, |tracker| tracker.pending_count())
    }
}

impl Drop for TowerSession {
    fn drop(&mut self) {
        if let Some(running) = self.lifecycle.get_mut().take() {
            running.tracker.shutdown();
            running.cancel.cancel();
            running.worker.abort();
        }
    }
}

async fn inbound_loop(
    label: String,
    mut inbound: mpsc::Receiver<InboundEvent>,
    tracker: Arc<AckTracker>,
    router: Arc<MessageRouter>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = inbound.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            InboundEvent::Ack { from, packet_id } => {
                if !tracker.acknowledge(packet_id) {
                    log::debug!(
                        "session({}): ignoring ack for packet {} from {}",
                        label,
                        packet_id,
                        from
                    );
                }
            }
            InboundEvent::Data { from, payload } => match decode(&payload) {
                Ok(envelope) => {
                    router.dispatch(&envelope);
                }
                Err(err) => {
                    log::warn!(
                        "session({}): dropping undecodable frame from {} ({} bytes): {}",
                        label,
                        from,
                        payload.len(),
                        err
                    );
                }
            },
            InboundEvent::LinkError { reason } => {
                log::error!("session({}): link error: {}", label, reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_rejects_invalid_config() {
        let mut config = NodeConfig::simulated(1, "a");
        config.device = Some("/dev/ttyUSB0".into());
        let result = TowerSession::builder(config).build();
        assert!(matches!(result, Err(ConfigError::InvalidNode(_))));

        let policy = AckPolicy::new(std::time::Duration::from_secs(1), 0);
        let result = TowerSession::builder(NodeConfig::simulated(1, "a"))
            .simulated_mesh(SimulatedMesh::new())
            .ack_policy(policy)
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidAckPolicy(_))));
    }

    #[test]
    fn packet_ids_wrap_before_leaving_radio_range() {
        let counter = AtomicU64::new(1);
        assert_eq!(next_packet_id(&counter), 1);
        assert_eq!(next_packet_id(&counter), 2);

        let counter = AtomicU64::new(MAX_PACKET_ID);
        assert_eq!(next_packet_id(&counter), MAX_PACKET_ID);
        assert_eq!(next_packet_id(&counter), 1);
    }

    #[tokio::test]
    async fn send_before_start_is_rejected() {
        let session = TowerSession::builder(NodeConfig::simulated(1, "a"))
            .simulated_mesh(SimulatedMesh::new())
            .build()
            .expect("build");
        let err = session
            .send_request_config(None, false)
            .await
            .expect_err("not started");
        assert!(matches!(err, SendError::NotStarted));
        assert_eq!(session.pending_acks(), 0);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let session = TowerSession::builder(NodeConfig::simulated(5, "tower-5"))
            .simulated_mesh(SimulatedMesh::new())
            .build()
            .expect("build");
        session.stop().await;
        session.start().await.expect("start");
        session.start().await.expect("start again");
        assert!(session.is_running());
        assert_eq!(session.node_id(), Some(5));
        assert_eq!(session.user_id().as_deref(), Some("tower-5"));
        session.stop().await;
        session.stop().await;
        assert!(!session.is_running());
    }
}
