//! In-process mesh for tests and bench runs.
//!
//! Nodes attached to the same [`SimulatedMesh`] exchange frames through
//! their inbound sinks. Delivery is immediate and lossless unless a link is
//! blocked; a started peer acknowledges every frame that asks for it.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;

use super::{InboundEvent, InboundSink, MeshTransport, NodeId, NodePosition, PacketId};
use crate::error::TransportError;

/// Largest payload the simulated medium accepts by default, matching the radio.
pub const DEFAULT_SIM_MTU: usize = super::meshtastic::MAX_PAYLOAD;

static GLOBAL_MESH: OnceLock<SimulatedMesh> = OnceLock::new();

/// Shared registry of simulated nodes.
#[derive(Clone)]
pub struct SimulatedMesh {
    state: Arc<Mutex<MeshState>>,
}

struct MeshState {
    nodes: BTreeMap<NodeId, SimNode>,
    blocked: HashSet<(NodeId, NodeId)>,
    mtu: usize,
}

struct SimNode {
    user_id: String,
    neighbors: Option<Vec<NodeId>>,
    position: Option<NodePosition>,
    sink: Option<InboundSink>,
    started: bool,
}

impl SimNode {
    fn placeholder(node_id: NodeId) -> Self {
        Self {
            user_id: format!("node-{node_id}"),
            neighbors: None,
            position: None,
            sink: None,
            started: false,
        }
    }

    fn reachable(&self) -> bool {
        self.started && self.sink.is_some()
    }
}

struct Delivery {
    to: NodeId,
    sink: InboundSink,
    ack_to: Option<InboundSink>,
}

impl Default for SimulatedMesh {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedMesh {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MeshState {
                nodes: BTreeMap::new(),
                blocked: HashSet::new(),
                mtu: DEFAULT_SIM_MTU,
            })),
        }
    }

    /// Process-wide mesh used by sessions that are not given one.
    pub fn global() -> Self {
        GLOBAL_MESH.get_or_init(SimulatedMesh::new).clone()
    }

    pub fn with_mtu(self, mtu: usize) -> Self {
        self.lock().mtu = mtu;
        self
    }

    /// Registers `node_id` and returns its transport.
    ///
    /// Re-attaching an id keeps its neighbor list and position.
    pub fn attach(&self, node_id: NodeId, user_id: impl Into<String>) -> SimulatedTransport {
        let user_id = user_id.into();
        {
            let mut state = self.lock();
            let node = state
                .nodes
                .entry(node_id)
                .or_insert_with(|| SimNode::placeholder(node_id));
            node.user_id = user_id;
        }
        SimulatedTransport {
            mesh: self.clone(),
            node_id,
        }
    }

    /// Restricts frames sent by `node_id` to the given peers.
    pub fn set_neighbors(&self, node_id: NodeId, neighbors: impl IntoIterator<Item = NodeId>) {
        let mut state = self.lock();
        let node = state
            .nodes
            .entry(node_id)
            .or_insert_with(|| SimNode::placeholder(node_id));
        node.neighbors = Some(neighbors.into_iter().collect());
    }

    pub fn set_position(&self, node_id: NodeId, position: NodePosition) {
        let mut state = self.lock();
        let node = state
            .nodes
            .entry(node_id)
            .or_insert_with(|| SimNode::placeholder(node_id));
        node.position = Some(position);
    }

    /// Drops every frame and acknowledgment travelling from `from` to `to`.
    pub fn block_link(&self, from: NodeId, to: NodeId) {
        self.lock().blocked.insert((from, to));
    }

    pub fn unblock_link(&self, from: NodeId, to: NodeId) {
        self.lock().blocked.remove(&(from, to));
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.lock().nodes.keys().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MeshState> {
        self.state.lock().expect("simulated mesh mutex poisoned")
    }

    fn plan(
        &self,
        from: NodeId,
        payload_len: usize,
        destination: Option<NodeId>,
        ack: Option<PacketId>,
    ) -> Result<Vec<Delivery>, TransportError> {
        let state = self.lock();
        let sender = state.nodes.get(&from).filter(|node| node.reachable());
        let Some(sender) = sender else {
            return Err(TransportError::NotStarted);
        };
        if payload_len > state.mtu {
            return Err(TransportError::PayloadTooLarge {
                len: payload_len,
                max: state.mtu,
            });
        }

        let targets: Vec<NodeId> = match destination {
            Some(to) => vec![to],
            None => state
                .nodes
                .keys()
                .copied()
                .filter(|id| *id != from)
                .collect(),
        };

        let deliveries = targets
            .into_iter()
            .filter(|to| *to != from)
            .filter(|to| {
                sender
                    .neighbors
                    .as_ref()
                    .map_or(true, |list| list.contains(to))
            })
            .filter(|to| !state.blocked.contains(&(from, *to)))
            .filter_map(|to| {
                let peer = state.nodes.get(&to).filter(|node| node.reachable())?;
                let sink = peer.sink.clone()?;
                let ack_to = match ack {
                    Some(_) if !state.blocked.contains(&(to, from)) => sender.sink.clone(),
                    _ => None,
                };
                Some(Delivery { to, sink, ack_to })
            })
            .collect();
        Ok(deliveries)
    }
}

/// One node's view of a [`SimulatedMesh`].
pub struct SimulatedTransport {
    mesh: SimulatedMesh,
    node_id: NodeId,
}

impl SimulatedTransport {
    pub fn mesh(&self) -> &SimulatedMesh {
        &self.mesh
    }
}

#[async_trait]
impl MeshTransport for SimulatedTransport {
    fn register_inbound(&self, sink: InboundSink) {
        let mut state = self.mesh.lock();
        if let Some(node) = state.nodes.get_mut(&self.node_id) {
            node.sink = Some(sink);
        }
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut state = self.mesh.lock();
        let node = state
            .nodes
            .entry(self.node_id)
            .or_insert_with(|| SimNode::placeholder(self.node_id));
        if !node.started {
            node.started = true;
            log::info!("sim({}): node started as '{}'", self.node_id, node.user_id);
        }
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.mesh.lock();
        if let Some(node) = state.nodes.get_mut(&self.node_id) {
            if node.started {
                node.started = false;
                log::info!("sim({}): node stopped", self.node_id);
            }
        }
    }

    async fn send(
        &self,
        payload: &[u8],
        destination: Option<NodeId>,
        ack: Option<PacketId>,
    ) -> Result<(), TransportError> {
        let deliveries = self
            .mesh
            .plan(self.node_id, payload.len(), destination, ack)?;
        if let (Some(to), true) = (destination, deliveries.is_empty()) {
            log::debug!(
                "sim({}): frame to {} lost, peer unreachable",
                self.node_id,
                to
            );
        }

        for delivery in deliveries {
            let frame = InboundEvent::Data {
                from: self.node_id,
                payload: payload.to_vec(),
            };
            if delivery.sink.send(frame).await.is_err() {
                log::debug!("sim({}): peer {} inbox closed", self.node_id, delivery.to);
                continue;
            }
            if let (Some(packet_id), Some(ack_to)) = (ack, delivery.ack_to) {
                let ack = InboundEvent::Ack {
                    from: delivery.to,
                    packet_id,
                };
                let _ = ack_to.send(ack).await;
            }
        }
        Ok(())
    }

    fn node_id(&self) -> Option<NodeId> {
        Some(self.node_id)
    }

    fn user_id(&self) -> Option<String> {
        self.node_user_id(self.node_id)
    }

    fn node_user_id(&self, node: NodeId) -> Option<String> {
        self.mesh
            .lock()
            .nodes
            .get(&node)
            .map(|node| node.user_id.clone())
    }

    fn neighbors(&self) -> Vec<NodeId> {
        let state = self.mesh.lock();
        let listed = state
            .nodes
            .get(&self.node_id)
            .and_then(|node| node.neighbors.clone());
        match listed {
            Some(neighbors) => neighbors,
            None => state
                .nodes
                .keys()
                .copied()
                .filter(|id| *id != self.node_id)
                .collect(),
        }
    }

    fn position(&self) -> Option<NodePosition> {
        self.mesh
            .lock()
            .nodes
            .get(&self.node_id)
            .and_then(|node| node.position)
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        if let Ok(mut state) = self.mesh.state.lock() {
            if let Some(node) = state.nodes.get_mut(&self.node_id) {
                node.started = false;
                node.sink = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    async fn started(
        mesh: &SimulatedMesh,
        id: NodeId,
    ) -> (SimulatedTransport, mpsc::Receiver<InboundEvent>) {
        let transport = mesh.attach(id, format!("tower-{id}"));
        let (tx, rx) = mpsc::channel(16);
        transport.register_inbound(tx);
        transport.start().await.expect("start");
        (transport, rx)
    }

    #[tokio::test]
    async fn unicast_with_ack_delivers_and_acks() {
        let mesh = SimulatedMesh::new();
        let (a, mut a_rx) = started(&mesh, 1).await;
        let (_b, mut b_rx) = started(&mesh, 2).await;

        a.send(b"hello", Some(2), Some(9)).await.expect("send");

        let data = InboundEvent::Data {
            from: 1,
            payload: b"hello".to_vec(),
        };
        assert_eq!(b_rx.recv().await, Some(data));
        let ack = InboundEvent::Ack {
            from: 2,
            packet_id: 9,
        };
        assert_eq!(a_rx.recv().await, Some(ack));
    }

    #[tokio::test]
    async fn broadcast_reaches_started_peers_only() {
        let mesh = SimulatedMesh::new();
        let (a, mut a_rx) = started(&mesh, 1).await;
        let (_b, mut b_rx) = started(&mesh, 2).await;
        let (c, mut c_rx) = started(&mesh, 3).await;
        c.stop().await;

        a.send(b"all", None, None).await.expect("broadcast");

        let event = b_rx.recv().await;
        assert!(matches!(event, Some(InboundEvent::Data { from: 1, .. })));
        assert!(c_rx.try_recv().is_err());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn absent_peer_loses_frame_without_error() {
        let mesh = SimulatedMesh::new();
        let (a, mut a_rx) = started(&mesh, 1).await;

        a.send(b"void", Some(42), Some(1))
            .await
            .expect("lost silently");
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn neighbor_list_restricts_delivery() {
        let mesh = SimulatedMesh::new();
        let (a, _a_rx) = started(&mesh, 1).await;
        let (_b, mut b_rx) = started(&mesh, 2).await;
        let (_c, mut c_rx) = started(&mesh, 3).await;
        mesh.set_neighbors(1, [3]);

        a.send(b"x", None, None).await.expect("broadcast");

        assert!(b_rx.try_recv().is_err());
        assert!(matches!(c_rx.recv().await, Some(InboundEvent::Data { .. })));
        assert_eq!(a.neighbors(), vec![3]);
    }

    #[tokio::test]
    async fn blocked_return_link_drops_ack() {
        let mesh = SimulatedMesh::new();
        let (a, mut a_rx) = started(&mesh, 1).await;
        let (_b, mut b_rx) = started(&mesh, 2).await;
        mesh.block_link(2, 1);

        a.send(b"one way", Some(2), Some(5)).await.expect("send");

        assert!(b_rx.recv().await.is_some());
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_before_start_fails() {
        let mesh = SimulatedMesh::new();
        let a = mesh.attach(1, "a");
        let err = a.send(b"early", None, None).await.expect_err("not started");
        assert!(matches!(err, TransportError::NotStarted));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let mesh = SimulatedMesh::new().with_mtu(8);
        let (a, _rx) = started(&mesh, 1).await;
        let err = a.send(&[0u8; 9], None, None).await.expect_err("too large");
        assert!(matches!(
            err,
            TransportError::PayloadTooLarge { len: 9, max: 8 }
        ));
    }

    #[tokio::test]
    async fn metadata_reflects_mesh_state() {
        let mesh = SimulatedMesh::new();
        let (a, _rx) = started(&mesh, 1).await;
        let _b = mesh.attach(2, "b");
        let fix = NodePosition {
            latitude: 32.7,
            longitude: -117.1,
            altitude: 12.0,
            time: 1,
        };
        mesh.set_position(1, fix);

        assert_eq!(a.node_id(), Some(1));
        assert_eq!(a.user_id().as_deref(), Some("tower-1"));
        assert_eq!(a.neighbors(), vec![2]);
        assert_eq!(a.position(), Some(fix));
        assert_eq!(a.node_user_id(2).as_deref(), Some("b"));
        assert_eq!(a.node_user_id(9), None);
    }
}
