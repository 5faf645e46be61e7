//! Mesh transports.
//!
//! Every medium implements [`MeshTransport`]: it accepts opaque payloads for
//! a destination or broadcast and pushes [`InboundEvent`]s into the one sink
//! registered with it.

pub mod meshtastic;
pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

pub use meshtastic::MeshtasticTransport;
pub use simulated::{SimulatedMesh, SimulatedTransport};

/// 32-bit mesh node number.
pub type NodeId = u32;

/// Correlates an acknowledged send with its acknowledgment.
///
/// Sessions hand out ids in `1..=MAX_PACKET_ID`, the range a Meshtastic
/// packet id can carry; the radio rejects anything outside it.
pub type PacketId = u64;

/// Largest packet id a session allocates before wrapping back to 1.
pub const MAX_PACKET_ID: PacketId = u32::MAX as PacketId;

/// Capacity of the inbound event channel a session registers.
pub const INBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// An application payload from `from`.
    Data { from: NodeId, payload: Vec<u8> },
    /// The medium confirmed delivery of `packet_id`.
    Ack { from: NodeId, packet_id: PacketId },
    /// The link failed outside of any send call.
    LinkError { reason: String },
}

pub type InboundSink = mpsc::Sender<InboundEvent>;

/// Geographic position of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres.
    pub altitude: f64,
    /// Seconds since the Unix epoch of the fix.
    pub time: u32,
}

#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Replaces the inbound sink. Events are delivered in medium order.
    fn register_inbound(&self, sink: InboundSink);

    /// Opens the medium. A no-op when already started.
    async fn start(&self) -> Result<(), TransportError>;

    /// Closes the medium and releases its handles. Safe when never started.
    async fn stop(&self);

    /// Sends `payload` to `destination`, or broadcasts when `None`.
    ///
    /// With `ack = Some(id)` the medium reports delivery through an
    /// [`InboundEvent::Ack`] carrying `id`.
    async fn send(
        &self,
        payload: &[u8],
        destination: Option<NodeId>,
        ack: Option<PacketId>,
    ) -> Result<(), TransportError>;

    /// Own node number, once known.
    fn node_id(&self) -> Option<NodeId>;

    fn user_id(&self) -> Option<String>;

    /// User id the medium knows for `node`, this node included.
    fn node_user_id(&self, node: NodeId) -> Option<String>;

    fn neighbors(&self) -> Vec<NodeId>;

    fn position(&self) -> Option<NodePosition>;
}
