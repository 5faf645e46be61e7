//! Communication core for radio-telemetry tower nodes.
//!
//! A [`TowerSession`] ties together:
//!
//! - a [`MeshTransport`]: a Meshtastic radio ([`MeshtasticTransport`]) or an
//!   in-process [`SimulatedMesh`]
//! - the `tower_proto` envelope codec
//! - an [`AckTracker`] that resends acknowledged messages until they are
//!   confirmed or run out of attempts
//! - a [`MessageRouter`] handing decoded messages to per-kind handlers
//!
//! Acknowledgments are transport control signals and never reach handlers.

pub mod ack;
pub mod config;
pub mod error;
pub mod iface;
pub mod router;
pub mod session;

pub use ack::{AckCallback, AckTracker, PendingAck};
pub use config::{AckPolicy, InterfaceType, NodeConfig, TowerCommsConfig, TransportChoice};
pub use error::{ConfigError, HandlerError, SendError, TransportError};
pub use iface::{
    InboundEvent, InboundSink, MeshTransport, MeshtasticTransport, NodeId, NodePosition, PacketId,
    SimulatedMesh, SimulatedTransport, MAX_PACKET_ID,
};
pub use router::{Dispatch, MessageRouter, Received};
pub use session::{TowerSession, TowerSessionBuilder};
