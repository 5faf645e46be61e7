//! # tower-proto
//!
//! Wire envelope for radio-telemetry tower communications.
//!
//! Every message a tower puts on the mesh is a single protobuf `MeshPacket`
//! whose `msg` union carries exactly one of four packet types. Each packet
//! embeds a `BasePacket` header with the sender's node number and a
//! microsecond timestamp.
//!
//! ## Wire Schema
//!
//! ```text
//! MeshPacket { oneof msg {
//!     RequestConfigPacket request_config = 1;
//!     ConfigPacket        config         = 2;
//!     PingPacket          ping           = 3;
//!     ErrorPacket         error          = 4;
//! } }
//! ```
//!
//! ## Example
//!
//! ```rust
//! use tower_proto::{BaseHeader, Body, Envelope, PingData};
//!
//! let ping = PingData {
//!     frequency: 915_000_000,
//!     amplitude: 0.8,
//!     latitude: 32.7,
//!     longitude: -117.1,
//!     altitude: 100.0,
//! };
//! let envelope = Envelope::new(BaseHeader::now(1), Body::Ping(ping.clone()));
//! let decoded = Envelope::decode(&envelope.encode()).unwrap();
//! assert_eq!(decoded.body, Body::Ping(ping));
//! assert_eq!(decoded.header.node_id, 1);
//! ```

pub mod envelope;
pub mod payload;
pub mod wire;

pub use envelope::{
    decode, encode, now_micros, BaseHeader, Body, DecodeError, Envelope, MessageKind,
};
pub use payload::{ConfigData, ErrorData, Payload, PingData, RequestConfigData};
