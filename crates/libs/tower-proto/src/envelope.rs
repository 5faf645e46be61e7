//! Envelope encode/decode.
//!
//! Converts between the typed [`Envelope`] and the protobuf [`MeshPacket`]
//! bytes placed on the mesh.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;

use crate::payload::{ConfigData, ErrorData, PingData, RequestConfigData};
use crate::wire::{
    BasePacket, ConfigPacket, ErrorPacket, MeshPacket, PingPacket, RequestConfigPacket,
};

/// Errors from decoding an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("protobuf decode error: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("envelope carries no message variant")]
    Empty,

    #[error("envelope carries {0} message variants (expected exactly one)")]
    Ambiguous(usize),
}

/// Discriminant of the envelope union, used to key handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    RequestConfig,
    Config,
    Ping,
    Error,
}

impl MessageKind {
    pub const ALL: [MessageKind; 4] = [
        MessageKind::RequestConfig,
        MessageKind::Config,
        MessageKind::Ping,
        MessageKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::RequestConfig => "request_config",
            MessageKind::Config => "config",
            MessageKind::Ping => "ping",
            MessageKind::Error => "error",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header common to every packet variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BaseHeader {
    /// Microseconds since the Unix epoch, stamped by the sender.
    pub timestamp_micros: u64,
    /// Originating node number. Mesh node numbers are 32-bit unsigned; the
    /// wire field is `int32`, so the bits are carried unchanged.
    pub node_id: i32,
}

impl BaseHeader {
    pub fn new(timestamp_micros: u64, node_id: i32) -> Self {
        Self {
            timestamp_micros,
            node_id,
        }
    }

    /// Header stamped with the current wall-clock time.
    pub fn now(node_id: i32) -> Self {
        Self::new(now_micros(), node_id)
    }

    /// The node number as the unsigned value the mesh uses.
    pub fn node_num(&self) -> u32 {
        self.node_id as u32
    }

    fn to_wire(self) -> Option<BasePacket> {
        Some(BasePacket {
            timestamp: self.timestamp_micros,
            node_id: self.node_id,
        })
    }

    fn from_wire(base: Option<&BasePacket>) -> Self {
        base.map(|b| Self::new(b.timestamp, b.node_id))
            .unwrap_or_default()
    }
}

/// Current time in microseconds since the Unix epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// The active union member of an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    RequestConfig(RequestConfigData),
    Config(ConfigData),
    Ping(PingData),
    Error(ErrorData),
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::RequestConfig(_) => MessageKind::RequestConfig,
            Body::Config(_) => MessageKind::Config,
            Body::Ping(_) => MessageKind::Ping,
            Body::Error(_) => MessageKind::Error,
        }
    }
}

/// A decoded or to-be-encoded tower message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: BaseHeader,
    pub body: Body,
}

impl Envelope {
    pub fn new(header: BaseHeader, body: Body) -> Self {
        Self { header, body }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_wire().encode_to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let packet = MeshPacket::decode(data)?;
        Self::from_wire(packet)
    }

    fn to_wire(&self) -> MeshPacket {
        let base_packet = self.header.to_wire();
        let mut packet = MeshPacket::default();
        match &self.body {
            Body::RequestConfig(_) => {
                packet.request_config = Some(RequestConfigPacket { base_packet });
            }
            Body::Config(config) => {
                packet.config = Some(ConfigPacket {
                    base_packet,
                    gain: config.gain,
                    sampling_rate: config.sampling_rate,
                    center_frequency: config.center_frequency,
                    run_num: config.run_num,
                    enable_test_data: config.enable_test_data,
                    ping_width_ms: config.ping_width_ms,
                    ping_min_snr: config.ping_min_snr,
                    ping_max_len_mult: config.ping_max_len_mult,
                    ping_min_len_mult: config.ping_min_len_mult,
                    target_frequencies: config.target_frequencies.clone(),
                });
            }
            Body::Ping(ping) => {
                packet.ping = Some(PingPacket {
                    base_packet,
                    frequency: ping.frequency,
                    amplitude: ping.amplitude,
                    latitude: ping.latitude,
                    longitude: ping.longitude,
                    altitude: ping.altitude,
                });
            }
            Body::Error(error) => {
                packet.error = Some(ErrorPacket {
                    base_packet,
                    error_message: error.error_message.clone(),
                });
            }
        }
        packet
    }

    fn from_wire(packet: MeshPacket) -> Result<Self, DecodeError> {
        match packet.variant_count() {
            0 => return Err(DecodeError::Empty),
            1 => {}
            n => return Err(DecodeError::Ambiguous(n)),
        }

        if let Some(request) = packet.request_config {
            let header = BaseHeader::from_wire(request.base_packet.as_ref());
            return Ok(Self::new(header, Body::RequestConfig(RequestConfigData)));
        }

        if let Some(config) = packet.config {
            let header = BaseHeader::from_wire(config.base_packet.as_ref());
            let data = ConfigData {
                gain: config.gain,
                sampling_rate: config.sampling_rate,
                center_frequency: config.center_frequency,
                run_num: config.run_num,
                enable_test_data: config.enable_test_data,
                ping_width_ms: config.ping_width_ms,
                ping_min_snr: config.ping_min_snr,
                ping_max_len_mult: config.ping_max_len_mult,
                ping_min_len_mult: config.ping_min_len_mult,
                target_frequencies: config.target_frequencies,
            };
            return Ok(Self::new(header, Body::Config(data)));
        }

        if let Some(ping) = packet.ping {
            let header = BaseHeader::from_wire(ping.base_packet.as_ref());
            let data = PingData {
                frequency: ping.frequency,
                amplitude: ping.amplitude,
                latitude: ping.latitude,
                longitude: ping.longitude,
                altitude: ping.altitude,
            };
            return Ok(Self::new(header, Body::Ping(data)));
        }

        match packet.error {
            Some(error) => {
                let header = BaseHeader::from_wire(error.base_packet.as_ref());
                let data = ErrorData {
                    error_message: error.error_message,
                };
                Ok(Self::new(header, Body::Error(data)))
            }
            None => Err(DecodeError::Empty),
        }
    }
}

/// Encode `body` under `header` into wire bytes.
pub fn encode(body: &Body, header: BaseHeader) -> Vec<u8> {
    Envelope::new(header, body.clone()).encode()
}

/// Decode wire bytes, rejecting envelopes with zero or several variants set.
pub fn decode(data: &[u8]) -> Result<Envelope, DecodeError> {
    Envelope::decode(data)
}
