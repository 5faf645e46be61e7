//! Protobuf packet definitions.
//!
//! Field numbers must stay byte-compatible with the tower `packets.proto`
//! schema shared with the ground control station.
//!
//! `MeshPacket.msg` is a `oneof` on the wire. It is declared here as four
//! optional fields: the encoding is identical, and decoding keeps every field
//! that was present so the envelope layer can reject packets that set more
//! than one of them instead of silently keeping the last.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BasePacket {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
    #[prost(int32, tag = "2")]
    pub node_id: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestConfigPacket {
    #[prost(message, optional, tag = "1")]
    pub base_packet: Option<BasePacket>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConfigPacket {
    #[prost(message, optional, tag = "1")]
    pub base_packet: Option<BasePacket>,
    #[prost(float, tag = "2")]
    pub gain: f32,
    #[prost(int32, tag = "3")]
    pub sampling_rate: i32,
    #[prost(int32, tag = "4")]
    pub center_frequency: i32,
    #[prost(int32, tag = "5")]
    pub run_num: i32,
    #[prost(bool, tag = "6")]
    pub enable_test_data: bool,
    #[prost(int32, tag = "7")]
    pub ping_width_ms: i32,
    #[prost(int32, tag = "8")]
    pub ping_min_snr: i32,
    #[prost(float, tag = "9")]
    pub ping_max_len_mult: f32,
    #[prost(float, tag = "10")]
    pub ping_min_len_mult: f32,
    #[prost(int32, repeated, tag = "11")]
    pub target_frequencies: Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PingPacket {
    #[prost(message, optional, tag = "1")]
    pub base_packet: Option<BasePacket>,
    #[prost(int32, tag = "2")]
    pub frequency: i32,
    #[prost(float, tag = "3")]
    pub amplitude: f32,
    #[prost(double, tag = "4")]
    pub latitude: f64,
    #[prost(double, tag = "5")]
    pub longitude: f64,
    #[prost(float, tag = "6")]
    pub altitude: f32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorPacket {
    #[prost(message, optional, tag = "1")]
    pub base_packet: Option<BasePacket>,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

/// Top-level envelope placed on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MeshPacket {
    #[prost(message, optional, tag = "1")]
    pub request_config: Option<RequestConfigPacket>,
    #[prost(message, optional, tag = "2")]
    pub config: Option<ConfigPacket>,
    #[prost(message, optional, tag = "3")]
    pub ping: Option<PingPacket>,
    #[prost(message, optional, tag = "4")]
    pub error: Option<ErrorPacket>,
}

impl MeshPacket {
    /// Number of `msg` union members present.
    pub fn variant_count(&self) -> usize {
        [
            self.request_config.is_some(),
            self.config.is_some(),
            self.ping.is_some(),
            self.error.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}
