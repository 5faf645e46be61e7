//! Typed application payloads carried by the envelope.

use serde::{Deserialize, Serialize};

use crate::envelope::{Body, MessageKind};

/// Request for the receiving node (normally the GCS) to send its configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfigData;

/// Receiver and detector settings a GCS pushes to a tower.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigData {
    pub gain: f32,
    pub sampling_rate: i32,
    pub center_frequency: i32,
    pub run_num: i32,
    pub enable_test_data: bool,
    pub ping_width_ms: i32,
    pub ping_min_snr: i32,
    pub ping_max_len_mult: f32,
    pub ping_min_len_mult: f32,
    #[serde(default)]
    pub target_frequencies: Vec<i32>,
}

/// A detected transmitter ping and where the tower was when it heard it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PingData {
    /// Hz.
    pub frequency: i32,
    pub amplitude: f32,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub error_message: String,
}

impl ErrorData {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
        }
    }
}

/// Maps a payload type to its envelope variant.
///
/// Implemented for exactly the four packet types of the wire schema; the
/// router uses it to key handlers by [`MessageKind`].
pub trait Payload: Clone + Send + Sync + 'static {
    const KIND: MessageKind;

    fn into_body(self) -> Body;

    fn from_body(body: &Body) -> Option<&Self>;
}

impl Payload for RequestConfigData {
    const KIND: MessageKind = MessageKind::RequestConfig;

    fn into_body(self) -> Body {
        Body::RequestConfig(self)
    }

    fn from_body(body: &Body) -> Option<&Self> {
        match body {
            Body::RequestConfig(data) => Some(data),
            _ => None,
        }
    }
}

impl Payload for ConfigData {
    const KIND: MessageKind = MessageKind::Config;

    fn into_body(self) -> Body {
        Body::Config(self)
    }

    fn from_body(body: &Body) -> Option<&Self> {
        match body {
            Body::Config(data) => Some(data),
            _ => None,
        }
    }
}

impl Payload for PingData {
    const KIND: MessageKind = MessageKind::Ping;

    fn into_body(self) -> Body {
        Body::Ping(self)
    }

    fn from_body(body: &Body) -> Option<&Self> {
        match body {
            Body::Ping(data) => Some(data),
            _ => None,
        }
    }
}

impl Payload for ErrorData {
    const KIND: MessageKind = MessageKind::Error;

    fn into_body(self) -> Body {
        Body::Error(self)
    }

    fn from_body(body: &Body) -> Option<&Self> {
        match body {
            Body::Error(data) => Some(data),
            _ => None,
        }
    }
}
