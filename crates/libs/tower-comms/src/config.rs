//! Node identity, transport choice and acknowledgment policy.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::iface::NodeId;

/// Which medium the session talks over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceType {
    Meshtastic,
    Simulated,
}

/// Identity and transport choice for one node.
///
/// A Meshtastic node names its serial `device` and learns its identity from
/// the radio. A simulated node carries its own `numeric_id` and `user_id`.
/// Only the group matching `interface_type` may be populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub interface_type: InterfaceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A [`NodeConfig`] that passed validation, reduced to what the transport needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportChoice {
    Meshtastic { device: String },
    Simulated { node_id: NodeId, user_id: String },
}

impl NodeConfig {
    pub fn meshtastic(device: impl Into<String>) -> Self {
        Self {
            interface_type: InterfaceType::Meshtastic,
            device: Some(device.into()),
            numeric_id: None,
            user_id: None,
        }
    }

    pub fn simulated(numeric_id: NodeId, user_id: impl Into<String>) -> Self {
        Self {
            interface_type: InterfaceType::Simulated,
            device: None,
            numeric_id: Some(numeric_id),
            user_id: Some(user_id.into()),
        }
    }

    pub fn validate(&self) -> Result<TransportChoice, ConfigError> {
        match self.interface_type {
            InterfaceType::Meshtastic => {
                if self.numeric_id.is_some() || self.user_id.is_some() {
                    return Err(ConfigError::InvalidNode(
                        "meshtastic nodes take numeric_id and user_id from the radio".into(),
                    ));
                }
                match self.device.as_deref().map(str::trim) {
                    Some(device) if !device.is_empty() => Ok(TransportChoice::Meshtastic {
                        device: device.to_string(),
                    }),
                    _ => Err(ConfigError::InvalidNode(
                        "meshtastic requires a device path".into(),
                    )),
                }
            }
            InterfaceType::Simulated => {
                if self.device.is_some() {
                    return Err(ConfigError::InvalidNode(
                        "simulated nodes have no device; remove device".into(),
                    ));
                }
                let node_id = self.numeric_id.ok_or_else(|| {
                    ConfigError::InvalidNode("simulated requires numeric_id".into())
                })?;
                match self.user_id.as_deref().map(str::trim) {
                    Some(user_id) if !user_id.is_empty() => Ok(TransportChoice::Simulated {
                        node_id,
                        user_id: user_id.to_string(),
                    }),
                    _ => Err(ConfigError::InvalidNode(
                        "simulated requires user_id".into(),
                    )),
                }
            }
        }
    }
}

/// Session-wide retry behaviour for acknowledged sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPolicy {
    /// Time to wait for an acknowledgment before resending.
    #[serde(rename = "retry_interval_ms", with = "duration_ms")]
    pub retry_interval: Duration,
    /// Total sends per message, the first included.
    pub max_attempts: u32,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(10),
            max_attempts: 3,
        }
    }
}

impl AckPolicy {
    pub fn new(retry_interval: Duration, max_attempts: u32) -> Self {
        Self {
            retry_interval,
            max_attempts,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidAckPolicy(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::InvalidAckPolicy(
                "retry_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// File-level configuration: `[node]` plus an optional `[ack]` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TowerCommsConfig {
    pub node: NodeConfig,
    #[serde(default)]
    pub ack: AckPolicy,
}

impl TowerCommsConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.node.validate()?;
        config.ack.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
