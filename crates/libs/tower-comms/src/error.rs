/// Invalid node or acknowledgment configuration.
///
/// Returned from session construction and config loading; never from the
/// send or receive paths.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid node config: {0}")]
    InvalidNode(String),

    #[error("invalid ack policy: {0}")]
    InvalidAckPolicy(String),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Send-time or link-level failure of the mesh medium.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("transport not started")]
    NotStarted,

    #[error("payload of {len} bytes exceeds the medium limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("failed to open {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("radio handshake failed: {0}")]
    Handshake(String),

    #[error("link closed")]
    LinkClosed,

    #[error("packet id {0} does not fit the medium's 32-bit packet id")]
    PacketIdOutOfRange(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns `true` for failures a later resend may get past.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::LinkClosed)
    }
}

/// Failure of a session `send_*` call.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("session not started")]
    NotStarted,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error a message handler may return; caught and logged at dispatch.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_render_context() {
        let err = TransportError::PayloadTooLarge { len: 300, max: 233 };
        assert_eq!(
            err.to_string(),
            "payload of 300 bytes exceeds the medium limit of 233"
        );
        assert!(!err.is_retryable());
        assert!(TransportError::LinkClosed.is_retryable());
    }

    #[test]
    fn panic_payloads_render_as_text() {
        let literal = std::panic::catch_unwind(|| panic!("boom")).expect_err("panics");
        assert_eq!(panic_message(literal.as_ref()), "boom");
        let formatted = std::panic::catch_unwind(|| panic!("code {}", 7)).expect_err("panics");
        assert_eq!(panic_message(formatted.as_ref()), "code 7");
    }

    #[test]
    fn send_error_wraps_transport_error_transparently() {
        let err: SendError = TransportError::NotStarted.into();
        assert_eq!(err.to_string(), "transport not started");
    }
}
