use thiserror::Error;

/// Engine-level error taxonomy. Every fallible engine operation funnels into
/// one of these variants; control handlers turn them into structured replies
/// and never let them cross the socket as panics.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// Bad request data: unknown device, missing file, channel not on the
    /// device, volume out of range. State is left untouched.
    #[error("validation error: {0}")]
    Validation(String),

    /// The decoder could not open or read the source file.
    #[error("decoder error: {0}")]
    Decoder(String),

    /// The DAQ driver refused a task operation or the device disappeared.
    /// Forces the transport back to Idle.
    #[error("device error: {0}")]
    Device(String),

    /// Malformed control message; closes the offending connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An internal invariant was violated. Logged, surfaced, state reset.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Short machine-readable tag used in protocol replies.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Decoder(_) => "decoder",
            EngineError::Device(_) => "device",
            EngineError::Protocol(_) => "protocol",
            EngineError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_variants() {
        assert_eq!(EngineError::Validation(String::new()).kind(), "validation");
        assert_eq!(EngineError::Decoder(String::new()).kind(), "decoder");
        assert_eq!(EngineError::Device(String::new()).kind(), "device");
        assert_eq!(EngineError::Protocol(String::new()).kind(), "protocol");
        assert_eq!(EngineError::Internal(String::new()).kind(), "internal");
    }

    #[test]
    fn display_carries_the_message() {
        let error = EngineError::Device("task aborted".to_string());
        assert_eq!(error.to_string(), "device error: task aborted");
    }
}
