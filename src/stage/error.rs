// Error taxonomy for the stage transport, driver and homing controller

/// Error types for stage communication
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Rejected before anything is written to the port
    #[error("Invalid {name}: received {received}, expected {expected}")]
    InvalidArgument {
        name: &'static str,
        received: String,
        expected: String,
    },

    #[error("Attempted to communicate with stage, but no instrument is connected")]
    NotConnected,

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Serial communication error: {0}")]
    Communication(#[from] std::io::Error),

    #[error("Could not decode response {response:?} to query {query:?}: {reason}")]
    Decode {
        query: String,
        response: String,
        reason: String,
    },

    /// Homing was interrupted; the motor has already been sent a hard halt
    #[error("Homing of motor {motor} cancelled by user")]
    Cancelled { motor: u8 },
}

pub type Result<T> = std::result::Result<T, StageError>;

impl StageError {
    pub(crate) fn invalid(
        name: &'static str,
        received: impl std::fmt::Display,
        expected: impl Into<String>,
    ) -> Self {
        StageError::InvalidArgument {
            name,
            received: received.to_string(),
            expected: expected.into(),
        }
    }

    pub(crate) fn decode(query: &str, response: &str, reason: impl Into<String>) -> Self {
        StageError::Decode {
            query: query.to_string(),
            response: response.to_string(),
            reason: reason.into(),
        }
    }
}
