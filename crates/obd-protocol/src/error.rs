//! Transport and OBD-II Error Types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by a CAN transport while moving single frames
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Bus controller used before it was brought up
    #[error("CAN controller not initialized")]
    NotReady,

    /// Controller refused or failed the transmission (arbitration loss, bus error)
    #[error("Transmission rejected by controller: {0}")]
    Rejected(String),

    /// Payload longer than a classic CAN frame can carry
    #[error("Invalid frame length {0} (max 8 bytes)")]
    InvalidLength(usize),

    /// Identifier does not fit its 11-bit or 29-bit width
    #[error("Invalid CAN identifier 0x{0:X}")]
    InvalidId(u32),

    /// No frame arrived within the receive window
    #[error("No frame received within {0}ms")]
    Timeout(u64),

    /// Receive window too large to form a deadline
    #[error("Receive timeout {0:?} is out of range")]
    InvalidTimeout(Duration),

    /// Adapter sent bytes that do not form a valid frame
    #[error("Framing error: {0}")]
    Framing(String),

    /// Underlying device or stream failure
    #[error("Bus I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Errors that can occur during an OBD-II exchange
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObdError {
    /// Caller passed an out-of-range argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Engine or transport used before initialization
    #[error("OBD engine not initialized")]
    NotInitialized,

    /// No matching response within the request window
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// Response frame violates the single-frame layout
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Send-side or bus-level failure
    #[error("Transport failed: {0}")]
    TransportFailed(TransportError),

    /// PID is not in the decode registry
    #[error("PID {0:02X} not supported")]
    PidNotSupported(u8),
}

impl ObdError {
    /// Whether the error is an expected per-field failure rather than a caller bug
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ObdError::Timeout(_) | ObdError::MalformedResponse(_) | ObdError::TransportFailed(_)
        )
    }
}

impl From<TransportError> for ObdError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotReady => ObdError::NotInitialized,
            TransportError::Timeout(ms) => ObdError::Timeout(ms),
            TransportError::InvalidTimeout(timeout) => {
                ObdError::InvalidParameter(format!("timeout {:?} is out of range", timeout))
            }
            other => ObdError::TransportFailed(other),
        }
    }
}
