//! OBD-II over CAN
//!
//! This crate provides the CAN frame transport abstraction and a
//! single-frame OBD-II (SAE J1979 Mode 01) request/response engine with its
//! PID decode registry. ISO-TP multi-frame messages are not handled.

mod client;
mod error;
mod frame;
mod pid;
pub mod sim;
pub mod slcan;
mod transport;

pub use client::{
    build_request, is_obd_response, ObdClient, PidReading, RawPidData, SharedObdClient,
    DEFAULT_TIMEOUT_MS, MAX_DATA_BYTES, OBD_REQUEST_ID, OBD_RESPONSE_ID_MAX, OBD_RESPONSE_ID_MIN,
};
pub use error::{ObdError, TransportError};
pub use frame::{CanFrame, MAX_DLC};
pub use pid::{lookup, registry, Pid, PidDescriptor};
pub use transport::{poll_receive, CanTransport, FramePoller, DEFAULT_POLL_INTERVAL};

/// OBD-II service (mode) constants
pub mod mode {
    /// Current data
    pub const CURRENT_DATA: u8 = 0x01;
    /// Positive response offset added to the requested service
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
}
