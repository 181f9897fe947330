//! OBD-II Client over CAN
//!
//! Builds single-frame Mode 01 requests, sends them on a [`CanTransport`]
//! and waits for the matching ECU response within one deadline.

use crate::error::{ObdError, TransportError};
use crate::frame::CanFrame;
use crate::mode;
use crate::pid::Pid;
use crate::transport::CanTransport;
use embedded_can::StandardId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Default timeout for OBD requests
pub const DEFAULT_TIMEOUT_MS: u64 = 500;

/// Functional broadcast address for requests
pub const OBD_REQUEST_ID: u32 = 0x7DF;
/// First physical ECU response address
pub const OBD_RESPONSE_ID_MIN: u32 = 0x7E8;
/// Last physical ECU response address
pub const OBD_RESPONSE_ID_MAX: u32 = 0x7EF;

const REQUEST_ID: StandardId = match StandardId::new(OBD_REQUEST_ID as u16) {
    Some(id) => id,
    None => panic!("0x7DF is an 11-bit identifier"),
};

/// Service 0x01: show current data
pub const SERVICE_CURRENT_DATA: u8 = mode::CURRENT_DATA;
/// Positive response to service 0x01 (0x41)
pub const SERVICE_CURRENT_DATA_RESPONSE: u8 = mode::CURRENT_DATA + mode::POSITIVE_RESPONSE_OFFSET;

/// Most data bytes a single-frame Mode 01 response can carry
pub const MAX_DATA_BYTES: usize = 5;

/// Build the Mode 01 request frame for a PID
pub fn build_request(pid: Pid) -> CanFrame {
    let data = [0x02, SERVICE_CURRENT_DATA, pid.as_hex(), 0x00, 0x00, 0x00, 0x00, 0x00];
    CanFrame::from_standard(REQUEST_ID, data)
}

/// Check if a CAN ID is an OBD-II response (0x7E8-0x7EF)
pub fn is_obd_response(id: u32) -> bool {
    (OBD_RESPONSE_ID_MIN..=OBD_RESPONSE_ID_MAX).contains(&id)
}

/// Data bytes of a matched response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPidData {
    /// The PID that was answered
    pub pid: Pid,
    /// Responding ECU address
    pub source_id: u32,
    len: u8,
    data: [u8; MAX_DATA_BYTES],
}

impl RawPidData {
    /// Data bytes following the service and PID bytes
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Decode with the PID's registry formula
    pub fn decode(&self) -> i32 {
        self.pid.decode(self.bytes())
    }
}

/// Decoded result of a single PID query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidReading {
    /// The PID that was queried
    pub pid: Pid,
    /// Decoded physical value
    pub value: i32,
    /// Responding ECU address
    pub source_id: u32,
    /// Timestamp when the response was received (Unix ms)
    pub timestamp_ms: u64,
}

/// Outcome of checking one received frame against a pending request
enum Match {
    Accepted(RawPidData),
    Ignored(&'static str),
}

/// Check a received frame against the PID we are waiting for.
///
/// Layout is `[len, 0x41, pid, data...]` with `len - 2` data bytes starting
/// at offset 3, at most [`MAX_DATA_BYTES`] of which are kept.
fn match_response(frame: &CanFrame, pid: Pid) -> Result<Match, ObdError> {
    if !is_obd_response(frame.raw_id()) || frame.is_extended() {
        return Ok(Match::Ignored("identifier outside ECU response range"));
    }
    if frame.is_remote() {
        return Ok(Match::Ignored("remote frame"));
    }

    let payload = frame.payload();
    if payload.len() < 3 {
        return Err(ObdError::MalformedResponse(format!(
            "{} byte payload from 0x{:03X}",
            payload.len(),
            frame.raw_id()
        )));
    }
    if payload[1] != SERVICE_CURRENT_DATA_RESPONSE {
        return Ok(Match::Ignored("not a Mode 01 positive response"));
    }
    if payload[2] != pid.as_hex() {
        return Ok(Match::Ignored("response for a different PID"));
    }

    let reported = payload[0] as usize;
    if reported < 2 {
        return Err(ObdError::MalformedResponse(format!("length byte {}", reported)));
    }
    let count = (reported - 2).min(MAX_DATA_BYTES);
    let available = payload.len() - 3;
    if count > available {
        return Err(ObdError::MalformedResponse(format!(
            "length byte {} does not fit a {} byte frame",
            reported,
            payload.len()
        )));
    }

    let min_bytes = pid.descriptor().min_bytes;
    if count < min_bytes {
        return Err(ObdError::MalformedResponse(format!(
            "PID {:02X} needs {} data bytes, got {}",
            pid.as_hex(),
            min_bytes,
            count
        )));
    }

    let mut data = [0u8; MAX_DATA_BYTES];
    data[..count].copy_from_slice(&payload[3..3 + count]);
    Ok(Match::Accepted(RawPidData {
        pid,
        source_id: frame.raw_id(),
        len: count as u8,
        data,
    }))
}

/// OBD-II client owning one CAN transport
pub struct ObdClient<T> {
    /// Bus the client talks on
    transport: T,
    /// Timeout used by `query`
    timeout: Duration,
    /// Whether `initialize` succeeded
    initialized: bool,
}

impl<T: CanTransport> ObdClient<T> {
    /// Create a new OBD client on a transport
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            initialized: false,
        }
    }

    /// Initialize the engine; the transport must already be up
    pub fn initialize(&mut self) -> Result<(), ObdError> {
        if !self.transport.is_ready() {
            return Err(ObdError::NotInitialized);
        }
        self.initialized = true;
        info!("OBD client initialized");
        Ok(())
    }

    /// Request one PID and wait for its response.
    ///
    /// Frames from other identifiers, other services or other PIDs are
    /// skipped; `timeout` is a single deadline across all of them. No retry
    /// is attempted.
    pub async fn request_and_receive(
        &mut self,
        pid: Pid,
        timeout: Duration,
    ) -> Result<RawPidData, ObdError> {
        if !self.initialized {
            return Err(ObdError::NotInitialized);
        }
        if timeout.is_zero() {
            return Err(ObdError::InvalidParameter("timeout must be non-zero".to_string()));
        }

        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return Err(ObdError::InvalidParameter(format!(
                "timeout {:?} is out of range",
                timeout
            )));
        };
        let timeout_ms = timeout.as_millis() as u64;

        debug!("Requesting PID {:02X}", pid.as_hex());
        self.transport
            .send(&build_request(pid))
            .await
            .map_err(ObdError::TransportFailed)?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ObdError::Timeout(timeout_ms));
            }

            let frame = match self.transport.receive(remaining).await {
                Ok(frame) => frame,
                Err(TransportError::Timeout(_)) => return Err(ObdError::Timeout(timeout_ms)),
                Err(e) => return Err(e.into()),
            };

            match match_response(&frame, pid)? {
                Match::Accepted(raw) => {
                    trace!("PID {:02X} answered by 0x{:03X}", pid.as_hex(), raw.source_id);
                    return Ok(raw);
                }
                Match::Ignored(reason) => {
                    debug!(
                        "Ignoring frame {} while waiting for PID {:02X}: {}",
                        frame,
                        pid.as_hex(),
                        reason
                    );
                }
            }
        }
    }

    /// Query a PID with the configured timeout and decode it
    pub async fn query(&mut self, pid: Pid) -> Result<PidReading, ObdError> {
        let raw = self.request_and_receive(pid, self.timeout).await?;

        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Ok(PidReading {
            pid,
            value: raw.decode(),
            source_id: raw.source_id,
            timestamp_ms,
        })
    }

    /// Set request timeout used by `query`
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Request timeout used by `query`
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Check if `initialize` succeeded
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Borrow the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Wrap into a cloneable handle that serializes exchanges
    pub fn into_shared(self) -> SharedObdClient<T> {
        SharedObdClient {
            inner: Arc::new(Mutex::new(self)),
        }
    }
}

/// Cloneable handle to one client.
///
/// The response carries no request id, only the PID, so two requests must
/// never be outstanding at once. The lock is held for the whole exchange.
pub struct SharedObdClient<T> {
    inner: Arc<Mutex<ObdClient<T>>>,
}

impl<T> Clone for SharedObdClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: CanTransport> SharedObdClient<T> {
    /// Exclusive access for several exchanges in a row
    pub async fn lock(&self) -> MutexGuard<'_, ObdClient<T>> {
        self.inner.lock().await
    }

    /// Run one exchange while holding the lock
    pub async fn request_and_receive(
        &self,
        pid: Pid,
        timeout: Duration,
    ) -> Result<RawPidData, ObdError> {
        self.inner.lock().await.request_and_receive(pid, timeout).await
    }

    /// Query with the client's timeout while holding the lock
    pub async fn query(&self, pid: Pid) -> Result<PidReading, ObdError> {
        self.inner.lock().await.query(pid).await
    }
}
