//! Classic CAN Frame
//!
//! A single CAN 2.0 frame as moved by a [`CanTransport`](crate::CanTransport).
//! The identifier variant carries the standard/extended tag, so the width
//! of the id and the `extended` flag can never disagree.

use crate::error::TransportError;
use embedded_can::{ExtendedId, Id, StandardId};
use std::fmt;

/// Maximum payload of a classic CAN frame
pub const MAX_DLC: usize = 8;

/// A classic CAN frame (0-8 payload bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    remote: bool,
    len: u8,
    data: [u8; MAX_DLC],
}

impl CanFrame {
    /// Create a data frame with an 11-bit identifier
    pub fn new_standard(id: u16, data: &[u8]) -> Result<Self, TransportError> {
        let id = StandardId::new(id).ok_or(TransportError::InvalidId(id as u32))?;
        Self::with_id(Id::Standard(id), false, data.len(), data)
    }

    /// Create a data frame with a 29-bit identifier
    pub fn new_extended(id: u32, data: &[u8]) -> Result<Self, TransportError> {
        let id = ExtendedId::new(id).ok_or(TransportError::InvalidId(id))?;
        Self::with_id(Id::Extended(id), false, data.len(), data)
    }

    /// Create a full 8-byte data frame from an already validated identifier
    pub fn from_standard(id: StandardId, data: [u8; MAX_DLC]) -> Self {
        Self {
            id: Id::Standard(id),
            remote: false,
            len: MAX_DLC as u8,
            data,
        }
    }

    /// Build a frame from raw controller register values.
    ///
    /// Controllers report a 4-bit DLC; anything above 8 is rejected rather
    /// than silently clamped.
    pub fn from_raw_parts(
        id: u32,
        extended: bool,
        remote: bool,
        dlc: usize,
        data: &[u8],
    ) -> Result<Self, TransportError> {
        let id = if extended {
            Id::Extended(ExtendedId::new(id).ok_or(TransportError::InvalidId(id))?)
        } else {
            let raw = u16::try_from(id).map_err(|_| TransportError::InvalidId(id))?;
            Id::Standard(StandardId::new(raw).ok_or(TransportError::InvalidId(id))?)
        };
        Self::with_id(id, remote, dlc, data)
    }

    fn with_id(id: Id, remote: bool, dlc: usize, data: &[u8]) -> Result<Self, TransportError> {
        if dlc > MAX_DLC {
            return Err(TransportError::InvalidLength(dlc));
        }
        let mut payload = [0u8; MAX_DLC];
        if !remote {
            if data.len() < dlc {
                return Err(TransportError::InvalidLength(data.len()));
            }
            payload[..dlc].copy_from_slice(&data[..dlc]);
        }
        Ok(Self {
            id,
            remote,
            len: dlc as u8,
            data: payload,
        })
    }

    /// Raw identifier value, interpreted per [`is_extended`](Self::is_extended)
    pub fn raw_id(&self) -> u32 {
        match self.id {
            Id::Standard(id) => id.as_raw() as u32,
            Id::Extended(id) => id.as_raw(),
        }
    }

    /// Whether the identifier is 29 bits wide
    pub fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    /// Whether this is a remote transmission request
    pub fn is_remote(&self) -> bool {
        self.remote
    }

    /// Data length code (0-8)
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the frame carries no payload bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes (empty for remote frames)
    pub fn payload(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..self.len()]
        }
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_extended() {
            write!(f, "{:08X}", self.raw_id())?;
        } else {
            write!(f, "{:03X}", self.raw_id())?;
        }
        write!(f, " [{}]", self.len)?;
        if self.remote {
            return write!(f, " RTR");
        }
        for byte in self.payload() {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Self::with_id(id.into(), false, data.len(), data).ok()
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        Self::with_id(id.into(), true, dlc, &[]).ok()
    }

    fn is_extended(&self) -> bool {
        CanFrame::is_extended(self)
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.len()
    }

    fn data(&self) -> &[u8] {
        self.payload()
    }
}
