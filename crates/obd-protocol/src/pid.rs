//! OBD-II PID Registry
//!
//! The fixed table of serviceable Mode 01 PIDs: how many data bytes each
//! response must carry and how those bytes decode to a physical value.

use crate::error::ObdError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mode 01 PIDs serviceable by this engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Throttle position (0x11)
    ThrottlePosition = 0x11,
}

impl Pid {
    /// Order in which a polling cycle requests the PIDs
    pub const POLL_ORDER: [Pid; 4] = [
        Pid::Rpm,
        Pid::Speed,
        Pid::CoolantTemp,
        Pid::ThrottlePosition,
    ];

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Registry entry for this PID
    pub fn descriptor(&self) -> &'static PidDescriptor {
        match self {
            Pid::Rpm => &REGISTRY[0],
            Pid::Speed => &REGISTRY[1],
            Pid::CoolantTemp => &REGISTRY[2],
            Pid::ThrottlePosition => &REGISTRY[3],
        }
    }

    /// Decode response data bytes with this PID's formula
    pub fn decode(&self, bytes: &[u8]) -> i32 {
        self.descriptor().decode(bytes)
    }
}

impl TryFrom<u8> for Pid {
    type Error = ObdError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        lookup(code)
            .map(|descriptor| descriptor.pid)
            .ok_or(ObdError::PidNotSupported(code))
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.descriptor().name, self.as_hex())
    }
}

/// One row of the decode table
pub struct PidDescriptor {
    pub pid: Pid,
    pub name: &'static str,
    pub unit: &'static str,
    /// Minimum data bytes a response must carry
    pub min_bytes: usize,
    /// Value reported when a read fails or data is short
    pub fallback: i32,
    formula: fn(&[u8]) -> i32,
}

impl PidDescriptor {
    /// Decode data bytes into the physical value.
    ///
    /// Fewer than `min_bytes` yields `fallback` instead of reading past the slice.
    pub fn decode(&self, bytes: &[u8]) -> i32 {
        if bytes.len() < self.min_bytes {
            return self.fallback;
        }
        (self.formula)(bytes)
    }
}

impl fmt::Debug for PidDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PidDescriptor")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("unit", &self.unit)
            .field("min_bytes", &self.min_bytes)
            .field("fallback", &self.fallback)
            .finish()
    }
}

// RPM: ((A*256)+B)/4, truncated
fn decode_rpm(bytes: &[u8]) -> i32 {
    (bytes[0] as i32 * 256 + bytes[1] as i32) / 4
}

// Speed: A (km/h)
fn decode_speed(bytes: &[u8]) -> i32 {
    bytes[0] as i32
}

// Coolant Temp: A - 40 (°C)
fn decode_coolant(bytes: &[u8]) -> i32 {
    bytes[0] as i32 - 40
}

// Throttle position: A * 100 / 255 (%), integer division
fn decode_throttle(bytes: &[u8]) -> i32 {
    bytes[0] as i32 * 100 / 255
}

static REGISTRY: [PidDescriptor; 4] = [
    PidDescriptor {
        pid: Pid::Rpm,
        name: "engine_rpm",
        unit: "rpm",
        min_bytes: 2,
        fallback: 0,
        formula: decode_rpm,
    },
    PidDescriptor {
        pid: Pid::Speed,
        name: "vehicle_speed",
        unit: "km/h",
        min_bytes: 1,
        fallback: 0,
        formula: decode_speed,
    },
    PidDescriptor {
        pid: Pid::CoolantTemp,
        name: "coolant_temp",
        unit: "°C",
        min_bytes: 1,
        fallback: -40,
        formula: decode_coolant,
    },
    PidDescriptor {
        pid: Pid::ThrottlePosition,
        name: "throttle_position",
        unit: "%",
        min_bytes: 1,
        fallback: 0,
        formula: decode_throttle,
    },
];

/// All registry entries
pub fn registry() -> &'static [PidDescriptor] {
    &REGISTRY
}

/// Find the registry entry for a raw PID code
pub fn lookup(code: u8) -> Option<&'static PidDescriptor> {
    REGISTRY.iter().find(|descriptor| descriptor.pid.as_hex() == code)
}
