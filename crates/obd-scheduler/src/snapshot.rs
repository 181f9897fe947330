//! Vehicle Snapshot

use obd_protocol::Pid;
use serde::{Deserialize, Serialize};

/// Decoded vehicle state produced by one polling cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    /// Engine RPM (truncated to whole revolutions)
    pub rpm: u16,
    /// Vehicle speed (km/h)
    pub speed_kmh: u8,
    /// Coolant temperature (°C)
    pub coolant_temp_c: i16,
    /// Throttle position (0-100%)
    pub throttle_pct: u8,
    /// Engine status, derived from rpm > 0
    pub engine_running: bool,
    /// Whether the last cycle passed the validity policy
    pub data_valid: bool,
    /// Timestamp of the last completed cycle (Unix ms)
    pub last_update_ms: u64,
}

impl VehicleSnapshot {
    /// Store a decoded registry value into the matching field
    pub(crate) fn apply(&mut self, pid: Pid, value: i32) {
        match pid {
            Pid::Rpm => self.rpm = value.clamp(0, u16::MAX as i32) as u16,
            Pid::Speed => self.speed_kmh = value.clamp(0, u8::MAX as i32) as u8,
            Pid::CoolantTemp => self.coolant_temp_c = value.clamp(-40, 215) as i16,
            Pid::ThrottlePosition => self.throttle_pct = value.clamp(0, 100) as u8,
        }
    }

    /// Milliseconds since the last completed cycle
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_update_ms)
    }

    /// Coarse riding state for dashboards
    pub fn riding_state(&self) -> RidingState {
        if !self.engine_running {
            RidingState::EngineOff
        } else if self.speed_kmh > 50 {
            RidingState::Highway
        } else if self.speed_kmh > 20 {
            RidingState::City
        } else if self.throttle_pct > 0 {
            RidingState::Accelerating
        } else {
            RidingState::Idle
        }
    }
}

/// Riding state derived from a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RidingState {
    EngineOff,
    Idle,
    Accelerating,
    City,
    Highway,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(speed_kmh: u8, throttle_pct: u8) -> VehicleSnapshot {
        VehicleSnapshot {
            rpm: 3000,
            speed_kmh,
            throttle_pct,
            engine_running: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_riding_state() {
        assert_eq!(VehicleSnapshot::default().riding_state(), RidingState::EngineOff);
        assert_eq!(running(0, 0).riding_state(), RidingState::Idle);
        assert_eq!(running(10, 30).riding_state(), RidingState::Accelerating);
        assert_eq!(running(21, 0).riding_state(), RidingState::City);
        assert_eq!(running(50, 0).riding_state(), RidingState::City);
        assert_eq!(running(51, 0).riding_state(), RidingState::Highway);
    }

    #[test]
    fn test_apply_values() {
        let mut snapshot = VehicleSnapshot::default();
        snapshot.apply(Pid::Rpm, 1726);
        snapshot.apply(Pid::Speed, 80);
        snapshot.apply(Pid::CoolantTemp, -40);
        snapshot.apply(Pid::ThrottlePosition, 100);
        assert_eq!(snapshot.rpm, 1726);
        assert_eq!(snapshot.speed_kmh, 80);
        assert_eq!(snapshot.coolant_temp_c, -40);
        assert_eq!(snapshot.throttle_pct, 100);
    }

    #[test]
    fn test_age() {
        let snapshot = VehicleSnapshot {
            last_update_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(snapshot.age_ms(1_250), 250);
        assert_eq!(snapshot.age_ms(500), 0);
    }
}
