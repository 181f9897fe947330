//! Simulated ECU Transport
//!
//! An in-memory CAN bus with a single ECU behind it. The ECU answers
//! service 0x01 requests for the PIDs it has values for, after a fixed
//! latency. Used by tests and by the reader when no adapter is configured.

use crate::client::{
    OBD_REQUEST_ID, OBD_RESPONSE_ID_MIN, SERVICE_CURRENT_DATA, SERVICE_CURRENT_DATA_RESPONSE,
};
use crate::error::TransportError;
use crate::frame::CanFrame;
use crate::pid::Pid;
use crate::transport::{poll_receive, CanTransport, FramePoller, DEFAULT_POLL_INTERVAL};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default ECU response latency
const DEFAULT_LATENCY_MS: u64 = 5;

/// Most recent sent frames kept for inspection
pub const SENT_LOG_CAPACITY: usize = 64;

/// In-memory bus with one scripted ECU
#[derive(Debug)]
pub struct SimulatedEcu {
    /// Whether the simulated controller is initialized
    ready: bool,
    /// Whether sends should be refused as a bus error
    reject_sends: bool,
    /// Identifier the ECU answers from
    response_id: u32,
    /// Delay between a request and its response becoming visible
    latency: Duration,
    /// Raw data bytes per PID code
    values: HashMap<u8, Vec<u8>>,
    /// PIDs the ECU ignores
    silent: HashSet<u8>,
    /// Frames in flight, ordered by arrival time
    inbox: VecDeque<(Instant, CanFrame)>,
    /// Last [`SENT_LOG_CAPACITY`] frames sent onto the bus
    sent: VecDeque<CanFrame>,
}

impl SimulatedEcu {
    /// Create a ready ECU reporting an idling engine
    pub fn new() -> Self {
        let mut ecu = Self {
            ready: true,
            reject_sends: false,
            response_id: OBD_RESPONSE_ID_MIN,
            latency: Duration::from_millis(DEFAULT_LATENCY_MS),
            values: HashMap::new(),
            silent: HashSet::new(),
            inbox: VecDeque::new(),
            sent: VecDeque::with_capacity(SENT_LOG_CAPACITY),
        };
        ecu.set_rpm(1500);
        ecu.set_speed(0);
        ecu.set_coolant_temp(85);
        ecu.set_throttle(0);
        ecu
    }

    /// Answer from a different ECU address
    pub fn with_response_id(mut self, id: u32) -> Self {
        self.response_id = id;
        self
    }

    /// Change the response latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Engine speed in RPM, clamped to the encodable 0..=16383
    pub fn set_rpm(&mut self, rpm: u16) {
        let encoded = (rpm.min(16383) as u32) * 4;
        self.set_raw(Pid::Rpm, &[(encoded >> 8) as u8, (encoded & 0xFF) as u8]);
    }

    /// Vehicle speed in km/h
    pub fn set_speed(&mut self, speed_kmh: u8) {
        self.set_raw(Pid::Speed, &[speed_kmh]);
    }

    /// Coolant temperature in °C, clamped to the encodable -40..=215
    pub fn set_coolant_temp(&mut self, temp_c: i16) {
        let encoded = (temp_c.clamp(-40, 215) + 40) as u8;
        self.set_raw(Pid::CoolantTemp, &[encoded]);
    }

    /// Throttle in percent; rounded up so the decoder reads back the same percent
    pub fn set_throttle(&mut self, percent: u8) {
        let percent = percent.min(100) as u32;
        let encoded = (percent * 255 + 99) / 100;
        self.set_raw(Pid::ThrottlePosition, &[encoded as u8]);
    }

    /// Override the data bytes returned for a PID
    pub fn set_raw(&mut self, pid: Pid, data: &[u8]) {
        self.values.insert(pid.as_hex(), data.to_vec());
    }

    /// Stop answering a PID
    pub fn silence(&mut self, pid: Pid) {
        self.silent.insert(pid.as_hex());
    }

    /// Resume answering a PID
    pub fn unsilence(&mut self, pid: Pid) {
        self.silent.remove(&pid.as_hex());
    }

    /// Stop answering every PID
    pub fn silence_all(&mut self) {
        for pid in Pid::POLL_ORDER {
            self.silence(pid);
        }
    }

    /// Put an arbitrary frame on the bus, visible after `after`
    pub fn inject(&mut self, frame: CanFrame, after: Duration) {
        self.enqueue(after, frame);
    }

    /// Simulate the controller being up or down
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Make every send fail as a bus error
    pub fn set_reject_sends(&mut self, reject: bool) {
        self.reject_sends = reject;
    }

    /// Most recent frames sent onto the bus, oldest first
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.iter().copied().collect()
    }

    fn enqueue(&mut self, after: Duration, frame: CanFrame) {
        // A delay past the end of time means the frame never shows up
        let Some(at) = Instant::now().checked_add(after) else {
            return;
        };
        let index = self.inbox.partition_point(|(t, _)| *t <= at);
        self.inbox.insert(index, (at, frame));
    }

    fn respond_to(&mut self, request: &CanFrame) -> Result<(), TransportError> {
        let payload = request.payload();
        if request.raw_id() != OBD_REQUEST_ID
            || payload.len() < 3
            || payload[1] != SERVICE_CURRENT_DATA
        {
            return Ok(());
        }

        let pid = payload[2];
        if self.silent.contains(&pid) {
            debug!("Simulated ECU ignoring PID {:02X}", pid);
            return Ok(());
        }
        let Some(data) = self.values.get(&pid) else {
            return Ok(());
        };

        let mut response = [0u8; 8];
        response[0] = (data.len() + 2) as u8;
        response[1] = SERVICE_CURRENT_DATA_RESPONSE;
        response[2] = pid;
        let count = data.len().min(5);
        response[3..3 + count].copy_from_slice(&data[..count]);

        let frame = CanFrame::from_raw_parts(self.response_id, false, false, 8, &response)?;
        self.enqueue(self.latency, frame);
        Ok(())
    }
}

impl Default for SimulatedEcu {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePoller for SimulatedEcu {
    fn poll_frame(&mut self) -> Result<Option<CanFrame>, TransportError> {
        if !self.ready {
            return Err(TransportError::NotReady);
        }

        // One-deep receive slot: every frame that arrived since the last
        // check overwrote its predecessor.
        let now = Instant::now();
        let mut latest = None;
        let mut dropped = 0usize;
        while let Some((at, _)) = self.inbox.front() {
            if *at > now {
                break;
            }
            if let Some((_, frame)) = self.inbox.pop_front() {
                if latest.replace(frame).is_some() {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            trace!("Simulated bus overwrote {} unread frame(s)", dropped);
        }
        Ok(latest)
    }
}

#[async_trait]
impl CanTransport for SimulatedEcu {
    fn is_ready(&self) -> bool {
        self.ready
    }

    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.ready {
            return Err(TransportError::NotReady);
        }
        if self.reject_sends {
            return Err(TransportError::Rejected("simulated bus error".to_string()));
        }
        if self.sent.len() == SENT_LOG_CAPACITY {
            self.sent.pop_front();
        }
        self.sent.push_back(*frame);
        self.respond_to(frame)
    }

    async fn receive(&mut self, timeout: Duration) -> Result<CanFrame, TransportError> {
        poll_receive(self, timeout, DEFAULT_POLL_INTERVAL).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::build_request;

    #[tokio::test(start_paused = true)]
    async fn test_answers_request_after_latency() {
        let mut ecu = SimulatedEcu::new();
        ecu.set_rpm(1726);
        ecu.send(&build_request(Pid::Rpm)).await.unwrap();

        let frame = ecu.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(frame.raw_id(), 0x7E8);
        assert_eq!(frame.payload(), &[0x04, 0x41, 0x0C, 0x1A, 0xF8, 0, 0, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silenced_pid_times_out() {
        let mut ecu = SimulatedEcu::new();
        ecu.silence(Pid::Speed);
        ecu.send(&build_request(Pid::Speed)).await.unwrap();
        assert_eq!(
            ecu.receive(Duration::from_millis(30)).await,
            Err(TransportError::Timeout(30))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_slot_keeps_latest_frame() {
        let mut ecu = SimulatedEcu::new();
        let first = CanFrame::new_standard(0x100, &[1]).unwrap();
        let second = CanFrame::new_standard(0x200, &[2]).unwrap();
        ecu.inject(first, Duration::ZERO);
        ecu.inject(second, Duration::ZERO);

        let frame = ecu.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(frame, second);
        assert!(ecu.receive(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_not_ready_and_rejected() {
        let mut ecu = SimulatedEcu::new();
        ecu.set_reject_sends(true);
        assert!(matches!(
            ecu.send(&build_request(Pid::Rpm)).await,
            Err(TransportError::Rejected(_))
        ));

        ecu.set_ready(false);
        assert_eq!(
            ecu.send(&build_request(Pid::Rpm)).await,
            Err(TransportError::NotReady)
        );
        assert_eq!(ecu.receive(Duration::from_millis(1)).await, Err(TransportError::NotReady));
    }

    #[test]
    fn test_physical_setters_round_trip_through_registry() {
        let mut ecu = SimulatedEcu::new();
        for percent in 0..=100u8 {
            ecu.set_throttle(percent);
            let raw = &ecu.values[&Pid::ThrottlePosition.as_hex()];
            assert_eq!(Pid::ThrottlePosition.decode(raw), percent as i32);
        }
        ecu.set_coolant_temp(-55);
        assert_eq!(Pid::CoolantTemp.decode(&ecu.values[&0x05]), -40);
    }

    #[tokio::test]
    async fn test_sent_log_is_bounded() {
        let mut ecu = SimulatedEcu::new();
        ecu.silence_all();
        for _ in 0..SENT_LOG_CAPACITY * 3 {
            ecu.send(&build_request(Pid::Speed)).await.unwrap();
        }
        ecu.send(&build_request(Pid::Rpm)).await.unwrap();

        let sent = ecu.sent_frames();
        assert_eq!(sent.len(), SENT_LOG_CAPACITY);
        assert_eq!(sent.last(), Some(&build_request(Pid::Rpm)));
        assert_eq!(sent[0], build_request(Pid::Speed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_latency_never_answers() {
        let mut ecu = SimulatedEcu::new().with_latency(Duration::MAX);
        ecu.send(&build_request(Pid::Rpm)).await.unwrap();
        assert_eq!(
            ecu.receive(Duration::from_millis(20)).await,
            Err(TransportError::Timeout(20))
        );
    }
}
