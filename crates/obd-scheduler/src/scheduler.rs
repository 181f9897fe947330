//! Polling Scheduler Implementation

use crate::snapshot::VehicleSnapshot;
use metrics::{counter, gauge};
use obd_protocol::{CanTransport, ObdClient, ObdError, Pid, PidReading};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Errors raised while setting up the scheduler
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Configuration value out of range
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// OBD engine could not be initialized
    #[error(transparent)]
    Obd(#[from] ObdError),
}

/// Longest accepted per-PID response window
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Longest accepted pause between requests
pub const MAX_INTER_REQUEST_GAP_MS: u64 = 60_000;

/// When a completed cycle counts as valid data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidityPolicy {
    /// Valid if every field was read, or if RPM came back nonzero anyway.
    /// A live RPM reading is taken as proof the bus link works even when
    /// another field glitched; the failed field still reads as its fallback.
    #[default]
    RpmOverride,
    /// Valid only if every field was read
    AllFields,
}

impl ValidityPolicy {
    /// Whether a cycle with `failed_fields` failures and the given RPM is valid
    pub fn is_valid(&self, failed_fields: usize, rpm: u16) -> bool {
        match self {
            ValidityPolicy::RpmOverride => failed_fields == 0 || rpm > 0,
            ValidityPolicy::AllFields => failed_fields == 0,
        }
    }
}

/// Configuration for the polling scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Per-PID response window in milliseconds
    pub request_timeout_ms: u64,
    /// Pause between consecutive requests in one cycle
    pub inter_request_gap_ms: u64,
    /// How a cycle's field failures map to `data_valid`
    pub validity_policy: ValidityPolicy,
    /// Consecutive invalid cycles before a stale-data warning
    pub stale_warning_cycles: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 500,
            inter_request_gap_ms: 10,
            validity_policy: ValidityPolicy::RpmOverride,
            stale_warning_cycles: 10,
        }
    }
}

impl SchedulerConfig {
    /// Check value ranges
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_REQUEST_TIMEOUT_MS {
            return Err(SchedulerError::InvalidConfig(format!(
                "request_timeout_ms must be between 1 and {}",
                MAX_REQUEST_TIMEOUT_MS
            )));
        }
        if self.inter_request_gap_ms > MAX_INTER_REQUEST_GAP_MS {
            return Err(SchedulerError::InvalidConfig(format!(
                "inter_request_gap_ms must be at most {}",
                MAX_INTER_REQUEST_GAP_MS
            )));
        }
        if self.stale_warning_cycles == 0 {
            return Err(SchedulerError::InvalidConfig(
                "stale_warning_cycles must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Longest a single cycle can occupy the caller
    pub fn worst_case_cycle(&self) -> Duration {
        let fields = Pid::POLL_ORDER.len() as u64;
        let requests = fields.saturating_mul(self.request_timeout_ms);
        let gaps = (fields - 1).saturating_mul(self.inter_request_gap_ms);
        Duration::from_millis(requests.saturating_add(gaps))
    }
}

/// Scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No cycle in progress
    Idle,
    /// Mid-cycle
    Polling,
}

/// One field that could not be read during a cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFailure {
    pub pid: Pid,
    pub error: ObdError,
}

/// Outcome of one polling cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Snapshot produced by the cycle
    pub snapshot: VehicleSnapshot,
    /// Fields that failed, in poll order
    pub failures: Vec<FieldFailure>,
    /// Whether subscribers were notified
    pub published: bool,
}

impl CycleReport {
    /// Whether every field was read
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Running counters across cycles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub cycles: u64,
    pub published: u64,
    pub field_failures: u64,
    pub consecutive_invalid: u32,
}

/// Handle returned by [`PollingScheduler::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SnapshotCallback = Box<dyn FnMut(&VehicleSnapshot) + Send>;

/// Polls every registered PID once per cycle and aggregates a snapshot
pub struct PollingScheduler<T> {
    /// Protocol engine, exclusively owned
    client: ObdClient<T>,
    /// Configuration
    config: SchedulerConfig,
    /// Current lifecycle state
    state: SchedulerState,
    /// Snapshot from the last completed cycle
    snapshot: VehicleSnapshot,
    /// Callbacks invoked with every valid snapshot
    subscribers: Vec<(SubscriptionId, SnapshotCallback)>,
    next_subscription: u64,
    /// Latest snapshot for pull-style readers
    watch_tx: watch::Sender<VehicleSnapshot>,
    stats: CycleStats,
}

impl<T: CanTransport> PollingScheduler<T> {
    /// Create a scheduler, initializing the client if needed
    pub fn new(mut client: ObdClient<T>, config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        if !client.is_initialized() {
            client.initialize()?;
        }
        client.set_timeout(Duration::from_millis(config.request_timeout_ms));

        let (watch_tx, _) = watch::channel(VehicleSnapshot::default());

        info!(
            "Polling scheduler created with {} PIDs, worst-case cycle {:?}",
            Pid::POLL_ORDER.len(),
            config.worst_case_cycle()
        );

        Ok(Self {
            client,
            config,
            state: SchedulerState::Idle,
            snapshot: VehicleSnapshot::default(),
            subscribers: Vec::new(),
            next_subscription: 0,
            watch_tx,
            stats: CycleStats::default(),
        })
    }

    /// Register a callback for valid snapshots.
    ///
    /// Callbacks run synchronously on the task driving `run_cycle` and must
    /// not block.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&VehicleSnapshot) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    /// Remove a callback; returns false if it was not registered
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sub, _)| *sub != id);
        self.subscribers.len() != before
    }

    /// Receiver that always holds the latest completed snapshot, valid or not
    pub fn watch(&self) -> watch::Receiver<VehicleSnapshot> {
        self.watch_tx.subscribe()
    }

    /// Run one polling cycle.
    ///
    /// Field errors are absorbed into the snapshot's validity; nothing is
    /// returned as an error.
    pub async fn run_cycle(&mut self) -> CycleReport {
        if self.state == SchedulerState::Polling {
            warn!("Previous polling cycle was abandoned; starting a new one");
        }
        self.state = SchedulerState::Polling;

        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let gap = Duration::from_millis(self.config.inter_request_gap_ms);
        let mut next = VehicleSnapshot::default();
        let mut failures = Vec::new();

        for (index, pid) in Pid::POLL_ORDER.into_iter().enumerate() {
            if index > 0 && !gap.is_zero() {
                tokio::time::sleep(gap).await;
            }

            let value = match self.client.request_and_receive(pid, timeout).await {
                Ok(raw) => raw.decode(),
                Err(error) => {
                    match &error {
                        ObdError::Timeout(_) => debug!("PID {} timed out", pid),
                        _ => warn!("PID {} read failed: {}", pid, error),
                    }
                    counter!("obd_field_failures_total", "pid" => pid.descriptor().name)
                        .increment(1);
                    failures.push(FieldFailure { pid, error });
                    pid.descriptor().fallback
                }
            };
            next.apply(pid, value);
        }

        next.engine_running = next.rpm > 0;
        next.last_update_ms = unix_now_ms();
        next.data_valid = self
            .config
            .validity_policy
            .is_valid(failures.len(), next.rpm);

        self.snapshot = next;
        self.state = SchedulerState::Idle;
        self.watch_tx.send_replace(next);
        self.record_cycle(&next, failures.len());

        if next.data_valid {
            for (_, callback) in self.subscribers.iter_mut() {
                callback(&next);
            }
        }

        CycleReport {
            snapshot: next,
            failures,
            published: next.data_valid,
        }
    }

    fn record_cycle(&mut self, snapshot: &VehicleSnapshot, failed_fields: usize) {
        self.stats.cycles += 1;
        self.stats.field_failures += failed_fields as u64;
        counter!("obd_cycles_total").increment(1);
        gauge!("obd_engine_rpm").set(snapshot.rpm as f64);

        if snapshot.data_valid {
            self.stats.published += 1;
            counter!("obd_snapshots_published_total").increment(1);
            if self.stats.consecutive_invalid >= self.config.stale_warning_cycles {
                info!(
                    "Vehicle data recovered after {} invalid cycles",
                    self.stats.consecutive_invalid
                );
            }
            self.stats.consecutive_invalid = 0;
        } else {
            self.stats.consecutive_invalid += 1;
            if self.stats.consecutive_invalid == self.config.stale_warning_cycles {
                warn!(
                    "No valid vehicle data for {} consecutive cycles",
                    self.stats.consecutive_invalid
                );
            }
        }
    }

    /// Read a single PID outside the cycle; the snapshot is not touched
    pub async fn read_pid(&mut self, pid: Pid) -> Result<PidReading, ObdError> {
        self.client.query(pid).await
    }

    /// Snapshot from the last completed cycle
    pub fn snapshot(&self) -> &VehicleSnapshot {
        &self.snapshot
    }

    /// Current lifecycle state
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Counters across all cycles so far
    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    /// Active configuration
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Borrow the protocol engine
    pub fn client(&self) -> &ObdClient<T> {
        &self.client
    }

    /// Mutably borrow the protocol engine
    pub fn client_mut(&mut self) -> &mut ObdClient<T> {
        &mut self.client
    }
}

fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
