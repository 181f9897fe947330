//! OBD-II Polling Scheduler
//!
//! Drives one request per registered PID in a fixed order, aggregates the
//! decoded values into a [`VehicleSnapshot`] and publishes valid snapshots
//! to subscribers.

mod scheduler;
mod snapshot;

pub use scheduler::{
    CycleReport, CycleStats, FieldFailure, PollingScheduler, SchedulerConfig, SchedulerError,
    SchedulerState, SubscriptionId, ValidityPolicy, MAX_INTER_REQUEST_GAP_MS,
    MAX_REQUEST_TIMEOUT_MS,
};
pub use snapshot::{RidingState, VehicleSnapshot};
