//! OBD-II Telemetry Reader
//!
//! Wires a CAN transport, the OBD-II engine and the polling scheduler into
//! a long-running service.

use metrics_exporter_prometheus::PrometheusBuilder;
use obd_protocol::sim::SimulatedEcu;
use obd_protocol::slcan::{self, Bitrate};
use obd_protocol::{CanTransport, TransportError};
use obd_scheduler::{PollingScheduler, SchedulerError};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

mod settings;

pub use settings::{
    LoggingConfig, ReaderConfig, TransportConfig, DEFAULT_CONFIG_PATH, ENV_PREFIX,
    MAX_CYCLE_PERIOD_MS,
};

/// Reader setup errors
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unsupported CAN bitrate: {0} kbit/s")]
    UnsupportedBitrate(u32),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Metrics exporter error: {0}")]
    Metrics(String),
}

/// Initialize logging
pub fn init_logging(config: &LoggingConfig) -> Result<(), ReaderError> {
    let level: Level = config
        .level
        .parse()
        .map_err(|_| ReaderError::Logging(format!("unknown level '{}'", config.level)))?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    let result = if config.json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    result.map_err(|e| ReaderError::Logging(e.to_string()))
}

/// Start the Prometheus exporter on `listen`
pub fn install_metrics(listen: &str) -> Result<(), ReaderError> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| ReaderError::InvalidConfig(format!("bad metrics_listen '{}'", listen)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| ReaderError::Metrics(e.to_string()))?;

    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

/// Open the configured CAN transport
pub async fn build_transport(
    config: &TransportConfig,
) -> Result<Box<dyn CanTransport>, ReaderError> {
    match config {
        TransportConfig::Simulated => {
            info!("Using simulated ECU");
            Ok(Box::new(SimulatedEcu::new()))
        }
        TransportConfig::Slcan {
            device,
            baud_rate,
            bitrate_kbps,
        } => {
            let bitrate = Bitrate::from_kbps(*bitrate_kbps)
                .ok_or(ReaderError::UnsupportedBitrate(*bitrate_kbps))?;
            let transport = slcan::open_serial(device, *baud_rate, bitrate).await?;
            Ok(Box::new(transport))
        }
    }
}

/// Run cycles every `period` until `shutdown` resolves.
///
/// Shutdown is only observed between cycles. Ticks missed while a cycle
/// overruns the period are skipped. Returns the number of cycles run, or
/// `InvalidConfig` if `period` is zero or above [`MAX_CYCLE_PERIOD_MS`].
pub async fn run_polling<T, F>(
    scheduler: &mut PollingScheduler<T>,
    period: Duration,
    shutdown: F,
) -> Result<u64, ReaderError>
where
    T: CanTransport,
    F: Future<Output = ()>,
{
    if period.is_zero() || period > Duration::from_millis(MAX_CYCLE_PERIOD_MS) {
        return Err(ReaderError::InvalidConfig(format!(
            "cycle period {:?} is out of range",
            period
        )));
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut cycles = 0u64;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown requested after {} cycles", cycles);
                break;
            }
            _ = ticker.tick() => {
                let report = scheduler.run_cycle().await;
                cycles += 1;
                if !report.is_complete() {
                    debug!(
                        "Cycle {} finished with {} failed fields (valid: {})",
                        cycles,
                        report.failures.len(),
                        report.snapshot.data_valid
                    );
                }
            }
        }
    }
    Ok(cycles)
}
