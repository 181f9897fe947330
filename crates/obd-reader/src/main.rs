//! OBD Reader - Main Entry Point

use anyhow::Context;
use obd_protocol::ObdClient;
use obd_reader::{
    build_transport, init_logging, install_metrics, run_polling, ReaderConfig,
    DEFAULT_CONFIG_PATH,
};
use obd_scheduler::PollingScheduler;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config =
        ReaderConfig::load(&path).with_context(|| format!("loading configuration from {}", path))?;

    init_logging(&config.logging)?;
    info!("=== OBD Reader v{} ===", env!("CARGO_PKG_VERSION"));

    if let Some(listen) = &config.metrics_listen {
        install_metrics(listen)?;
    }

    let transport = build_transport(&config.transport)
        .await
        .context("opening CAN transport")?;
    let mut scheduler = PollingScheduler::new(ObdClient::new(transport), config.scheduler.clone())?;

    scheduler.subscribe(|snapshot| {
        info!(
            rpm = snapshot.rpm,
            speed_kmh = snapshot.speed_kmh,
            coolant_temp_c = snapshot.coolant_temp_c,
            throttle_pct = snapshot.throttle_pct,
            state = ?snapshot.riding_state(),
            "Vehicle snapshot"
        );
    });

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    info!("Polling every {:?}", config.cycle_period());
    let cycles = run_polling(&mut scheduler, config.cycle_period(), shutdown).await?;

    let stats = scheduler.stats();
    info!(
        cycles,
        published = stats.published,
        field_failures = stats.field_failures,
        "Reader stopped"
    );
    Ok(())
}
