mod bluetooth;
mod config;
mod decoder;
mod models;
mod session;
mod sink;
mod store;
mod utils;

use log::{error, info, warn};
use std::sync::Arc;
use time::OffsetDateTime;

use bluetooth::{BlueZPermission, BlueZScanner};
use config::AppConfig;
use session::AcquisitionSession;
use sink::PostgresSink;
use store::SampleStore;
use utils::format_datetime;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match AppConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    info!(
        "Beacon acquisition service starting at {}",
        format_datetime(&OffsetDateTime::now_utc())
    );
    info!(
        "Target {}, poll interval {:?}, scan window {:?}",
        config.target, config.poll_interval, config.scan_timeout
    );

    let store = Arc::new(SampleStore::new());

    // Log every published sample. Downstream readers hang off the store
    // the same way, via change notifications.
    let mut updates = store.subscribe();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let latest = updates.borrow_and_update().clone();
            if let Some(sample) = latest {
                info!(
                    "Latest sample: motion=({:.3}, {:.3}, {:.3}) primary={:.5}",
                    sample.motion_x, sample.motion_y, sample.motion_z, sample.primary
                );
            }
        }
    });

    let (mut acquisition, handle) = AcquisitionSession::new(
        &config,
        BlueZScanner::new(),
        BlueZPermission,
        PostgresSink::new(config.database_url.clone()),
        store.clone(),
    );

    // Handle Ctrl+C gracefully
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Stop requested, finishing current cycle");
            handle.stop();
        }
    });

    let result = acquisition.run().await;

    // Shutdown summary
    let stats = acquisition.stats();
    let history = store.history();
    info!("Summary at {}:", format_datetime(&OffsetDateTime::now_utc()));
    info!("  Session ended in state {:?}", acquisition.state());
    info!(
        "  {} samples collected ({} motion readings, {} secondary values)",
        store.sample_count(),
        history.motion.len(),
        history.secondary.len()
    );
    if let Some(sample) = store.latest() {
        info!("  Last primary reading: {:.5}", sample.primary);
    }
    if stats.decode_failures > 0 {
        warn!(
            "  {} frames were discarded as undecodable",
            stats.decode_failures
        );
    }

    // Warning if nothing was collected
    if store.sample_count() == 0 {
        warn!("No samples collected during this session!");
    }

    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Fatal error: {}", e);
            Err(e.into())
        }
    }
}
