use std::env;
use std::time::Duration;

use crate::models::PeripheralIdentity;

/// Hardware address of the beacon this build targets. Overridable through
/// BEACON_MAC for bench units.
const DEFAULT_BEACON_MAC: &str = "02:80:E1:00:00:00";
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub target: PeripheralIdentity,
    pub poll_interval: Duration,
    pub scan_timeout: Duration,
    pub database_url: String,
}

impl AppConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL environment variable not set")?;

        let target = PeripheralIdentity::new(
            env::var("BEACON_MAC").unwrap_or_else(|_| DEFAULT_BEACON_MAC.to_string()),
        );
        if target.as_str().is_empty() {
            return Err("BEACON_MAC must not be empty".into());
        }

        let poll_interval_ms = env::var("BEACON_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS);

        let scan_timeout_secs = env::var("BEACON_SCAN_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SCAN_TIMEOUT_SECS);

        Ok(AppConfig {
            target,
            poll_interval: Duration::from_millis(poll_interval_ms),
            scan_timeout: Duration::from_secs(scan_timeout_secs),
            database_url,
        })
    }
}
