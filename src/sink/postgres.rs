/// PostgreSQL sample sink
use log::debug;
use serde_json::Value;

use crate::models::SampleRecord;
use crate::session::{SampleSink, SinkError};
use crate::sink::connection::with_client;

/// Stores one row per decoded sample in the beacon_samples table.
///
/// Invoked best-effort by the acquisition session; errors are returned for
/// counting and logging but the session never retries a publish.
pub struct PostgresSink {
    database_url: String,
}

impl PostgresSink {
    pub fn new(database_url: String) -> Self {
        PostgresSink { database_url }
    }
}

impl SampleSink for PostgresSink {
    async fn publish(&mut self, record: &SampleRecord) -> Result<(), SinkError> {
        debug!(
            "publishing sample: {}",
            serde_json::to_string(record).unwrap_or_default()
        );

        // Secondary values land in a JSONB column, frame order.
        let secondary = serde_json::to_value(record.secondary).unwrap_or(Value::Null);
        let record = record.clone();

        with_client(&self.database_url, move |client| async move {
            client
                .execute(
                    "INSERT INTO beacon_samples(battery, motion_x, motion_y, motion_z, primary_value, secondary_values, recorded_at)
                     VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    &[
                        &record.battery,
                        &record.motion_x,
                        &record.motion_y,
                        &record.motion_z,
                        &record.primary,
                        &secondary,
                        &record.recorded_at,
                    ],
                )
                .await
        })
        .await
    }
}
