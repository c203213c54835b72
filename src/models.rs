use serde::Serialize;
use time::OffsetDateTime;

/// MAC address of the one beacon this service ever matches.
/// Stored uppercase so comparisons are exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralIdentity(String);

impl PeripheralIdentity {
    pub fn new(address: impl AsRef<str>) -> Self {
        PeripheralIdentity(address.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, address: &str) -> bool {
        self.0 == address.trim().to_uppercase()
    }
}

impl std::fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One raw discovery event. The manufacturer data may be absent when the
/// advertisement carried none or the read from the adapter cache failed.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub identity: String,
    pub data: Option<Vec<u8>>,
    pub received_at: OffsetDateTime,
}

/// Physical readings decoded from one advertisement frame.
///
/// The current frame layout carries no battery field, so `battery` stays
/// `None`; the slot is part of the sink contract regardless.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSample {
    pub battery: Option<f64>,
    pub motion_x: f64,
    pub motion_y: f64,
    pub motion_z: f64,
    pub primary: f64,
    pub secondary: [f64; 10],
}

/// Serialized form of one sample as handed to the sink. Secondary values
/// are the most recent cycle's ten readings in frame order.
#[derive(Debug, Clone, Serialize)]
pub struct SampleRecord {
    pub battery: Option<f64>,
    pub motion_x: f64,
    pub motion_y: f64,
    pub motion_z: f64,
    pub primary: f64,
    pub secondary: [f64; 10],
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl SampleRecord {
    pub fn new(sample: &DecodedSample, recorded_at: OffsetDateTime) -> Self {
        SampleRecord {
            battery: sample.battery,
            motion_x: sample.motion_x,
            motion_y: sample.motion_y,
            motion_z: sample.motion_z,
            primary: sample.primary,
            secondary: sample.secondary,
            recorded_at,
        }
    }
}
