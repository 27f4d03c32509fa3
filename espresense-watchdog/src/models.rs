use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// Last known state of one room node.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeviceState {
    /// Where the restart command goes (ip or host:port).
    pub address: String,
    pub last_seen: OffsetDateTime,
    /// Seeded with the first sighting, then reset after every restart attempt.
    pub last_restarted: OffsetDateTime,
}

/// Telemetry body published by a node on `espresense/rooms/<room>/telemetry`.
/// Only the address matters here, the remaining fields are ignored.
#[derive(Debug, Deserialize)]
pub struct TelemetryIn {
    pub ip: String,
}

/// A decoded telemetry message, room taken from the topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryEvent {
    pub room: String,
    pub address: String,
}

pub type DevicesMap = HashMap<String, DeviceState>;
