//! Turns raw MQTT telemetry into registry updates.

use crate::clock::Clock;
use crate::health::HealthTracker;
use crate::models::{TelemetryEvent, TelemetryIn};
use crate::registry::{DeviceRegistry, UpsertOutcome};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("topic {topic} does not match {pattern}")]
    TopicMismatch { topic: String, pattern: String },
    #[error("payload is not valid JSON telemetry: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("telemetry has an empty ip")]
    EmptyAddress,
}

/// Extracts the segment matched by the single `+` wildcard of `pattern`.
/// Ex: pattern "espresense/rooms/+/telemetry", topic
/// "espresense/rooms/kitchen/telemetry" -> "kitchen"
pub fn room_from_topic<'a>(pattern: &str, topic: &'a str) -> Option<&'a str> {
    let mut pattern_parts = pattern.split('/');
    let mut room = None;
    for part in topic.split('/') {
        match pattern_parts.next()? {
            "+" if !part.is_empty() => room = Some(part),
            literal if literal == part => {}
            _ => return None,
        }
    }
    if pattern_parts.next().is_some() {
        return None;
    }
    room
}

pub fn parse_telemetry(pattern: &str, topic: &str, payload: &[u8]) -> Result<TelemetryEvent, TelemetryError> {
    let room = room_from_topic(pattern, topic).ok_or_else(|| TelemetryError::TopicMismatch {
        topic: topic.to_string(),
        pattern: pattern.to_string(),
    })?;
    let body: TelemetryIn = serde_json::from_slice(payload)?;
    let address = body.ip.trim();
    if address.is_empty() {
        return Err(TelemetryError::EmptyAddress);
    }
    Ok(TelemetryEvent { room: room.to_string(), address: address.to_string() })
}

/// Ingestion side of the watchdog: stamps each event with the clock and
/// upserts it. Bad messages are dropped here and never reach the registry.
#[derive(Clone)]
pub struct TelemetryIngestor {
    registry: DeviceRegistry,
    clock: Arc<dyn Clock>,
    health: HealthTracker,
    topic_pattern: String,
}

impl TelemetryIngestor {
    pub fn new(registry: DeviceRegistry, clock: Arc<dyn Clock>, health: HealthTracker, topic_pattern: &str) -> Self {
        Self { registry, clock, health, topic_pattern: topic_pattern.to_string() }
    }

    pub fn topic_pattern(&self) -> &str {
        &self.topic_pattern
    }

    pub fn ingest(&self, topic: &str, payload: &[u8]) -> Result<UpsertOutcome, TelemetryError> {
        let event = match parse_telemetry(&self.topic_pattern, topic, payload) {
            Ok(event) => event,
            Err(e) => {
                self.health.telemetry_dropped();
                warn!(%topic, error = %e, "dropping telemetry");
                return Err(e);
            }
        };

        let outcome = self.registry.upsert(&event.room, &event.address, self.clock.now());
        self.health.telemetry_accepted();
        match outcome {
            UpsertOutcome::Inserted => {
                info!(room = %event.room, address = %event.address, "new room discovered")
            }
            UpsertOutcome::Updated { address_changed: true } => {
                info!(room = %event.room, address = %event.address, "room changed address")
            }
            UpsertOutcome::Updated { address_changed: false } => {
                debug!(room = %event.room, "telemetry received")
            }
        }
        Ok(outcome)
    }
}
