use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WatchdogHealth {
    pub uptime_seconds: u64,
    pub rooms_tracked: usize,
    pub mqtt_status: String,
    pub mqtt_reconnects: u64,
    pub telemetry_accepted: u64,
    pub telemetry_dropped: u64,
    pub restarts_succeeded: u64,
    pub restarts_failed: u64,
}

#[derive(Default)]
struct Counters {
    mqtt_reconnects: AtomicU64,
    telemetry_accepted: AtomicU64,
    telemetry_dropped: AtomicU64,
    restarts_succeeded: AtomicU64,
    restarts_failed: AtomicU64,
}

/// Process counters shared by the MQTT listener and the scheduler.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
    mqtt_status: Arc<Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            mqtt_status: Arc::new(Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.counters.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn telemetry_accepted(&self) {
        self.counters.telemetry_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_dropped(&self) {
        self.counters.telemetry_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn restart_attempted(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.counters.restarts_succeeded
        } else {
            &self.counters.restarts_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// `rooms_tracked` is filled in by the caller, the tracker does not own the registry.
    pub fn snapshot(&self) -> WatchdogHealth {
        WatchdogHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            rooms_tracked: 0,
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.counters.mqtt_reconnects.load(Ordering::Relaxed),
            telemetry_accepted: self.counters.telemetry_accepted.load(Ordering::Relaxed),
            telemetry_dropped: self.counters.telemetry_dropped.load(Ordering::Relaxed),
            restarts_succeeded: self.counters.restarts_succeeded.load(Ordering::Relaxed),
            restarts_failed: self.counters.restarts_failed.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
