/**
 * DEVICE REGISTRY - Etat en mémoire de chaque room ESPresense
 *
 * RÔLE : table room -> DeviceState partagée entre l'ingestion MQTT et le tick
 * d'évaluation. Construite une fois au démarrage, clonée comme handle.
 *
 * VERROU : un seul Mutex parking_lot, tenu uniquement le temps d'un upsert,
 * d'un snapshot ou d'un mark_restarted. Jamais pendant un appel réseau.
 */

use crate::models::{DeviceState, DevicesMap};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Result of an upsert, used for logging by the ingestion side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated { address_changed: bool },
}

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<Mutex<DevicesMap>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self { devices: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Records a telemetry sighting.
    ///
    /// A new room starts with `last_seen = last_restarted = event_time`. For a
    /// known room the address is replaced and `last_seen` only moves forward,
    /// so late deliveries never age a device.
    pub fn upsert(&self, room: &str, address: &str, event_time: OffsetDateTime) -> UpsertOutcome {
        let mut devices = self.devices.lock();
        match devices.get_mut(room) {
            Some(state) => {
                let address_changed = state.address != address;
                if address_changed {
                    state.address = address.to_string();
                }
                state.last_seen = state.last_seen.max(event_time);
                UpsertOutcome::Updated { address_changed }
            }
            None => {
                devices.insert(
                    room.to_string(),
                    DeviceState {
                        address: address.to_string(),
                        last_seen: event_time,
                        last_restarted: event_time,
                    },
                );
                UpsertOutcome::Inserted
            }
        }
    }

    /// Copy of every entry, sorted by room so ticks are reproducible.
    pub fn snapshot(&self) -> Vec<(String, DeviceState)> {
        let mut entries: Vec<_> = self
            .devices
            .lock()
            .iter()
            .map(|(room, state)| (room.clone(), state.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Resets the uptime clock of `room`. Returns false when the room is unknown.
    pub fn mark_restarted(&self, room: &str, at: OffsetDateTime) -> bool {
        match self.devices.lock().get_mut(room) {
            Some(state) => {
                state.last_restarted = at;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, room: &str) -> Option<DeviceState> {
        self.devices.lock().get(room).cloned()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    const T0: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

    #[test]
    fn first_sighting_seeds_both_timestamps() {
        let registry = DeviceRegistry::new();
        assert!(registry.is_empty());

        let outcome = registry.upsert("kitchen", "10.0.0.5", T0);
        assert_eq!(outcome, UpsertOutcome::Inserted);

        let state = registry.get("kitchen").unwrap();
        assert_eq!(state.address, "10.0.0.5");
        assert_eq!(state.last_seen, T0);
        assert_eq!(state.last_restarted, T0);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn later_telemetry_keeps_last_restarted() {
        let registry = DeviceRegistry::new();
        registry.upsert("kitchen", "10.0.0.5", T0);
        registry.upsert("kitchen", "10.0.0.5", T0 + Duration::seconds(30));

        let state = registry.get("kitchen").unwrap();
        assert_eq!(state.last_seen, T0 + Duration::seconds(30));
        assert_eq!(state.last_restarted, T0);
    }

    #[test]
    fn address_follows_latest_message() {
        let registry = DeviceRegistry::new();
        registry.upsert("hall", "10.0.0.7", T0);

        let same = registry.upsert("hall", "10.0.0.7", T0 + Duration::seconds(1));
        assert_eq!(same, UpsertOutcome::Updated { address_changed: false });

        let moved = registry.upsert("hall", "10.0.0.8", T0 + Duration::seconds(2));
        assert_eq!(moved, UpsertOutcome::Updated { address_changed: true });
        assert_eq!(registry.get("hall").unwrap().address, "10.0.0.8");
    }

    #[test]
    fn last_seen_is_max_of_all_events_in_any_order() {
        let offsets = [40, 10, 90, 5, 60, 90, 0, 75];
        let registry = DeviceRegistry::new();
        let mut max_so_far = None;

        for secs in offsets {
            let ts = T0 + Duration::seconds(secs);
            registry.upsert("office", "10.0.0.9", ts);
            max_so_far = Some(max_so_far.map_or(ts, |m: OffsetDateTime| m.max(ts)));
            assert_eq!(registry.get("office").unwrap().last_seen, max_so_far.unwrap());
        }
    }

    #[test]
    fn mark_restarted_on_unknown_room_is_noop() {
        let registry = DeviceRegistry::new();
        assert!(!registry.mark_restarted("garage", T0));
        assert!(registry.is_empty());
    }

    #[test]
    fn mark_restarted_resets_uptime_only() {
        let registry = DeviceRegistry::new();
        registry.upsert("kitchen", "10.0.0.5", T0);
        let at = T0 + Duration::hours(7);

        assert!(registry.mark_restarted("kitchen", at));
        let state = registry.get("kitchen").unwrap();
        assert_eq!(state.last_restarted, at);
        assert_eq!(state.last_seen, T0);
    }

    #[test]
    fn snapshot_is_detached_and_sorted() {
        let registry = DeviceRegistry::new();
        registry.upsert("office", "10.0.0.9", T0);
        registry.upsert("attic", "10.0.0.2", T0);
        registry.upsert("kitchen", "10.0.0.5", T0);

        let snap = registry.snapshot();
        let rooms: Vec<_> = snap.iter().map(|(room, _)| room.as_str()).collect();
        assert_eq!(rooms, ["attic", "kitchen", "office"]);

        registry.upsert("attic", "10.0.0.3", T0 + Duration::seconds(5));
        assert_eq!(snap[0].1.address, "10.0.0.2");
    }

    #[tokio::test]
    async fn concurrent_upserts_keep_one_entry_per_room() {
        let registry = DeviceRegistry::new();
        let mut handles = Vec::new();
        for worker in 0..8i64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50i64 {
                    let room = format!("room-{}", i % 5);
                    registry.upsert(&room, "10.0.0.1", T0 + Duration::seconds(worker * 100 + i));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(registry.len(), 5);
        // worker 7 wrote the latest timestamps for every room
        let room0 = registry.get("room-0").unwrap();
        assert_eq!(room0.last_seen, T0 + Duration::seconds(700 + 45));
    }
}
