//! Shared test doubles: an in-memory store which counts its fetches,
//! and an event publisher which captures what it is given.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::events::{ChangeEvent, EventError, EventPublisher};
use crate::store::{StoreError, Zone, ZoneRecord, ZoneStore};

/// Build a record row with throwaway identifiers.
pub fn record(
    zone_name: &str,
    name: &str,
    record_type: &str,
    content: &str,
    ttl: i32,
    weight: i32,
) -> ZoneRecord {
    let now = Utc::now();
    ZoneRecord {
        id: format!("record-{name}-{record_type}-{content}"),
        user_id: "user-1".to_string(),
        zone_id: format!("zone-{zone_name}"),
        zone_name: zone_name.to_string(),
        name: name.to_string(),
        record_type: record_type.to_string(),
        content: content.to_string(),
        ttl,
        weight,
        created_at: now,
        updated_at: now,
    }
}

/// Build a zone row with throwaway identifiers.
pub fn zone(zone_name: &str, is_active: bool) -> Zone {
    let now = Utc::now();
    Zone {
        id: format!("zone-{zone_name}"),
        user_id: "user-1".to_string(),
        zone_name: zone_name.to_string(),
        is_active,
        created_at: now,
        updated_at: now,
    }
}

/// An in-memory `ZoneStore` which counts record fetches, for asserting
/// on cache behaviour.
#[derive(Default)]
pub struct MemoryStore {
    zones: Mutex<Vec<Zone>>,
    records: Mutex<HashMap<String, Vec<ZoneRecord>>>,
    record_fetches: AtomicUsize,
    fetch_delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every record fetch take this long, to widen race windows
    /// in concurrency tests.
    pub fn with_fetch_delay(delay: Duration) -> Self {
        Self {
            fetch_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn add_zone(&self, z: Zone) {
        self.zones.lock().unwrap().push(z);
    }

    pub fn add_record(&self, r: ZoneRecord) {
        self.records
            .lock()
            .unwrap()
            .entry(r.zone_name.clone())
            .or_default()
            .push(r);
    }

    pub fn remove_zone(&self, zone_name: &str) {
        self.zones.lock().unwrap().retain(|z| z.zone_name != zone_name);
        self.records.lock().unwrap().remove(zone_name);
    }

    pub fn record_fetches(&self) -> usize {
        self.record_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ZoneStore for MemoryStore {
    async fn records_for_zone(&self, zone_name: &str) -> Result<Vec<ZoneRecord>, StoreError> {
        self.record_fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(zone_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn active_zone_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .zones
            .lock()
            .unwrap()
            .iter()
            .filter(|z| z.is_active)
            .map(|z| z.zone_name.clone())
            .collect())
    }

    async fn inactive_zones(&self) -> Result<Vec<Zone>, StoreError> {
        Ok(self
            .zones
            .lock()
            .unwrap()
            .iter()
            .filter(|z| !z.is_active)
            .cloned()
            .collect())
    }

    async fn activate_zone(&self, zone_id: &str) -> Result<(), StoreError> {
        for z in self.zones.lock().unwrap().iter_mut() {
            if z.id == zone_id {
                z.is_active = true;
            }
        }
        Ok(())
    }
}

/// An `EventPublisher` which records every event it is asked to send.
#[derive(Default)]
pub struct CapturingPublisher {
    published: Mutex<Vec<ChangeEvent>>,
}

impl CapturingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<ChangeEvent> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for CapturingPublisher {
    async fn publish(&self, event: &ChangeEvent) -> Result<(), EventError> {
        self.published.lock().unwrap().push(event.clone());
        Ok(())
    }
}
