//! Reading Store
//!
//! Latest known reading per device, kept in a sharded concurrent map so that
//! telemetry for one device never contends with reads or writes of another.
//!
//! [`ReadingStore::upsert`] is the only way in. It refuses readings whose
//! `observedAt` is not strictly newer than the stored one, so late or
//! duplicated telemetry can never roll a device back. Accepted readings are
//! handed to the subscriber registry once the shard lock has been released.

use crate::model::{DeviceReading, GasType, ReadingSnapshot};
use crate::registry::SubscriberRegistry;
use chrono::{Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadingConfig {
    /// Readings received longer ago than this are reported as stale
    pub staleness_secs: u64,
}

impl Default for ReadingConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 300,
        }
    }
}

/// Selection for [`ReadingStore::list`]
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingFilter {
    pub gas_type: Option<GasType>,
    /// `Some(true)` only stale readings, `Some(false)` only fresh ones
    pub stale: Option<bool>,
}

#[derive(Clone)]
pub struct ReadingStore {
    readings: Arc<DashMap<String, DeviceReading>>,
    staleness: Duration,
    registry: SubscriberRegistry,
}

impl ReadingStore {
    pub fn new(config: &ReadingConfig, registry: SubscriberRegistry) -> Self {
        Self {
            readings: Arc::new(DashMap::new()),
            staleness: Duration::seconds(config.staleness_secs.min(i64::MAX as u64) as i64),
            registry,
        }
    }

    /// Applies the reading if it is newer than the stored one
    ///
    /// Returns `false` for out-of-order or duplicate readings, which are dropped.
    pub fn upsert(&self, reading: DeviceReading) -> bool {
        let applied = match self.readings.entry(reading.device_id.clone()) {
            Entry::Occupied(mut current) => {
                if reading.observed_at <= current.get().observed_at {
                    debug!(
                        "Dropping reading for {} observed at {} (stored {})",
                        reading.device_id,
                        reading.observed_at,
                        current.get().observed_at
                    );
                    false
                } else {
                    current.insert(reading.clone());
                    true
                }
            }
            Entry::Vacant(slot) => {
                debug!("First reading for {}", reading.device_id);
                slot.insert(reading.clone());
                true
            }
        };

        if applied {
            self.registry.notify(&reading);
        }
        applied
    }

    pub fn get(&self, device_id: &str) -> Option<ReadingSnapshot> {
        let now = Utc::now();
        self.readings
            .get(device_id)
            .map(|entry| self.snapshot(entry.value().clone(), now))
    }

    /// Matching readings ordered by device id
    pub fn list(&self, filter: &ReadingFilter) -> Vec<ReadingSnapshot> {
        let now = Utc::now();
        let mut matching: Vec<ReadingSnapshot> = self
            .readings
            .iter()
            .filter(|entry| {
                filter
                    .gas_type
                    .map_or(true, |gas| entry.value().gas_type == gas)
            })
            .map(|entry| self.snapshot(entry.value().clone(), now))
            .filter(|snapshot| filter.stale.map_or(true, |stale| snapshot.stale == stale))
            .collect();
        matching.sort_by(|a, b| a.reading.device_id.cmp(&b.reading.device_id));
        matching
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    fn snapshot(&self, reading: DeviceReading, now: chrono::DateTime<Utc>) -> ReadingSnapshot {
        let stale = reading.is_stale_at(now, self.staleness);
        ReadingSnapshot { reading, stale }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SubscriberConfig;
    use chrono::{DateTime, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn reading(device: &str, gas: GasType, value: f64, observed: i64) -> DeviceReading {
        DeviceReading {
            device_id: device.to_string(),
            gas_type: gas,
            value,
            unit: "ppm".into(),
            observed_at: at(observed),
            received_at: Utc::now(),
        }
    }

    fn store() -> ReadingStore {
        ReadingStore::new(
            &ReadingConfig::default(),
            SubscriberRegistry::new(SubscriberConfig::default()),
        )
    }

    #[tokio::test]
    async fn newest_observation_wins_regardless_of_arrival_order() {
        let store = store();
        let order = [5, 2, 9, 9, 1, 7, 3, 9, 0];
        let mut newest = i64::MIN;

        for (i, observed) in order.iter().enumerate() {
            let applied = store.upsert(reading("dev-1", GasType::Co, i as f64, *observed));
            assert_eq!(applied, *observed > newest, "step {}", i);
            newest = newest.max(*observed);
            assert_eq!(store.get("dev-1").unwrap().reading.observed_at, at(newest));
        }
        // Value from the first reading observed at 9
        assert_eq!(store.get("dev-1").unwrap().reading.value, 2.0);
    }

    #[tokio::test]
    async fn only_applied_readings_are_fanned_out() {
        let registry = SubscriberRegistry::new(SubscriberConfig::default());
        let store = ReadingStore::new(&ReadingConfig::default(), registry.clone());
        let (_, mut rx) = registry.register_channel(Vec::<String>::new()).unwrap();

        assert!(store.upsert(reading("dev-1", GasType::Co, 1.0, 10)));
        assert!(!store.upsert(reading("dev-1", GasType::Co, 2.0, 5)));
        assert!(store.upsert(reading("dev-1", GasType::Co, 3.0, 11)));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.reading.value, 1.0);
        assert_eq!(second.reading.value, 3.0);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn list_filters_by_gas_and_staleness() {
        let registry = SubscriberRegistry::new(SubscriberConfig::default());
        let store = ReadingStore::new(&ReadingConfig { staleness_secs: 60 }, registry);

        store.upsert(reading("dev-b", GasType::Co, 1.0, 1));
        store.upsert(reading("dev-a", GasType::Co, 2.0, 1));
        let mut old = reading("dev-c", GasType::Ch4, 3.0, 1);
        old.received_at = Utc::now() - Duration::minutes(10);
        store.upsert(old);

        let all = store.list(&ReadingFilter::default());
        let ids: Vec<_> = all.iter().map(|s| s.reading.device_id.as_str()).collect();
        assert_eq!(ids, vec!["dev-a", "dev-b", "dev-c"]);

        let co = store.list(&ReadingFilter {
            gas_type: Some(GasType::Co),
            stale: None,
        });
        assert_eq!(co.len(), 2);

        let stale = store.list(&ReadingFilter {
            gas_type: None,
            stale: Some(true),
        });
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].reading.device_id, "dev-c");
        assert!(store.get("dev-c").unwrap().stale);
        assert!(!store.get("dev-a").unwrap().stale);
        assert!(store.get("dev-z").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_keep_the_newest_reading() {
        let store = store();
        let mut tasks = Vec::new();

        for device in 0..8 {
            for writer in 0..4 {
                let store = store.clone();
                tasks.push(tokio::spawn(async move {
                    for step in 0..50 {
                        let observed = (step * 4 + writer) as i64;
                        store.upsert(reading(
                            &format!("dev-{}", device),
                            GasType::O2,
                            observed as f64,
                            observed,
                        ));
                    }
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.len(), 8);
        for device in 0..8 {
            let snapshot = store.get(&format!("dev-{}", device)).unwrap();
            assert_eq!(snapshot.reading.observed_at, at(199));
            assert_eq!(snapshot.reading.value, 199.0);
        }
    }
}
