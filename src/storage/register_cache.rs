use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CachedValue {
    Flag(bool),
    Word(u16),
    Number(f64),
    Series(Vec<f64>),
}

impl CachedValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CachedValue::Flag(flag) => Some(if *flag { 1.0 } else { 0.0 }),
            CachedValue::Word(word) => Some(*word as f64),
            CachedValue::Number(number) => Some(*number),
            CachedValue::Series(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Poll,
    PendingWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ValueChange {
    Updated {
        key: String,
        value: CachedValue,
        source: UpdateSource,
        timestamp: DateTime<Utc>,
    },
    /// Every cached value was dropped, e.g. on disconnect.
    Reset { timestamp: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub last_updated: DateTime<Utc>,
    /// Polled values are ignored until this instant.
    pub suppress_until: Option<Instant>,
}

/// Latest known value per named parameter, with write-through suppression.
pub struct RegisterCache {
    entries: HashMap<String, CacheEntry>,
    words: HashMap<u16, u16>,
    suppression: Duration,
    changes: broadcast::Sender<ValueChange>,
}

impl RegisterCache {
    pub fn new(suppression: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: HashMap::new(),
            words: HashMap::new(),
            suppression,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ValueChange> {
        self.changes.subscribe()
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn value(&self, key: &str) -> Option<&CachedValue> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> BTreeMap<String, CachedValue> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }

    /// Raw register last polled or confirmed written at `address`.
    pub fn word(&self, address: u16) -> Option<u16> {
        self.words.get(&address).copied()
    }

    pub fn record_words(&mut self, start: u16, registers: &[u16]) {
        for (offset, value) in registers.iter().enumerate() {
            self.words.insert(start.wrapping_add(offset as u16), *value);
        }
    }

    /// Applies a polled value unless a pending write suppresses it.
    /// Returns true when the stored value changed.
    pub fn apply_polled(&mut self, key: &str, value: CachedValue, now: Instant) -> bool {
        let timestamp = Utc::now();

        if let Some(entry) = self.entries.get_mut(key) {
            if let Some(until) = entry.suppress_until {
                if now < until {
                    debug!("Ignoring polled value for '{}' during write suppression", key);
                    return false;
                }
                entry.suppress_until = None;
            }
            entry.last_updated = timestamp;
            if entry.value == value {
                return false;
            }
            entry.value = value.clone();
        } else {
            self.entries.insert(
                key.to_string(),
                CacheEntry {
                    value: value.clone(),
                    last_updated: timestamp,
                    suppress_until: None,
                },
            );
        }

        self.publish(ValueChange::Updated {
            key: key.to_string(),
            value,
            source: UpdateSource::Poll,
            timestamp,
        });
        true
    }

    /// Takes the requested value at once and holds off polled values for the
    /// suppression window.
    pub fn begin_pending_write(&mut self, key: &str, value: CachedValue, now: Instant) {
        let timestamp = Utc::now();
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                last_updated: timestamp,
                suppress_until: Some(now + self.suppression),
            },
        );
        self.publish(ValueChange::Updated {
            key: key.to_string(),
            value,
            source: UpdateSource::PendingWrite,
            timestamp,
        });
    }

    /// Ends suppression early so the next poll restores the device's value.
    pub fn release_suppression(&mut self, key: &str) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.suppress_until = None;
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.words.clear();
        self.publish(ValueChange::Reset { timestamp: Utc::now() });
    }

    fn publish(&self, change: ValueChange) {
        // no subscribers is fine
        let _ = self.changes.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_polled_values_publish_only_on_change() {
        let mut cache = RegisterCache::new(Duration::from_millis(500));
        let mut changes = cache.subscribe();
        let now = Instant::now();

        assert!(cache.apply_polled("chiller_temperature", CachedValue::Number(23.0), now));
        assert!(!cache.apply_polled("chiller_temperature", CachedValue::Number(23.0), now));
        assert!(cache.apply_polled("chiller_temperature", CachedValue::Number(23.5), now));

        let first = changes.try_recv().unwrap();
        assert!(matches!(first, ValueChange::Updated { ref key, source: UpdateSource::Poll, .. } if key == "chiller_temperature"));
        let second = changes.try_recv().unwrap();
        assert!(matches!(second, ValueChange::Updated { value: CachedValue::Number(v), .. } if v == 23.5));
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_write_suppresses_polls_for_window() {
        let mut cache = RegisterCache::new(Duration::from_millis(500));
        let start = Instant::now();

        cache.apply_polled("relay_1", CachedValue::Flag(false), start);
        cache.begin_pending_write("relay_1", CachedValue::Flag(true), start);
        assert_eq!(cache.value("relay_1"), Some(&CachedValue::Flag(true)));

        // stale poll from before the write landed
        assert!(!cache.apply_polled("relay_1", CachedValue::Flag(false), start + Duration::from_millis(300)));
        assert_eq!(cache.value("relay_1"), Some(&CachedValue::Flag(true)));

        assert!(cache.apply_polled("relay_1", CachedValue::Flag(false), start + Duration::from_millis(600)));
        assert_eq!(cache.value("relay_1"), Some(&CachedValue::Flag(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_lets_next_poll_through() {
        let mut cache = RegisterCache::new(Duration::from_millis(500));
        let start = Instant::now();

        cache.begin_pending_write("xenon_setpoint", CachedValue::Number(12.0), start);
        cache.release_suppression("xenon_setpoint");
        assert!(cache.apply_polled("xenon_setpoint", CachedValue::Number(10.0), start + Duration::from_millis(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_publishes_reset() {
        let mut cache = RegisterCache::new(Duration::from_millis(500));
        let mut changes = cache.subscribe();
        cache.record_words(1021, &[0b101]);
        cache.apply_polled("relay_1", CachedValue::Flag(true), Instant::now());
        let _ = changes.try_recv();

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.word(1021), None);
        assert!(matches!(changes.try_recv().unwrap(), ValueChange::Reset { .. }));
    }

    #[test]
    fn test_value_change_json_shape() {
        let change = ValueChange::Updated {
            key: "vacuum_pressure".to_string(),
            value: CachedValue::Number(0.5),
            source: UpdateSource::Poll,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["event"], "updated");
        assert_eq!(json["key"], "vacuum_pressure");
        assert_eq!(json["value"], 0.5);
    }
}
