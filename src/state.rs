use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::types::{DongleId, EntityKey, FaultKind};

/// Last-known value per entity key.
///
/// Written only by the topic router and by confirmed-command echoes;
/// read concurrently by any number of consumers. Last write wins; an
/// absent key means unknown.
#[derive(Default)]
pub struct EntityStore {
    map: RwLock<HashMap<EntityKey, Value>>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &EntityKey) -> Option<Value> {
        self.map.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: EntityKey, value: Value) {
        self.map.write().unwrap().insert(key, value);
    }

    pub fn remove(&self, key: &EntityKey) {
        self.map.write().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<EntityKey, Value> {
        self.map.read().unwrap().clone()
    }
}

/// One user-originated setting change, as remembered for divergence
/// resolution.
#[derive(Debug, Clone)]
pub struct ChangeEntry {
    pub dongle: DongleId,
    pub value: Value,
    pub at: DateTime<Utc>,
}

const HISTORY_CAP: usize = 20;

/// Append-only per-field log of setting changes, capped to the last
/// [`HISTORY_CAP`] entries. The newest entry is the synchronization
/// engine's source-of-truth oracle.
#[derive(Default)]
pub struct ChangeHistory {
    per_field: Mutex<HashMap<String, VecDeque<ChangeEntry>>>,
}

impl ChangeHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, field: &str, dongle: &DongleId, value: Value) {
        let mut per_field = self.per_field.lock().unwrap();
        let entries = per_field.entry(field.to_string()).or_default();
        entries.push_back(ChangeEntry {
            dongle: dongle.clone(),
            value,
            at: Utc::now(),
        });
        while entries.len() > HISTORY_CAP {
            entries.pop_front();
        }
    }

    pub fn latest(&self, field: &str) -> Option<ChangeEntry> {
        self.per_field
            .lock()
            .unwrap()
            .get(field)
            .and_then(|entries| entries.back().cloned())
    }

    pub fn len(&self, field: &str) -> usize {
        self.per_field
            .lock()
            .unwrap()
            .get(field)
            .map_or(0, VecDeque::len)
    }
}

/// One fault or warning episode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultRecord {
    pub value: i64,
    pub description: String,
    pub start_time: String,
    pub end_time: String,
}

const ONGOING: &str = "Ongoing";

/// Active fault/warning state plus episode history for one dongle.
///
/// A non-zero value opens an episode (or keeps the current one running
/// when the description matches); a zero value clears the state and
/// stamps the open episode with the clearing message's timestamp.
pub struct FaultLog {
    kind: FaultKind,
    active: Option<String>,
    history: Vec<FaultRecord>,
}

impl FaultLog {
    pub fn new(kind: FaultKind) -> Self {
        Self {
            kind,
            active: None,
            history: Vec::new(),
        }
    }

    pub fn apply(&mut self, value: i64, description: Option<String>, timestamp: &str) {
        if value == 0 {
            self.active = None;
            if let Some(last) = self.history.last_mut()
                && last.end_time == ONGOING
            {
                last.end_time = timestamp.to_string();
            }
            return;
        }

        let description =
            description.unwrap_or_else(|| self.kind.default_description().to_string());
        let continuing = self
            .history
            .last()
            .is_some_and(|last| last.end_time == ONGOING && last.description == description);
        if !continuing {
            self.history.push(FaultRecord {
                value,
                description: description.clone(),
                start_time: timestamp.to_string(),
                end_time: ONGOING.to_string(),
            });
        }
        self.active = Some(description);
    }

    /// Display label: the active description, or "No Fault"/"No Warning".
    pub fn state_label(&self) -> String {
        self.active
            .clone()
            .unwrap_or_else(|| self.kind.clear_label().to_string())
    }

    pub fn history(&self) -> &[FaultRecord] {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityKind;
    use serde_json::json;

    #[test]
    fn store_last_write_wins() {
        let store = EntityStore::new();
        let id = DongleId::new("dongle-aa:bb:cc:dd:ee:ff");
        let key = EntityKey::dongle(EntityKind::Sensor, &id, "vbat");
        assert!(store.get(&key).is_none());
        store.set(key.clone(), json!(51.9));
        store.set(key.clone(), json!(52.3));
        assert_eq!(store.get(&key), Some(json!(52.3)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn history_caps_per_field() {
        let history = ChangeHistory::new();
        let id = DongleId::new("dongle-aa:bb:cc:dd:ee:ff");
        for i in 0..30 {
            history.record("accharge", &id, json!(i));
        }
        assert_eq!(history.len("accharge"), HISTORY_CAP);
        assert_eq!(history.latest("accharge").unwrap().value, json!(29));
        assert!(history.latest("other").is_none());
    }

    #[test]
    fn fault_log_opens_and_closes_episodes() {
        let mut log = FaultLog::new(FaultKind::Fault);
        assert_eq!(log.state_label(), "No Fault");

        log.apply(3, Some("Over-voltage".to_string()), "T1");
        assert_eq!(log.state_label(), "Over-voltage");
        assert_eq!(log.history().len(), 1);
        assert_eq!(log.history()[0].end_time, ONGOING);

        // Repeats of the same episode do not duplicate history.
        log.apply(3, Some("Over-voltage".to_string()), "T1b");
        assert_eq!(log.history().len(), 1);

        log.apply(0, None, "T2");
        assert_eq!(log.state_label(), "No Fault");
        assert_eq!(log.history()[0].end_time, "T2");
    }

    #[test]
    fn warning_log_defaults_description() {
        let mut log = FaultLog::new(FaultKind::Warning);
        log.apply(7, None, "T1");
        assert_eq!(log.state_label(), "Unknown Warning");
        assert_eq!(log.history()[0].value, 7);
    }
}
