use serde_json::{Value, json};

use crate::state::EntityStore;
use crate::types::{DongleId, EntityKey, EntityKind, truthy};

/// How a combined/virtual entity folds the same field across a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Average,
    /// On only when every source is on (combined-switch semantics).
    All,
    Any,
}

/// Aggregate one field over every dongle that currently reports it.
/// Returns None when no dongle has a usable value.
pub fn combined_value(
    store: &EntityStore,
    group: &[DongleId],
    kind: EntityKind,
    field: &str,
    aggregate: Aggregate,
) -> Option<Value> {
    let values: Vec<Value> = group
        .iter()
        .filter_map(|dongle| store.get(&EntityKey::dongle(kind, dongle, field)))
        .collect();
    if values.is_empty() {
        return None;
    }

    match aggregate {
        Aggregate::Sum | Aggregate::Average => {
            let numbers: Vec<f64> = values.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                return None;
            }
            let sum: f64 = numbers.iter().sum();
            let result = match aggregate {
                Aggregate::Sum => sum,
                _ => sum / numbers.len() as f64,
            };
            Some(json!(result))
        }
        Aggregate::All | Aggregate::Any => {
            let flags: Vec<bool> = values.iter().filter_map(truthy).collect();
            if flags.is_empty() {
                return None;
            }
            let result = match aggregate {
                Aggregate::All => flags.iter().all(|f| *f),
                _ => flags.iter().any(|f| *f),
            };
            Some(json!(result))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> Vec<DongleId> {
        vec![
            DongleId::new("dongle-aa:aa:aa:aa:aa:01"),
            DongleId::new("dongle-aa:aa:aa:aa:aa:02"),
            DongleId::new("dongle-aa:aa:aa:aa:aa:03"),
        ]
    }

    #[test]
    fn sum_and_average_over_reporting_dongles() {
        let store = EntityStore::new();
        let dongles = group();
        store.set(
            EntityKey::dongle(EntityKind::Sensor, &dongles[0], "ppv1"),
            json!(1200.0),
        );
        store.set(
            EntityKey::dongle(EntityKind::Sensor, &dongles[1], "ppv1"),
            json!(800.0),
        );
        // Third dongle has not reported: ignored, not treated as zero.
        assert_eq!(
            combined_value(&store, &dongles, EntityKind::Sensor, "ppv1", Aggregate::Sum),
            Some(json!(2000.0))
        );
        assert_eq!(
            combined_value(&store, &dongles, EntityKind::Sensor, "ppv1", Aggregate::Average),
            Some(json!(1000.0))
        );
    }

    #[test]
    fn all_requires_every_source_on() {
        let store = EntityStore::new();
        let dongles = group();
        for dongle in &dongles {
            store.set(EntityKey::dongle(EntityKind::Switch, dongle, "accharge"), json!(1));
        }
        assert_eq!(
            combined_value(&store, &dongles, EntityKind::Switch, "accharge", Aggregate::All),
            Some(json!(true))
        );
        store.set(
            EntityKey::dongle(EntityKind::Switch, &dongles[2], "accharge"),
            json!(0),
        );
        assert_eq!(
            combined_value(&store, &dongles, EntityKind::Switch, "accharge", Aggregate::All),
            Some(json!(false))
        );
        assert_eq!(
            combined_value(&store, &dongles, EntityKind::Switch, "accharge", Aggregate::Any),
            Some(json!(true))
        );
    }

    #[test]
    fn empty_group_value_is_unknown() {
        let store = EntityStore::new();
        assert_eq!(
            combined_value(&store, &group(), EntityKind::Sensor, "ppv1", Aggregate::Sum),
            None
        );
    }
}
