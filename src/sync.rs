use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dispatch::{CommandDispatcher, NoRollback};
use crate::schema::SettingField;
use crate::state::{ChangeHistory, EntityStore};
use crate::types::{DongleId, EntityKey, TieBreak};

pub(crate) const SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Lifecycle of the engine. Enabling attaches the observation hooks and
/// starts the periodic sweep; disabling detaches and stops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

/// Result of one reconciliation sweep.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Fields whose observed values disagreed across the group.
    pub out_of_sync: usize,
    /// Fields for which a correction was acknowledged this sweep.
    pub corrected: usize,
    /// Observed value per field per dongle ("unknown" entries omitted).
    pub details: BTreeMap<String, BTreeMap<String, Value>>,
}

impl SyncReport {
    pub fn summary(&self) -> String {
        if self.out_of_sync == 0 {
            "synced".to_string()
        } else {
            format!("{} unsynced", self.out_of_sync)
        }
    }
}

/// Keeps the mutable settings of a dongle group identical.
///
/// Two paths converge here: observed changes on one dongle are fanned
/// out to its peers as they happen, and a periodic sweep repairs any
/// divergence the event path missed, using the change history as the
/// source-of-truth oracle and falling back to a majority vote.
pub struct SyncEngine {
    group: Vec<DongleId>,
    monitored: Vec<SettingField>,
    store: Arc<EntityStore>,
    history: Arc<ChangeHistory>,
    dispatcher: Arc<CommandDispatcher>,
    tie_break: TieBreak,
    interval: Duration,
    phase: Mutex<SyncPhase>,
    sweep: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Values we just pushed to a dongle, so its echo of the write is
    /// not mistaken for a fresh local change.
    expected_echoes: Mutex<HashMap<(DongleId, String), Value>>,
    last_report: Mutex<SyncReport>,
}

impl SyncEngine {
    pub(crate) fn new(
        group: Vec<DongleId>,
        monitored: Vec<SettingField>,
        store: Arc<EntityStore>,
        history: Arc<ChangeHistory>,
        dispatcher: Arc<CommandDispatcher>,
        tie_break: TieBreak,
        interval: Duration,
    ) -> Self {
        Self {
            group,
            monitored,
            store,
            history,
            dispatcher,
            tie_break,
            interval,
            phase: Mutex::new(SyncPhase::Disabled),
            sweep: Mutex::new(None),
            expected_echoes: Mutex::new(HashMap::new()),
            last_report: Mutex::new(SyncReport::default()),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap()
    }

    pub fn is_enabled(&self) -> bool {
        self.phase() == SyncPhase::Enabled
    }

    /// Start watching for divergence and sweeping periodically. The
    /// first sweep runs one interval after enabling.
    pub fn enable(self: &Arc<Self>) {
        {
            let mut phase = self.phase.lock().unwrap();
            if *phase != SyncPhase::Disabled {
                return;
            }
            *phase = SyncPhase::Enabling;
        }
        info!(dongles = self.group.len(), settings = self.monitored.len(), "enabling settings sync");
        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.interval);
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                ticker.tick().await;
                engine.reconcile_once().await;
            }
        });
        *self.sweep.lock().unwrap() = Some(task);
        *self.phase.lock().unwrap() = SyncPhase::Enabled;
    }

    pub fn disable(&self) {
        {
            let mut phase = self.phase.lock().unwrap();
            if *phase != SyncPhase::Enabled {
                return;
            }
            *phase = SyncPhase::Disabling;
        }
        info!("disabling settings sync");
        if let Some(task) = self.sweep.lock().unwrap().take() {
            task.abort();
        }
        self.expected_echoes.lock().unwrap().clear();
        *self.phase.lock().unwrap() = SyncPhase::Disabled;
    }

    /// Report of the most recent sweep.
    pub fn report(&self) -> SyncReport {
        self.last_report.lock().unwrap().clone()
    }

    /// A user changed a setting on one dongle through us. Remember it
    /// as the source of truth and push it to the rest of the group.
    pub(crate) fn on_user_change(self: &Arc<Self>, origin: &DongleId, wire_field: &str, value: &Value) {
        let Some(setting) = self.lookup_wire(wire_field) else {
            return;
        };
        if !self.is_enabled() {
            return;
        }
        self.spawn_propagation(origin, setting, value.clone());
    }

    /// The router observed a monitored field change on one dongle
    /// (e.g. someone used the inverter's own panel). Unless it is the
    /// echo of our own propagation, record and fan out.
    pub(crate) fn on_observed_change(self: &Arc<Self>, origin: &DongleId, field: &str, value: &Value) {
        if !self.is_enabled() {
            return;
        }
        let Some(setting) = self.lookup_field(field) else {
            return;
        };
        if self.consume_expected_echo(origin, field, value) {
            debug!(dongle = %origin, field, "ignoring sync propagation echo");
            return;
        }
        self.history.record(field, origin, value.clone());
        self.spawn_propagation(origin, setting, value.clone());
    }

    fn spawn_propagation(self: &Arc<Self>, origin: &DongleId, setting: SettingField, value: Value) {
        let engine = Arc::clone(self);
        let origin = origin.clone();
        tokio::spawn(async move {
            engine.propagate(&origin, &setting, value).await;
        });
    }

    /// Push `value` to every group member except `origin`.
    async fn propagate(&self, origin: &DongleId, setting: &SettingField, value: Value) {
        let targets: Vec<DongleId> = self
            .group
            .iter()
            .filter(|d| *d != origin)
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }
        self.push_to(&targets, setting, value).await;
    }

    async fn push_to(&self, targets: &[DongleId], setting: &SettingField, value: Value) -> bool {
        for target in targets {
            self.expect_echo(target, &setting.field, &value);
        }
        let ok = self
            .dispatcher
            .send_to_group(targets, setting.wire, value.clone(), &NoRollback)
            .await;
        if ok {
            // Confirmed-command echo: the peers now hold this value.
            for target in targets {
                self.store.set(
                    EntityKey::dongle(setting.kind, target, &setting.field),
                    value.clone(),
                );
            }
        } else {
            warn!(
                field = setting.wire,
                ?targets,
                "sync propagation failed, will retry on next sweep"
            );
        }
        ok
    }

    /// One reconciliation pass over every monitored field. Failures
    /// are logged per field and do not stop the pass.
    pub async fn reconcile_once(&self) -> SyncReport {
        let mut report = SyncReport::default();

        for setting in &self.monitored {
            let observed: Vec<(DongleId, Value)> = self
                .group
                .iter()
                .filter_map(|dongle| {
                    self.store
                        .get(&EntityKey::dongle(setting.kind, dongle, &setting.field))
                        .map(|value| (dongle.clone(), value))
                })
                .collect();
            if observed.is_empty() {
                continue;
            }

            let mut row = BTreeMap::new();
            for (dongle, value) in &observed {
                row.insert(dongle.to_string(), value.clone());
            }
            report.details.insert(setting.field.clone(), row);

            let divergent = observed.iter().any(|(_, v)| *v != observed[0].1);
            if !divergent {
                continue;
            }
            report.out_of_sync += 1;

            let truth = match self.history.latest(&setting.field) {
                Some(entry) => entry.value,
                None => majority(&observed, self.tie_break),
            };
            let targets: Vec<DongleId> = observed
                .iter()
                .filter(|(_, v)| *v != truth)
                .map(|(d, _)| d.clone())
                .collect();
            if targets.is_empty() {
                continue;
            }
            debug!(
                field = setting.wire,
                truth = %truth,
                targets = targets.len(),
                "repairing divergent setting"
            );
            if self.push_to(&targets, setting, truth).await {
                report.corrected += 1;
            }
        }

        debug!(
            out_of_sync = report.out_of_sync,
            corrected = report.corrected,
            "sync sweep complete"
        );
        *self.last_report.lock().unwrap() = report.clone();
        report
    }

    fn lookup_field(&self, field: &str) -> Option<SettingField> {
        self.monitored.iter().find(|s| s.field == field).cloned()
    }

    fn lookup_wire(&self, wire_field: &str) -> Option<SettingField> {
        self.monitored
            .iter()
            .find(|s| s.wire.eq_ignore_ascii_case(wire_field))
            .cloned()
    }

    fn expect_echo(&self, dongle: &DongleId, field: &str, value: &Value) {
        self.expected_echoes
            .lock()
            .unwrap()
            .insert((dongle.clone(), field.to_string()), value.clone());
    }

    fn consume_expected_echo(&self, dongle: &DongleId, field: &str, value: &Value) -> bool {
        let mut echoes = self.expected_echoes.lock().unwrap();
        let key = (dongle.clone(), field.to_string());
        if echoes.get(&key) == Some(value) {
            echoes.remove(&key);
            return true;
        }
        false
    }
}

/// Majority vote over the observed values, tie-broken by observation
/// order per the configured policy.
fn majority(observed: &[(DongleId, Value)], tie_break: TieBreak) -> Value {
    let mut tally: Vec<(&Value, usize)> = Vec::new();
    for (_, value) in observed {
        match tally.iter_mut().find(|(v, _)| *v == value) {
            Some((_, count)) => *count += 1,
            None => tally.push((value, 1)),
        }
    }
    let mut winner = &tally[0];
    for candidate in &tally[1..] {
        let wins = match tie_break {
            TieBreak::FirstObserved => candidate.1 > winner.1,
            TieBreak::LastObserved => candidate.1 >= winner.1,
        };
        if wins {
            winner = candidate;
        }
    }
    winner.0.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn observed(values: &[i64]) -> Vec<(DongleId, Value)> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (DongleId::new(format!("dongle-{i:02}")), json!(v)))
            .collect()
    }

    #[test]
    fn majority_picks_most_common() {
        assert_eq!(majority(&observed(&[1, 1, 2]), TieBreak::FirstObserved), json!(1));
        assert_eq!(majority(&observed(&[2, 1, 1]), TieBreak::FirstObserved), json!(1));
    }

    #[test]
    fn tie_break_policies() {
        assert_eq!(majority(&observed(&[1, 2]), TieBreak::FirstObserved), json!(1));
        assert_eq!(majority(&observed(&[1, 2]), TieBreak::LastObserved), json!(2));
    }

    #[test]
    fn summary_strings() {
        let mut report = SyncReport::default();
        assert_eq!(report.summary(), "synced");
        report.out_of_sync = 3;
        assert_eq!(report.summary(), "3 unsynced");
    }
}
