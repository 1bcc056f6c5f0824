use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::combined::{Aggregate, combined_value};
use crate::dispatch::{CommandDispatcher, Debouncer, NoRollback, Revertible};
use crate::logger::{MessageLogMode, MessageLogger};
use crate::mqtt::MqttBridge;
use crate::protocol::{
    batch_update_payload, catch_all_topic, decode_status, decode_telegram,
    firmware_request_topic, firmware_response_topic, topic_bank, topic_device, update_payload,
    update_topic,
};
use crate::schema::{Brand, EntityResolver};
use crate::state::{ChangeHistory, EntityStore, FaultLog, FaultRecord};
use crate::sync::{SYNC_INTERVAL, SyncEngine};
use crate::types::{
    BridgeEvent, DongleConfig, DongleId, EntityKey, EntityKind, FaultKind, NullValuePolicy,
    TieBreak, normalize_segment,
};

type EventCallback = Box<dyn Fn(&BridgeEvent) + Send + Sync>;

const HANDSHAKE_ATTEMPTS: u32 = 20;

/// Reserved telegram keys that feed version tracking instead of a
/// generic entity.
const SW_VERSION_KEY: &str = "SW_VERSION";
const UI_VERSION_KEY: &str = "UI_VERSION";

pub struct CoordinatorBuilder {
    brand: Brand,
    mqtt: Arc<dyn MqttBridge>,
    dongles: Vec<DongleConfig>,
    event_callbacks: Vec<EventCallback>,
    null_values: NullValuePolicy,
    tie_break: TieBreak,
    sync_interval: Duration,
    response_timeout: Option<Duration>,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl CoordinatorBuilder {
    pub fn new(brand: Brand, mqtt: Arc<dyn MqttBridge>) -> Self {
        Self {
            brand,
            mqtt,
            dongles: Vec::new(),
            event_callbacks: Vec::new(),
            null_values: NullValuePolicy::default(),
            tie_break: TieBreak::default(),
            sync_interval: SYNC_INTERVAL,
            response_timeout: None,
            log_mode: None,
            log_path: None,
        }
    }

    pub fn dongle(mut self, id: impl AsRef<str>) -> Self {
        self.dongles.push(DongleConfig {
            id: DongleId::new(id),
            ip: None,
        });
        self
    }

    /// A dongle with a known LAN address, enabling the firmware-update
    /// flow for it.
    pub fn dongle_at(mut self, id: impl AsRef<str>, ip: impl Into<String>) -> Self {
        self.dongles.push(DongleConfig {
            id: DongleId::new(id),
            ip: Some(ip.into()),
        });
        self
    }

    pub fn on_event(mut self, f: impl Fn(&BridgeEvent) + Send + Sync + 'static) -> Self {
        self.event_callbacks.push(Box::new(f));
        self
    }

    pub fn null_values(mut self, policy: NullValuePolicy) -> Self {
        self.null_values = policy;
        self
    }

    pub fn tie_break(mut self, policy: TieBreak) -> Self {
        self.tie_break = policy;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Coordinator {
        assert!(
            !self.dongles.is_empty(),
            "at least one dongle must be configured"
        );

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Mutex::new(
                MessageLogger::new(mode, &path).expect("failed to open message log"),
            )),
            _ => None,
        };

        let resolver = EntityResolver::new(self.brand);
        let store = Arc::new(EntityStore::new());
        let history = Arc::new(ChangeHistory::new());
        let dispatcher = Arc::new(match self.response_timeout {
            Some(timeout) => CommandDispatcher::with_timeout(Arc::clone(&self.mqtt), timeout),
            None => CommandDispatcher::new(Arc::clone(&self.mqtt)),
        });

        let ids: Vec<DongleId> = self.dongles.iter().map(|d| d.id.clone()).collect();
        // Parallel groups get the synchronization engine; a single
        // dongle has nothing to diverge from.
        let sync = (ids.len() > 1).then(|| {
            Arc::new(SyncEngine::new(
                ids.clone(),
                resolver.monitored_settings(),
                Arc::clone(&store),
                Arc::clone(&history),
                Arc::clone(&dispatcher),
                self.tie_break,
                self.sync_interval,
            ))
        });

        let ips = self
            .dongles
            .iter()
            .filter_map(|d| d.ip.clone().map(|ip| (d.id.clone(), ip)))
            .collect();
        let pending = ids.iter().cloned().collect();

        Coordinator {
            mqtt: self.mqtt,
            dongles: ids,
            ips,
            resolver,
            store,
            history,
            dispatcher,
            debounce: Debouncer::default(),
            sync,
            firmware_codes: Mutex::new(HashMap::new()),
            pending_dongles: Mutex::new(pending),
            fw_versions: Mutex::new(HashMap::new()),
            ui_versions: Mutex::new(HashMap::new()),
            fault_logs: Mutex::new(HashMap::new()),
            event_callbacks: self.event_callbacks,
            null_values: self.null_values,
            logger,
        }
    }
}

/// Owner of the bridge state: routes inbound MQTT messages into the
/// entity store, runs the firmware-code handshake, and fronts the
/// command dispatcher for setting changes.
pub struct Coordinator {
    mqtt: Arc<dyn MqttBridge>,
    dongles: Vec<DongleId>,
    ips: HashMap<DongleId, String>,
    resolver: EntityResolver,
    store: Arc<EntityStore>,
    history: Arc<ChangeHistory>,
    dispatcher: Arc<CommandDispatcher>,
    debounce: Debouncer,
    sync: Option<Arc<SyncEngine>>,
    firmware_codes: Mutex<HashMap<DongleId, String>>,
    pending_dongles: Mutex<HashSet<DongleId>>,
    fw_versions: Mutex<HashMap<DongleId, String>>,
    ui_versions: Mutex<HashMap<DongleId, String>>,
    fault_logs: Mutex<HashMap<(DongleId, FaultKind), FaultLog>>,
    event_callbacks: Vec<EventCallback>,
    null_values: NullValuePolicy,
    logger: Option<Mutex<MessageLogger>>,
}

impl Coordinator {
    pub fn builder(brand: Brand, mqtt: Arc<dyn MqttBridge>) -> CoordinatorBuilder {
        CoordinatorBuilder::new(brand, mqtt)
    }

    pub fn dongles(&self) -> &[DongleId] {
        &self.dongles
    }

    pub fn dongle_ip(&self, dongle: &DongleId) -> Option<&str> {
        self.ips.get(dongle).map(String::as_str)
    }

    /// The synchronization engine, present for groups of two or more.
    pub fn sync(&self) -> Option<&Arc<SyncEngine>> {
        self.sync.as_ref()
    }

    /// Shared handle to the entity state map for external readers.
    pub fn store(&self) -> Arc<EntityStore> {
        Arc::clone(&self.store)
    }

    pub fn entity_value(&self, key: &EntityKey) -> Option<Value> {
        self.store.get(key)
    }

    pub fn entity_count(&self) -> usize {
        self.store.len()
    }

    pub fn firmware_code(&self, dongle: &DongleId) -> Option<String> {
        self.firmware_codes.lock().unwrap().get(dongle).cloned()
    }

    pub fn firmware_version(&self, dongle: &DongleId) -> Option<String> {
        self.fw_versions.lock().unwrap().get(dongle).cloned()
    }

    pub fn ui_version(&self, dongle: &DongleId) -> Option<String> {
        self.ui_versions.lock().unwrap().get(dongle).cloned()
    }

    /// Dongles that have not answered the firmware-code handshake yet.
    pub fn pending_dongles(&self) -> Vec<DongleId> {
        let mut pending: Vec<DongleId> =
            self.pending_dongles.lock().unwrap().iter().cloned().collect();
        pending.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        pending
    }

    pub fn fault_state(&self, dongle: &DongleId, kind: FaultKind) -> String {
        self.fault_logs
            .lock()
            .unwrap()
            .get(&(dongle.clone(), kind))
            .map(FaultLog::state_label)
            .unwrap_or_else(|| kind.clear_label().to_string())
    }

    pub fn fault_history(&self, dongle: &DongleId, kind: FaultKind) -> Vec<FaultRecord> {
        self.fault_logs
            .lock()
            .unwrap()
            .get(&(dongle.clone(), kind))
            .map(|log| log.history().to_vec())
            .unwrap_or_default()
    }

    /// Aggregate one field across the whole group (combined/virtual
    /// entity reading).
    pub fn combined_value(&self, field: &str, aggregate: Aggregate) -> Option<Value> {
        let kind = self.resolver.resolve(field);
        combined_value(&self.store, &self.dongles, kind, field, aggregate)
    }

    // -- Startup sequencing --

    /// Ask every dongle that has no cached firmware code to identify
    /// itself. Transport errors are logged per dongle; the handshake
    /// carries on with the rest.
    pub async fn request_firmware_codes(&self) {
        for dongle in &self.dongles {
            if self.firmware_codes.lock().unwrap().contains_key(dongle) {
                continue;
            }
            debug!(dongle = %dongle, "requesting firmware code");
            if let Err(e) = self.mqtt.subscribe(&firmware_response_topic(dongle)).await {
                error!(dongle = %dongle, "failed to subscribe for firmware code: {e}");
                continue;
            }
            if let Err(e) = self.mqtt.publish(&firmware_request_topic(dongle), "").await {
                error!(dongle = %dongle, "failed to publish firmware code request: {e}");
            }
        }
    }

    /// Poll for up to ~20 seconds until every dongle has answered the
    /// handshake, re-sending the request at the midpoint. Returns
    /// whether the pending set drained; setup proceeds either way.
    pub async fn wait_for_firmware_codes(&self) -> bool {
        for attempt in 0..HANDSHAKE_ATTEMPTS {
            if self.pending_dongles.lock().unwrap().is_empty() {
                debug!("all firmware codes received");
                return true;
            }
            if attempt == HANDSHAKE_ATTEMPTS / 2 {
                let pending = self.pending_dongles();
                debug!(?pending, "still waiting for firmware codes, re-requesting");
                for dongle in pending {
                    if let Err(e) =
                        self.mqtt.publish(&firmware_request_topic(&dongle), "").await
                    {
                        error!(dongle = %dongle, "failed to re-request firmware code: {e}");
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let pending = self.pending_dongles();
        if pending.is_empty() {
            true
        } else {
            warn!(?pending, "proceeding without firmware codes for some dongles");
            false
        }
    }

    /// Swap the handshake-only subscriptions for each dongle's
    /// catch-all topic.
    pub async fn start(&self) -> Result<()> {
        for dongle in &self.dongles {
            if let Err(e) = self.mqtt.unsubscribe(&firmware_response_topic(dongle)).await {
                warn!(dongle = %dongle, "failed to drop firmware-code subscription: {e}");
            }
            self.mqtt.subscribe(&catch_all_topic(dongle)).await?;
        }
        info!(dongles = self.dongles.len(), "listening on all dongle topics");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.debounce.cancel_all();
        if let Some(sync) = &self.sync {
            sync.disable();
        }
        for dongle in &self.dongles {
            self.mqtt.unsubscribe(&catch_all_topic(dongle)).await?;
        }
        Ok(())
    }

    // -- Topic router --

    /// Route one inbound MQTT message. Never fails: malformed input is
    /// logged and dropped, degrading to a no-op for that message.
    pub fn handle_message(&self, topic: &str, payload: &[u8]) {
        if let Some(logger) = &self.logger {
            logger.lock().unwrap().log_inbound(topic, payload);
        }

        let Some(device) = topic_device(topic) else {
            debug!(topic, "message without a device segment");
            return;
        };
        let Some(dongle) = self.lookup_dongle(device) else {
            debug!(topic, "message from unconfigured device");
            return;
        };

        if topic.ends_with("/firmwarecode/response") {
            self.handle_firmware_code(&dongle, payload);
        } else if topic.ends_with("/response") {
            self.dispatcher.handle_response(&dongle, payload);
        } else if topic.ends_with("/status") {
            self.handle_status(&dongle, payload);
        } else {
            self.handle_telegram(&dongle, topic, payload);
        }
    }

    fn lookup_dongle(&self, device: &str) -> Option<DongleId> {
        let id = DongleId::new(device);
        self.dongles.contains(&id).then_some(id)
    }

    fn handle_firmware_code(&self, dongle: &DongleId, payload: &[u8]) {
        let Ok(data) = serde_json::from_slice::<Value>(payload) else {
            error!(dongle = %dongle, "invalid JSON in firmware code response");
            return;
        };
        let Some(code) = data.get("FWCode").and_then(Value::as_str) else {
            error!(dongle = %dongle, "no firmware code in response");
            return;
        };

        let mut codes = self.firmware_codes.lock().unwrap();
        if codes.contains_key(dongle) {
            // Assigned once per session; later answers are fine but moot.
            debug!(dongle = %dongle, "firmware code already assigned");
        } else {
            info!(dongle = %dongle, code, "firmware code assigned");
            codes.insert(dongle.clone(), code.to_string());
        }
        drop(codes);

        self.pending_dongles.lock().unwrap().remove(dongle);
        self.emit(&BridgeEvent::FirmwareCode {
            dongle: dongle.clone(),
            code: code.to_string(),
        });
    }

    fn handle_status(&self, dongle: &DongleId, payload: &[u8]) {
        if payload.is_empty() || payload.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        let Some(status) = decode_status(payload) else {
            error!(dongle = %dongle, "invalid JSON in status message");
            return;
        };
        self.store
            .set(EntityKey::dongle(EntityKind::Sensor, dongle, "uptime"), status);
    }

    fn handle_telegram(&self, dongle: &DongleId, topic: &str, payload: &[u8]) {
        if payload.is_empty() || payload.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        let Some(telegram) = decode_telegram(payload) else {
            error!(dongle = %dongle, topic, "invalid JSON payload");
            return;
        };

        self.track_versions(dongle, &telegram.fields);

        for (kind_key, fault_kind) in [("fault", FaultKind::Fault), ("warning", FaultKind::Warning)]
        {
            if let Some(Value::Object(data)) = telegram.events.get(kind_key)
                && !data.is_empty()
            {
                self.apply_fault(dongle, fault_kind, data);
            }
        }

        for (field, value) in &telegram.fields {
            if field == SW_VERSION_KEY || field == UI_VERSION_KEY {
                continue;
            }
            if value.is_null() {
                match self.null_values {
                    NullValuePolicy::Ignore => {
                        debug!(dongle = %dongle, %field, "ignoring null field value");
                        continue;
                    }
                    NullValuePolicy::Clear => {
                        let kind = self.resolver.resolve(field);
                        self.store.remove(&EntityKey::dongle(kind, dongle, field));
                        continue;
                    }
                }
            }
            let kind = self.resolver.resolve(field);
            let key = EntityKey::dongle(kind, dongle, field);
            let previous = self.store.get(&key);
            self.store.set(key, value.clone());

            if kind.is_setting()
                && previous.as_ref() != Some(value)
                && let Some(sync) = &self.sync
            {
                sync.on_observed_change(dongle, &normalize_segment(field), value);
            }
        }

        for (event, value) in &telegram.events {
            if event == "fault" || event == "warning" {
                continue;
            }
            self.store.set(
                EntityKey::dongle(EntityKind::BinarySensor, dongle, event),
                value.clone(),
            );
        }

        self.emit(&BridgeEvent::BankUpdated {
            dongle: dongle.clone(),
            bank: topic_bank(topic).to_string(),
        });
    }

    fn track_versions(&self, dongle: &DongleId, fields: &Map<String, Value>) {
        if let Some(version) = fields.get(SW_VERSION_KEY).and_then(Value::as_str) {
            self.fw_versions
                .lock()
                .unwrap()
                .insert(dongle.clone(), version.to_string());
            self.store.set(
                EntityKey::dongle(EntityKind::Update, dongle, "firmware_update"),
                json!(version),
            );
            self.emit(&BridgeEvent::FirmwareVersion {
                dongle: dongle.clone(),
                version: version.to_string(),
            });
        }
        if let Some(version) = fields.get(UI_VERSION_KEY).and_then(Value::as_str) {
            self.ui_versions
                .lock()
                .unwrap()
                .insert(dongle.clone(), version.to_string());
            self.store.set(
                EntityKey::dongle(EntityKind::Update, dongle, "ui_update"),
                json!(version),
            );
            self.emit(&BridgeEvent::UiVersion {
                dongle: dongle.clone(),
                version: version.to_string(),
            });
        }
    }

    fn apply_fault(&self, dongle: &DongleId, kind: FaultKind, data: &Map<String, Value>) {
        let value = data.get("value").and_then(Value::as_i64).unwrap_or(0);
        let timestamp = data
            .get("timestamp")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let key = EntityKey::dongle(EntityKind::Sensor, dongle, kind.entity_field());

        let description = if value == 0 {
            self.store.set(
                key,
                json!({ "value": 0, "description": null, "timestamp": timestamp }),
            );
            None
        } else {
            let description = data
                .get("descriptions")
                .and_then(Value::as_array)
                .map(|ds| {
                    ds.iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| kind.default_description().to_string());
            debug!(dongle = %dongle, ?kind, value, %description, "active fault/warning");
            self.store.set(
                key,
                json!({
                    "value": value,
                    "description": description,
                    "start_time": timestamp,
                    "end_time": "Ongoing",
                }),
            );
            Some(description)
        };

        self.fault_logs
            .lock()
            .unwrap()
            .entry((dongle.clone(), kind))
            .or_insert_with(|| FaultLog::new(kind))
            .apply(value, description, timestamp);
    }

    fn emit(&self, event: &BridgeEvent) {
        for callback in &self.event_callbacks {
            callback(event);
        }
    }

    // -- Command facade --

    /// Change one setting on one dongle. On acknowledgement the new
    /// value is echoed into the state map and remembered as the
    /// group's source of truth.
    pub async fn apply_setting(
        &self,
        dongle: &DongleId,
        setting: &str,
        value: Value,
        entity: &dyn Revertible,
    ) -> bool {
        self.log_command(&update_topic(dongle), &update_payload(setting, &value));
        let ok = self
            .dispatcher
            .send(dongle, setting, value.clone(), entity)
            .await;
        if ok {
            self.confirm_setting(dongle, setting, &value);
            if let Some(sync) = &self.sync {
                sync.on_user_change(dongle, setting, &value);
            }
        }
        ok
    }

    /// Change the same setting on every dongle in the group.
    pub async fn apply_setting_to_group(
        &self,
        setting: &str,
        value: Value,
        entity: &dyn Revertible,
    ) -> bool {
        for dongle in &self.dongles {
            self.log_command(&update_topic(dongle), &update_payload(setting, &value));
        }
        let ok = self
            .dispatcher
            .send_to_group(&self.dongles, setting, value.clone(), entity)
            .await;
        if ok {
            for dongle in &self.dongles {
                self.confirm_setting(dongle, setting, &value);
            }
        }
        ok
    }

    /// Change several settings on one dongle in a single command.
    pub async fn apply_settings_batch(
        &self,
        dongle: &DongleId,
        settings: &[(String, Value)],
        entity: &dyn Revertible,
    ) -> bool {
        self.log_command(&update_topic(dongle), &batch_update_payload(settings));
        let ok = self.dispatcher.send_batch(dongle, settings, entity).await;
        if ok {
            for (setting, value) in settings {
                self.confirm_setting(dongle, setting, value);
            }
        }
        ok
    }

    /// Debounced edit of a time-of-day setting: rapid edits within the
    /// debounce window collapse into one send of the last value.
    pub fn schedule_time_setting(self: &Arc<Self>, dongle: &DongleId, setting: &str, value: Value) {
        let key = EntityKey::dongle(EntityKind::Time, dongle, setting);
        let coordinator = Arc::clone(self);
        let dongle = dongle.clone();
        let setting = setting.to_string();
        self.debounce.schedule(key, async move {
            if !coordinator
                .apply_setting(&dongle, &setting, value, &NoRollback)
                .await
            {
                debug!(dongle = %dongle, %setting, "debounced time update was dropped");
            }
        });
    }

    fn confirm_setting(&self, dongle: &DongleId, setting: &str, value: &Value) {
        let kind = self.resolver.resolve(setting);
        self.store
            .set(EntityKey::dongle(kind, dongle, setting), value.clone());
        self.history
            .record(&normalize_segment(setting), dongle, value.clone());
    }

    fn log_command(&self, topic: &str, payload: &str) {
        if let Some(logger) = &self.logger {
            logger.lock().unwrap().log_command(topic, payload);
        }
    }
}
