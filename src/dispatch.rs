use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::mqtt::MqttBridge;
use crate::protocol::{batch_update_payload, response_topic, update_payload, update_topic};
use crate::types::{DongleId, EntityKey};

/// Owner of the optimistic UI state behind an in-flight setting change.
/// `revert` is called exactly once when the change fails.
pub trait Revertible: Send + Sync {
    fn revert(&self);
}

/// Rollback target for engine-originated commands, which carry no
/// optimistic UI state.
pub(crate) struct NoRollback;

impl Revertible for NoRollback {
    fn revert(&self) {}
}

const RATE_LIMIT: Duration = Duration::from_secs(1);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(15);
const DEBOUNCE_DELAY: Duration = Duration::from_secs(1);

struct Pending {
    awaiting: HashSet<DongleId>,
    statuses: HashMap<DongleId, bool>,
    done: Option<oneshot::Sender<()>>,
}

/// Serializes setting changes to the dongles and correlates their
/// asynchronous acknowledgements.
///
/// One command may be in flight process-wide; anything else arriving
/// while it runs, or within the 1-second rate-limit window, is dropped
/// and reported as a no-op failure. Replies are matched by the device
/// identity in the response topic, so the single- and multi-device
/// paths share one pending slot.
pub struct CommandDispatcher {
    mqtt: Arc<dyn MqttBridge>,
    busy: tokio::sync::Mutex<()>,
    last_dispatch: Mutex<Option<Instant>>,
    pending: Mutex<Option<Pending>>,
    response_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(mqtt: Arc<dyn MqttBridge>) -> Self {
        Self::with_timeout(mqtt, RESPONSE_TIMEOUT)
    }

    pub fn with_timeout(mqtt: Arc<dyn MqttBridge>, response_timeout: Duration) -> Self {
        Self {
            mqtt,
            busy: tokio::sync::Mutex::new(()),
            last_dispatch: Mutex::new(None),
            pending: Mutex::new(None),
            response_timeout,
        }
    }

    /// Send one setting change to one dongle and wait for its
    /// acknowledgement. A non-success reply or a timeout returns false
    /// after invoking `entity.revert` exactly once; a rate-limit or
    /// busy rejection returns false without touching the entity.
    pub async fn send(
        &self,
        dongle: &DongleId,
        setting: &str,
        value: Value,
        entity: &dyn Revertible,
    ) -> bool {
        let payload = update_payload(setting, &value);
        self.dispatch(std::slice::from_ref(dongle), payload, false, entity)
            .await
    }

    /// Send the same setting change to every dongle in the group and
    /// wait for all acknowledgements under a single timeout. Response
    /// topics are subscribed before anything is published so a fast
    /// dongle cannot answer into the void.
    pub async fn send_to_group(
        &self,
        dongles: &[DongleId],
        setting: &str,
        value: Value,
        entity: &dyn Revertible,
    ) -> bool {
        if dongles.is_empty() {
            warn!("group dispatch with no target dongles");
            return false;
        }
        let payload = update_payload(setting, &value);
        self.dispatch(dongles, payload, true, entity).await
    }

    /// Send several settings to one dongle in a single command.
    pub async fn send_batch(
        &self,
        dongle: &DongleId,
        settings: &[(String, Value)],
        entity: &dyn Revertible,
    ) -> bool {
        let payload = batch_update_payload(settings);
        self.dispatch(std::slice::from_ref(dongle), payload, false, entity)
            .await
    }

    /// Feed a reply arriving on `<id>/response`. Called by the topic
    /// router; a payload that does not parse still counts as this
    /// dongle's (failed) answer.
    pub fn handle_response(&self, dongle: &DongleId, payload: &[u8]) {
        let status = match serde_json::from_slice::<Value>(payload) {
            Ok(reply) => reply
                .get("status")
                .and_then(Value::as_str)
                .is_some_and(|s| s == "success"),
            Err(e) => {
                error!(dongle = %dongle, "unparseable command response: {e}");
                false
            }
        };

        let mut slot = self.pending.lock().unwrap();
        let Some(pending) = slot.as_mut() else {
            debug!(dongle = %dongle, "response with no command in flight");
            return;
        };
        if !pending.awaiting.remove(dongle) {
            warn!(dongle = %dongle, "response from dongle we were not waiting for");
            return;
        }
        pending.statuses.insert(dongle.clone(), status);
        if pending.awaiting.is_empty()
            && let Some(done) = pending.done.take()
        {
            let _ = done.send(());
        }
    }

    async fn dispatch(
        &self,
        dongles: &[DongleId],
        payload: String,
        subscribe_first: bool,
        entity: &dyn Revertible,
    ) -> bool {
        if self.rate_limited() {
            info!("rate limit hit, dropping command");
            return false;
        }
        let Ok(_busy) = self.busy.try_lock() else {
            info!("a command is already in flight, dropping");
            return false;
        };
        self.mark_dispatched();

        let (done_tx, done_rx) = oneshot::channel();
        *self.pending.lock().unwrap() = Some(Pending {
            awaiting: dongles.iter().cloned().collect(),
            statuses: HashMap::new(),
            done: Some(done_tx),
        });

        let completed = self
            .exchange(dongles, &payload, subscribe_first, done_rx)
            .await;

        // Release the response subscriptions and the pending slot on
        // every exit path.
        for dongle in dongles {
            if let Err(e) = self.mqtt.unsubscribe(&response_topic(dongle)).await {
                warn!(dongle = %dongle, "failed to unsubscribe from response topic: {e}");
            }
        }
        let finished = self.pending.lock().unwrap().take();

        let success = completed
            && finished.is_some_and(|p| {
                dongles
                    .iter()
                    .all(|d| p.statuses.get(d).copied().unwrap_or(false))
            });
        if !success {
            entity.revert();
        }
        success
    }

    async fn exchange(
        &self,
        dongles: &[DongleId],
        payload: &str,
        subscribe_first: bool,
        done_rx: oneshot::Receiver<()>,
    ) -> bool {
        if subscribe_first && !self.subscribe_responses(dongles).await {
            return false;
        }
        for dongle in dongles {
            let topic = update_topic(dongle);
            info!(%topic, payload, "publishing setting change");
            if let Err(e) = self.mqtt.publish(&topic, payload).await {
                error!(%topic, "failed to publish command: {e}");
                return false;
            }
        }
        if !subscribe_first && !self.subscribe_responses(dongles).await {
            return false;
        }

        match timeout(self.response_timeout, done_rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                let outstanding: Vec<String> = self
                    .pending
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|p| p.awaiting.iter().map(ToString::to_string).collect())
                    .unwrap_or_default();
                error!(
                    ?outstanding,
                    "no response within {:?}", self.response_timeout
                );
                false
            }
        }
    }

    async fn subscribe_responses(&self, dongles: &[DongleId]) -> bool {
        for dongle in dongles {
            let topic = response_topic(dongle);
            if let Err(e) = self.mqtt.subscribe(&topic).await {
                error!(%topic, "failed to subscribe for response: {e}");
                return false;
            }
        }
        true
    }

    fn rate_limited(&self) -> bool {
        let last = self.last_dispatch.lock().unwrap();
        matches!(*last, Some(at) if at.elapsed() < RATE_LIMIT)
    }

    fn mark_dispatched(&self) {
        *self.last_dispatch.lock().unwrap() = Some(Instant::now());
    }
}

/// Collapses rapid edits of one entity into a single delayed send.
///
/// Arming a key cancels its outstanding timer; only the last-armed
/// timer can fire. Used for time-of-day fields, where the UI produces
/// a burst of intermediate values while the user scrolls.
pub struct Debouncer {
    delay: Duration,
    armed: Mutex<HashMap<EntityKey, tokio::task::JoinHandle<()>>>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEBOUNCE_DELAY)
    }
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            armed: Mutex::new(HashMap::new()),
        }
    }

    pub fn schedule<F>(&self, key: EntityKey, send: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            send.await;
        });
        if let Some(previous) = self.armed.lock().unwrap().insert(key, task) {
            previous.abort();
        }
    }

    pub fn cancel(&self, key: &EntityKey) {
        if let Some(task) = self.armed.lock().unwrap().remove(key) {
            task.abort();
        }
    }

    pub fn cancel_all(&self) {
        for (_, task) in self.armed.lock().unwrap().drain() {
            task.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
