use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::types::DongleId;

/// Command origin tag expected by the dongle firmware.
pub const COMMAND_SOURCE: &str = "homeassistant";

pub fn update_topic(dongle: &DongleId) -> String {
    format!("{}/update", dongle.wire_form())
}

pub fn response_topic(dongle: &DongleId) -> String {
    format!("{}/response", dongle.wire_form())
}

pub fn firmware_request_topic(dongle: &DongleId) -> String {
    format!("{}/firmwarecode/request", dongle.wire_form())
}

pub fn firmware_response_topic(dongle: &DongleId) -> String {
    format!("{}/firmwarecode/response", dongle.wire_form())
}

/// Catch-all subscription covering every bank topic of one dongle.
pub fn catch_all_topic(dongle: &DongleId) -> String {
    format!("{}/#", dongle.wire_form())
}

pub fn update_payload(setting: &str, value: &Value) -> String {
    json!({
        "setting": setting,
        "value": value,
        "from": COMMAND_SOURCE,
    })
    .to_string()
}

pub fn batch_update_payload(settings: &[(String, Value)]) -> String {
    let entries: Vec<Value> = settings
        .iter()
        .map(|(setting, value)| json!({ "setting": setting, "value": value }))
        .collect();
    json!({
        "settings": entries,
        "from": COMMAND_SOURCE,
    })
    .to_string()
}

/// First path segment of a topic: the device identity in wire form.
pub fn topic_device(topic: &str) -> Option<&str> {
    topic.split('/').next().filter(|s| !s.is_empty())
}

/// Last path segment of a topic: the bank name.
pub fn topic_bank(topic: &str) -> &str {
    topic.rsplit('/').next().unwrap_or_default()
}

/// Decoded field telegram, with the optional envelope already unwrapped.
#[derive(Debug, Default)]
pub struct Telegram {
    pub serial: Option<String>,
    pub fields: Map<String, Value>,
    pub events: Map<String, Value>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Serialnumber")]
    serial: Option<String>,
    payload: Map<String, Value>,
    #[serde(default)]
    events: Map<String, Value>,
}

/// Decode a bank telegram. The new format wraps the fields as
/// `{Serialnumber, payload, events}`; the legacy format is the flat
/// field object. This is the single point where the two shapes are
/// told apart.
pub fn decode_telegram(payload: &[u8]) -> Option<Telegram> {
    if let Ok(envelope) = serde_json::from_slice::<Envelope>(payload) {
        return Some(Telegram {
            serial: envelope.serial,
            fields: envelope.payload,
            events: envelope.events,
        });
    }
    let flat = serde_json::from_slice::<Map<String, Value>>(payload).ok()?;
    Some(Telegram {
        serial: None,
        fields: flat,
        events: Map::new(),
    })
}

/// Unwrap a status message, which uses the same optional envelope but
/// keeps the whole payload as one opaque object.
pub fn decode_status(payload: &[u8]) -> Option<Value> {
    let value = serde_json::from_slice::<Value>(payload).ok()?;
    if let Value::Object(map) = &value
        && map.contains_key("Serialnumber")
        && let Some(inner) = map.get("payload")
    {
        return Some(inner.clone());
    }
    Some(value)
}
