use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::warn;

pub enum MessageLogMode {
    /// Every inbound message plus every outbound command.
    Full,
    /// Outbound commands only.
    CommandsOnly,
}

/// NDJSON log of MQTT traffic, for protocol debugging.
pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { mode, file })
    }

    pub fn log_inbound(&mut self, topic: &str, payload: &[u8]) {
        if matches!(self.mode, MessageLogMode::CommandsOnly) {
            return;
        }
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "rx",
            "topic": topic,
            "body": body_value(payload),
        });
        self.write_line(&entry);
    }

    pub fn log_command(&mut self, topic: &str, payload: &str) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "cmd",
            "topic": topic,
            "body": body_value(payload.as_bytes()),
        });
        self.write_line(&entry);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write log entry: {e}");
        }
    }
}

fn body_value(payload: &[u8]) -> Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).into_owned()))
}
