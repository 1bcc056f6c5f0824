use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{Error, Result};

/// Public version catalog for the dongles.
pub const DEFAULT_CATALOG_URL: &str = "https://monitoring.monitormy.solar/version";

/// How often the host should re-check the catalog.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);
const TRIGGER_TIMEOUT: Duration = Duration::from_secs(30);

/// Latest published firmware/UI versions and their release notes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerVersions {
    pub latest_fw_version: Option<String>,
    pub beta_fw_version: Option<String>,
    pub latest_ui_version: Option<String>,
    pub changelog: Option<String>,
    pub changelog_beta: Option<String>,
}

impl ServerVersions {
    /// Release notes for the latest version: the beta changelog when
    /// the latest version is the beta, the stable changelog otherwise.
    pub fn release_notes(&self) -> Option<&str> {
        let on_beta = match (&self.latest_fw_version, &self.beta_fw_version) {
            (Some(latest), Some(beta)) => latest == beta,
            _ => false,
        };
        let notes = if on_beta {
            self.changelog_beta.as_deref()
        } else {
            self.changelog.as_deref()
        };
        notes.filter(|n| !n.is_empty())
    }
}

/// Coordinates the remote firmware-update flow: catalog fetch plus the
/// update trigger against a dongle's local HTTP endpoint. The actual
/// firmware transfer and the WebSocket progress stream stay with the
/// dongle; see [`parse_ota_message`] for the progress frames.
pub struct UpdateClient {
    http: reqwest::Client,
    catalog_url: String,
    cached: Mutex<Option<ServerVersions>>,
}

impl Default for UpdateClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateClient {
    pub fn new() -> Self {
        Self::with_catalog_url(DEFAULT_CATALOG_URL)
    }

    pub fn with_catalog_url(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            catalog_url: url.into(),
            cached: Mutex::new(None),
        }
    }

    /// Fetch the version catalog and refresh the cache.
    pub async fn refresh(&self) -> Result<ServerVersions> {
        debug!(url = %self.catalog_url, "fetching version catalog");
        let versions: ServerVersions = self
            .http
            .get(&self.catalog_url)
            .timeout(CATALOG_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        *self.cached.lock().unwrap() = Some(versions.clone());
        Ok(versions)
    }

    /// Last successfully fetched catalog, if any.
    pub fn cached(&self) -> Option<ServerVersions> {
        self.cached.lock().unwrap().clone()
    }

    /// Tell the dongle at `dongle_ip` to install `version`. The dongle
    /// reboots into its updater on acceptance; progress arrives over
    /// its WebSocket.
    pub async fn perform_update(&self, dongle_ip: &str, version: &str) -> Result<()> {
        let url = format!("http://{dongle_ip}/api/perform-update");
        info!(%url, version, "triggering firmware update");
        let response = self
            .http
            .post(&url)
            .timeout(TRIGGER_TIMEOUT)
            .json(&serde_json::json!({
                "update": "FW_update",
                "fwVersion": version,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpdateRejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// One frame of the dongle's OTA progress stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaStatus {
    Progress(u8),
    Complete,
    Failed(String),
    Info(String),
}

/// Classify a WebSocket message from the dongle during an update.
/// Returns None for frames that are not `ota_status` events.
pub fn parse_ota_message(raw: &str) -> Option<OtaStatus> {
    let frame: Value = serde_json::from_str(raw).ok()?;
    if frame.get("event").and_then(Value::as_str) != Some("ota_status") {
        return None;
    }
    let data = frame.get("data").and_then(Value::as_str)?.to_string();

    if data.contains("Update complete") || data.contains("rebooting") {
        return Some(OtaStatus::Complete);
    }
    let lowered = data.to_lowercase();
    if lowered.contains("failed") || lowered.contains("error") {
        return Some(OtaStatus::Failed(data));
    }
    if let Some(progress) = parse_progress(&data) {
        return Some(OtaStatus::Progress(progress));
    }
    Some(OtaStatus::Info(data))
}

fn parse_progress(data: &str) -> Option<u8> {
    let rest = &data[data.find("Progress:")? + "Progress:".len()..];
    let digits: String = rest
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse::<u8>().ok().filter(|p| *p <= 100)
}
