use std::fmt;

use serde_json::Value;

/// Lowercase a field or identity segment and fold `-`/`:` into `_`.
pub(crate) fn normalize_segment(raw: &str) -> String {
    raw.to_lowercase().replace(['-', ':'], "_")
}

/// Dongle identity, stored in its entity form (`dongle_aa_bb_cc_dd_ee_ff`).
///
/// Dongles spell their identity two ways: entity ids use the lowercase
/// underscore form, while MQTT topics use `dongle-AA:BB:CC:DD:EE:FF` with
/// the MAC segment uppercased. The two spellings must round-trip exactly,
/// so the wire form is reconstructed rather than stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DongleId(String);

impl DongleId {
    /// Accepts any spelling (configured, wire, or entity form).
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(normalize_segment(raw.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Topic spelling: prefix kept, MAC segments uppercased and joined
    /// with `:` (`dongle_aa_bb_cc_dd_ee_ff` -> `dongle-AA:BB:CC:DD:EE:FF`).
    pub fn wire_form(&self) -> String {
        let mut parts = self.0.split('_');
        let prefix = parts.next().unwrap_or_default();
        let mac: Vec<&str> = parts.collect();
        if mac.is_empty() {
            return prefix.to_string();
        }
        format!("{prefix}-{}", mac.join(":").to_uppercase())
    }
}

impl fmt::Display for DongleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Sensor,
    BinarySensor,
    Switch,
    Number,
    Time,
    Button,
    Select,
    Update,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Sensor => "sensor",
            EntityKind::BinarySensor => "binary_sensor",
            EntityKind::Switch => "switch",
            EntityKind::Number => "number",
            EntityKind::Time => "time",
            EntityKind::Button => "button",
            EntityKind::Select => "select",
            EntityKind::Update => "update",
        }
    }

    /// Kinds that represent user-mutable settings eligible for
    /// cross-dongle synchronization.
    pub fn is_setting(&self) -> bool {
        matches!(
            self,
            EntityKind::Switch | EntityKind::Number | EntityKind::Select | EntityKind::Time
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceScope {
    Dongle(DongleId),
    Combined,
}

impl fmt::Display for DeviceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceScope::Dongle(id) => f.write_str(id.as_str()),
            DeviceScope::Combined => f.write_str("combined"),
        }
    }
}

/// Globally unique address of one piece of observed or controllable
/// state: `(kind, device, field)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub device: DeviceScope,
    pub field: String,
}

impl EntityKey {
    pub fn dongle(kind: EntityKind, id: &DongleId, field: &str) -> Self {
        Self {
            kind,
            device: DeviceScope::Dongle(id.clone()),
            field: normalize_segment(field),
        }
    }

    pub fn combined(kind: EntityKind, field: &str) -> Self {
        Self {
            kind,
            device: DeviceScope::Combined,
            field: normalize_segment(field),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}_{}", self.kind, self.device, self.field)
    }
}

/// Notifications emitted to callbacks registered on the coordinator.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A telegram for one register bank was processed.
    BankUpdated { dongle: DongleId, bank: String },
    /// A dongle answered the firmware-code handshake.
    FirmwareCode { dongle: DongleId, code: String },
    /// A telegram carried the installed firmware version.
    FirmwareVersion { dongle: DongleId, version: String },
    /// A telegram carried the installed UI version.
    UiVersion { dongle: DongleId, version: String },
}

/// What to do with a field update whose value is JSON null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullValuePolicy {
    /// Log and keep the previous value.
    #[default]
    Ignore,
    /// Remove the entity key from the state map.
    Clear,
}

/// Tie-break for the majority vote during divergence resolution.
/// Policy, not contract: pick what the installation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    #[default]
    FirstObserved,
    LastObserved,
}

/// Per-dongle configuration: identity plus the optional LAN address
/// used by the firmware-update flow.
#[derive(Debug, Clone)]
pub struct DongleConfig {
    pub id: DongleId,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    Fault,
    Warning,
}

impl FaultKind {
    pub fn entity_field(&self) -> &'static str {
        match self {
            FaultKind::Fault => "fault_status",
            FaultKind::Warning => "warning_status",
        }
    }

    pub fn clear_label(&self) -> &'static str {
        match self {
            FaultKind::Fault => "No Fault",
            FaultKind::Warning => "No Warning",
        }
    }

    pub fn default_description(&self) -> &'static str {
        match self {
            FaultKind::Fault => "Unknown Fault",
            FaultKind::Warning => "Unknown Warning",
        }
    }
}

/// Convert a stored value to the boolean reading used by binary-style
/// aggregation (`true`/non-zero/`"on"` count as on).
pub(crate) fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.to_lowercase().as_str() {
            "on" | "true" | "1" => Some(true),
            "off" | "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
