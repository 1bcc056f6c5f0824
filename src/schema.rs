use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::debug;

use crate::types::{EntityKind, normalize_segment};

/// Inverter brands the dongles front for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Brand {
    Lux,
    Solis,
    Solax,
    Growatt,
}

impl Brand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Brand::Lux => "Lux",
            Brand::Solis => "Solis",
            Brand::Solax => "Solax",
            Brand::Growatt => "Growatt",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Lux" => Some(Brand::Lux),
            "Solis" => Some(Brand::Solis),
            "Solax" => Some(Brand::Solax),
            "Growatt" => Some(Brand::Growatt),
            _ => None,
        }
    }
}

// Field tables, in the spelling the dongle firmware uses on the wire.
// Telegram keys are matched case-insensitively against these.

const LUX_SENSORS: &[&str] = &[
    "vpv1",
    "vpv2",
    "vpv3",
    "vbat",
    "soc",
    "soh",
    "ppv1",
    "ppv2",
    "ppv3",
    "Pall",
    "pcharge",
    "pdischarge",
    "vacr",
    "vacs",
    "vact",
    "fac",
    "pinv",
    "prec",
    "iinvrms",
    "pf",
    "vepsr",
    "vepss",
    "vepst",
    "feps",
    "peps",
    "seps",
    "ptogrid",
    "ptouser",
    "pload",
    "epv1_day",
    "epv2_day",
    "epv3_day",
    "epv_all",
    "einv_day",
    "erec_day",
    "echg_day",
    "edischg_day",
    "eeps_day",
    "etogrid_day",
    "etouser_day",
    "vbus1",
    "vbus2",
    "tinner",
    "tradiator1",
    "tradiator2",
    "tbat",
    "RunningTime",
    "FaultCode",
    "WarningCode",
    "FaultCode_BMS",
    "WarningCode_BMS",
    "BatStatus_INV",
    "BatParallelNum",
    "BatCapacity",
    "BatCurrent_BMS",
    "MaxCellVolt_BMS",
    "MinCellVolt_BMS",
    "MaxCellTemp_BMS",
    "MinCellTemp_BMS",
    "CycleCnt_BMS",
    "MaxChgCurr",
    "MaxDischgCurr",
    "ChargeVoltRef",
    "DischgCutVolt",
    "uptime",
    "fault_status",
    "warning_status",
];

const LUX_SWITCHES: &[&str] = &[
    "EPS",
    "NeutralDetect",
    "ACCharge",
    "SWSeamlessly",
    "SetToStandby",
    "ForcedDischg",
    "ForcedChg",
    "FeedInGrid",
    "ubPVGridOffEn",
    "ubFastZeroExport",
    "ubMicroGridEn",
    "ubBatShared",
    "ubChgLastEn",
    "TakeLoadTogether",
    "HalfHourACChrStartEn",
];

const LUX_NUMBERS: &[&str] = &[
    "ActivePowerPercentCMD",
    "ChargePowerPercentCMD",
    "DischgPowerPercentCMD",
    "ACChgPowerCMD",
    "ACChgSOCLimit",
    "ChgFirstPowerCMD",
    "ChgFirstSOCLimit",
];

const LUX_TIMES: &[&str] = &[
    "ACChgStart",
    "ACChgEnd",
    "ACChgStart1",
    "ACChgEnd1",
    "ACChgStart2",
    "ACChgEnd2",
    "ChgFirstStart",
    "ChgFirstEnd",
    "ForcedDischgStart",
    "ForcedDischgEnd",
];

const LUX_BUTTONS: &[&str] = &["firmware_update_button", "INVReboot"];

const LUX_SELECTS: &[&str] = &[
    "CTSampleRatio",
    "ClearParallelAlarm",
    "Time0",
    "Time1",
    "Time2",
    "Time3",
];

const SOLIS_SENSORS: &[&str] = &[
    "vpv1", "vpv2", "vbat", "soc", "ppv1", "ppv2", "pcharge", "pdischarge", "fac", "pinv",
    "ptogrid", "ptouser", "etoday", "etotal", "tinner", "uptime",
];

const SOLIS_SWITCHES: &[&str] = &["SelfUse", "FeedInPriority", "BackupMode"];

const SOLIS_NUMBERS: &[&str] = &["ChargeCurrentLimit", "DischargeCurrentLimit", "BackupSOC"];

const SOLAX_SENSORS: &[&str] = &[
    "vpv1", "vpv2", "vbat", "soc", "ppv1", "ppv2", "pgrid", "pbat", "feedin_energy",
    "consume_energy", "temperature", "uptime",
];

const SOLAX_SWITCHES: &[&str] = &["ExportLimitEn", "EPSMute"];

const SOLAX_NUMBERS: &[&str] = &["ExportLimit", "BatteryMinSOC"];

const GROWATT_SENSORS: &[&str] = &[
    "vpv1", "vpv2", "vbat", "soc", "ppv1", "ppv2", "pactogrid", "pactouser", "eactoday",
    "eactotal", "temp1", "uptime",
];

const GROWATT_SWITCHES: &[&str] = &["ACChargeEnable", "ExportLimitEnable"];

const GROWATT_NUMBERS: &[&str] = &["ChargePowerRate", "DischargePowerRate", "StopSOC"];

const EMPTY: &[&str] = &[];

/// Tables for one brand, in the fixed kind-priority order used for
/// resolution: sensor, switch, number, time, button, select.
fn brand_tables(brand: Brand) -> [(EntityKind, &'static [&'static str]); 6] {
    match brand {
        Brand::Lux => [
            (EntityKind::Sensor, LUX_SENSORS),
            (EntityKind::Switch, LUX_SWITCHES),
            (EntityKind::Number, LUX_NUMBERS),
            (EntityKind::Time, LUX_TIMES),
            (EntityKind::Button, LUX_BUTTONS),
            (EntityKind::Select, LUX_SELECTS),
        ],
        Brand::Solis => [
            (EntityKind::Sensor, SOLIS_SENSORS),
            (EntityKind::Switch, SOLIS_SWITCHES),
            (EntityKind::Number, SOLIS_NUMBERS),
            (EntityKind::Time, EMPTY),
            (EntityKind::Button, EMPTY),
            (EntityKind::Select, EMPTY),
        ],
        Brand::Solax => [
            (EntityKind::Sensor, SOLAX_SENSORS),
            (EntityKind::Switch, SOLAX_SWITCHES),
            (EntityKind::Number, SOLAX_NUMBERS),
            (EntityKind::Time, EMPTY),
            (EntityKind::Button, EMPTY),
            (EntityKind::Select, EMPTY),
        ],
        Brand::Growatt => [
            (EntityKind::Sensor, GROWATT_SENSORS),
            (EntityKind::Switch, GROWATT_SWITCHES),
            (EntityKind::Number, GROWATT_NUMBERS),
            (EntityKind::Time, EMPTY),
            (EntityKind::Button, EMPTY),
            (EntityKind::Select, EMPTY),
        ],
    }
}

#[derive(Debug, Clone, Copy)]
struct FieldDef {
    kind: EntityKind,
    /// The dongle's spelling, used when sending commands.
    wire: &'static str,
}

/// A monitored (synchronizable) setting field.
#[derive(Debug, Clone)]
pub struct SettingField {
    /// Normalized name, as used in entity keys and history.
    pub field: String,
    /// The dongle's spelling, as carried in command payloads.
    pub wire: &'static str,
    pub kind: EntityKind,
}

/// Maps raw telegram field names to entity kinds for one brand.
///
/// The map is precomputed once at startup; resolution is a single
/// lookup. Unknown names fall back to sensor and are remembered so the
/// same name is only logged once.
pub struct EntityResolver {
    brand: Brand,
    fields: HashMap<String, FieldDef>,
    unmatched: Mutex<HashSet<String>>,
}

impl EntityResolver {
    pub fn new(brand: Brand) -> Self {
        let mut fields = HashMap::new();
        for (kind, names) in brand_tables(brand) {
            for &name in names {
                // First kind in priority order wins on duplicates.
                fields
                    .entry(normalize_segment(name))
                    .or_insert(FieldDef { kind, wire: name });
            }
        }
        Self {
            brand,
            fields,
            unmatched: Mutex::new(HashSet::new()),
        }
    }

    pub fn brand(&self) -> Brand {
        self.brand
    }

    /// Resolve a raw field name to its entity kind. Unknown names
    /// default to sensor.
    pub fn resolve(&self, field: &str) -> EntityKind {
        let normalized = normalize_segment(field);
        if let Some(def) = self.fields.get(&normalized) {
            return def.kind;
        }
        let mut unmatched = self.unmatched.lock().unwrap();
        if unmatched.insert(normalized) {
            debug!(brand = self.brand.as_str(), field, "unmatched field, defaulting to sensor");
        }
        EntityKind::Sensor
    }

    /// The dongle's spelling for a known field, by normalized name.
    pub fn wire_name(&self, field: &str) -> Option<&'static str> {
        self.fields.get(&normalize_segment(field)).map(|d| d.wire)
    }

    /// All user-mutable settings for this brand, sorted by normalized
    /// name. This is the set the synchronization engine watches.
    pub fn monitored_settings(&self) -> Vec<SettingField> {
        let mut settings: Vec<SettingField> = self
            .fields
            .iter()
            .filter(|(_, def)| def.kind.is_setting())
            .map(|(field, def)| SettingField {
                field: field.clone(),
                wire: def.wire,
                kind: def.kind,
            })
            .collect();
        settings.sort_by(|a, b| a.field.cmp(&b.field));
        settings
    }

    /// How many distinct unresolvable names have been seen.
    pub fn unmatched_count(&self) -> usize {
        self.unmatched.lock().unwrap().len()
    }
}
