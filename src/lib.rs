mod combined;
mod coordinator;
mod dispatch;
mod error;
mod firmware;
mod logger;
mod mqtt;
mod protocol;
mod schema;
mod state;
mod sync;
mod types;

pub use combined::{Aggregate, combined_value};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use dispatch::{CommandDispatcher, Debouncer, Revertible};
pub use error::{Error, Result};
pub use firmware::{
    CHECK_INTERVAL, DEFAULT_CATALOG_URL, OtaStatus, ServerVersions, UpdateClient,
    parse_ota_message,
};
pub use logger::MessageLogMode;
pub use mqtt::MqttBridge;
pub use protocol::{COMMAND_SOURCE, Telegram, decode_telegram};
pub use schema::{Brand, EntityResolver, SettingField};
pub use state::{ChangeEntry, ChangeHistory, EntityStore, FaultLog, FaultRecord};
pub use sync::{SyncEngine, SyncPhase, SyncReport};
pub use types::*;
