//! Persistence collaborator for the fieldlink gateway.
//!
//! The protocol core only needs two narrow capabilities:
//! - [`DeviceStore`]: key/value access to devices and owning accounts
//! - [`RecordStore`]: an append-only log of commands and telemetry
//!
//! Both are implemented by [`MemoryStore`] and, persistently, by [`RedbStore`].

pub mod error;
pub mod memory;
pub mod redb_store;
pub mod types;

use fieldlink_core::config::StorageSettings;
use std::sync::Arc;

pub use error::{Error, Result};
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use types::{email_key, Account, DeviceRecord, DeviceUpdate, Record, RecordKind};

/// Key/value access to devices and accounts.
pub trait DeviceStore: Send + Sync {
    fn load_device(&self, device_id: &str) -> Result<Option<DeviceRecord>>;

    /// Insert or replace a device record.
    fn save_device(&self, record: &DeviceRecord) -> Result<()>;

    fn list_devices(&self) -> Result<Vec<DeviceRecord>>;

    fn list_devices_for_account(&self, account_id: i64) -> Result<Vec<DeviceRecord>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .filter(|d| d.account_id == Some(account_id))
            .collect())
    }

    fn save_account(&self, account: &Account) -> Result<()>;

    fn find_account_by_short_id(&self, short_id: &str) -> Result<Option<Account>>;

    fn find_account_by_email(&self, email: &str) -> Result<Option<Account>>;

    fn find_account_by_id(&self, account_id: i64) -> Result<Option<Account>>;
}

/// Append-only record log.
pub trait RecordStore: Send + Sync {
    fn append(&self, record: Record) -> Result<()>;

    /// Most recent records for a device, newest first. `kind = None` returns all kinds.
    fn recent(
        &self,
        device_id: &str,
        kind: Option<RecordKind>,
        limit: usize,
    ) -> Result<Vec<Record>>;
}

/// A store implementing both capabilities.
pub trait GatewayStore: DeviceStore + RecordStore {}

impl<T: DeviceStore + RecordStore> GatewayStore for T {}

/// Open the backend named in the settings.
pub fn open_store(settings: &StorageSettings) -> Result<Arc<dyn GatewayStore>> {
    match settings.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "redb" => Ok(Arc::new(RedbStore::open(&settings.path)?)),
        other => Err(Error::InvalidInput(format!(
            "Unknown storage backend: {}",
            other
        ))),
    }
}
