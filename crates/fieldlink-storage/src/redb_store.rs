//! Persistent store using redb.
//!
//! All values are stored as JSON strings. Accounts are indexed by short id
//! and normalized email; records are keyed by `(device_id, sequence)` so a
//! device's history is a single contiguous range.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::types::{email_key, Account, DeviceRecord, Record, RecordKind};
use crate::{DeviceStore, Error, RecordStore, Result};

// Accounts table: key = account id, value = Account (JSON)
const ACCOUNTS_TABLE: TableDefinition<i64, &str> = TableDefinition::new("accounts");

// Short id index: key = short id, value = account id
const ACCOUNT_SHORT_IDS_TABLE: TableDefinition<&str, i64> =
    TableDefinition::new("account_short_ids");

// Email index: key = normalized email, value = account id
const ACCOUNT_EMAILS_TABLE: TableDefinition<&str, i64> = TableDefinition::new("account_emails");

// Devices table: key = device_id, value = DeviceRecord (JSON)
const DEVICES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("devices");

// Records table: key = (device_id, sequence), value = Record (JSON)
const RECORDS_TABLE: TableDefinition<(&str, u64), &str> = TableDefinition::new("records");

// Counters: key = counter name, value = last issued value
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const RECORD_SEQ_KEY: &str = "record_seq";

/// redb-backed implementation of [`DeviceStore`] and [`RecordStore`].
pub struct RedbStore {
    db: Arc<Database>,
    path: String,
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = if path_ref.exists() {
            Database::open(path_ref)?
        } else {
            Database::create(path_ref)?
        };

        // Make sure every table exists so read transactions never fail on a fresh file.
        let write_txn = db.begin_write()?;
        {
            let _accounts = write_txn.open_table(ACCOUNTS_TABLE)?;
            let _short_ids = write_txn.open_table(ACCOUNT_SHORT_IDS_TABLE)?;
            let _emails = write_txn.open_table(ACCOUNT_EMAILS_TABLE)?;
            let _devices = write_txn.open_table(DEVICES_TABLE)?;
            let _records = write_txn.open_table(RECORDS_TABLE)?;
            let _meta = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        debug!(path = %path_ref.display(), "Opened redb store");
        Ok(Self {
            db: Arc::new(db),
            path: path_ref.to_string_lossy().to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn account_by_index(
        &self,
        index: TableDefinition<&str, i64>,
        key: &str,
    ) -> Result<Option<Account>> {
        let read_txn = self.db.begin_read()?;
        let index_table = read_txn.open_table(index)?;
        let account_id = match index_table.get(key)? {
            Some(value) => value.value(),
            None => return Ok(None),
        };

        let accounts = read_txn.open_table(ACCOUNTS_TABLE)?;
        match accounts.get(account_id)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }
}

/// Drop `key` from an account index, unless another account owns it by now.
fn remove_index_entry(
    index: &mut redb::Table<'_, &'static str, i64>,
    key: &str,
    account_id: i64,
) -> Result<()> {
    let owned = index.get(key)?.map(|v| v.value()) == Some(account_id);
    if owned {
        index.remove(key)?;
    }
    Ok(())
}

impl DeviceStore for RedbStore {
    fn load_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEVICES_TABLE)?;

        match table.get(device_id)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }

    fn save_device(&self, record: &DeviceRecord) -> Result<()> {
        if record.device_id.is_empty() {
            return Err(Error::InvalidInput("device_id must not be empty".to_string()));
        }
        let json = serde_json::to_string(record)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(DEVICES_TABLE)?;
            table.insert(record.device_id.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEVICES_TABLE)?;

        let mut devices = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            if let Ok(record) = serde_json::from_str::<DeviceRecord>(value.value()) {
                devices.push(record);
            }
        }
        Ok(devices)
    }

    fn save_account(&self, account: &Account) -> Result<()> {
        let json = serde_json::to_string(account)?;
        let email = email_key(&account.email);

        let write_txn = self.db.begin_write()?;
        {
            let mut accounts = write_txn.open_table(ACCOUNTS_TABLE)?;
            let previous: Option<Account> = match accounts.get(account.id)? {
                Some(value) => serde_json::from_str(value.value()).ok(),
                None => None,
            };
            accounts.insert(account.id, json.as_str())?;

            let mut short_ids = write_txn.open_table(ACCOUNT_SHORT_IDS_TABLE)?;
            let mut emails = write_txn.open_table(ACCOUNT_EMAILS_TABLE)?;

            // Index rows left by a previous short id or email must not resolve anymore.
            if let Some(previous) = previous {
                if previous.short_id != account.short_id {
                    remove_index_entry(&mut short_ids, &previous.short_id, account.id)?;
                }
                let previous_email = email_key(&previous.email);
                if previous_email != email {
                    remove_index_entry(&mut emails, &previous_email, account.id)?;
                }
            }

            short_ids.insert(account.short_id.as_str(), account.id)?;
            emails.insert(email.as_str(), account.id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn find_account_by_short_id(&self, short_id: &str) -> Result<Option<Account>> {
        self.account_by_index(ACCOUNT_SHORT_IDS_TABLE, short_id)
    }

    fn find_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        self.account_by_index(ACCOUNT_EMAILS_TABLE, &email_key(email))
    }

    fn find_account_by_id(&self, account_id: i64) -> Result<Option<Account>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS_TABLE)?;

        match table.get(account_id)? {
            Some(value) => Ok(Some(serde_json::from_str(value.value())?)),
            None => Ok(None),
        }
    }
}

impl RecordStore for RedbStore {
    fn append(&self, record: Record) -> Result<()> {
        let json = serde_json::to_string(&record)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let seq = meta.get(RECORD_SEQ_KEY)?.map(|v| v.value()).unwrap_or(0) + 1;
            meta.insert(RECORD_SEQ_KEY, seq)?;

            let mut records = write_txn.open_table(RECORDS_TABLE)?;
            records.insert((record.device_id.as_str(), seq), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn recent(
        &self,
        device_id: &str,
        kind: Option<RecordKind>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RECORDS_TABLE)?;

        let mut records = Vec::new();
        for result in table.range((device_id, 0u64)..=(device_id, u64::MAX))?.rev() {
            if records.len() >= limit {
                break;
            }
            let (_key, value) = result?;
            let record: Record = match serde_json::from_str(value.value()) {
                Ok(record) => record,
                Err(_) => continue,
            };
            if kind.map_or(true, |k| record.kind == k) {
                records.push(record);
            }
        }
        Ok(records)
    }
}
