//! In-memory store, for tests and ephemeral deployments.
//!
//! History is bounded per device: once a device holds `record_limit`
//! records, each append drops its oldest one. Use the redb backend when the
//! full log must be kept.

use std::collections::{HashMap, VecDeque};

use crate::types::{email_key, Account, DeviceRecord, Record, RecordKind};
use crate::{DeviceStore, RecordStore, Result};
use dashmap::DashMap;
use parking_lot::RwLock;

/// Records kept per device by default.
pub const DEFAULT_RECORDS_PER_DEVICE: usize = 1000;

/// Volatile implementation of [`DeviceStore`] and [`RecordStore`].
pub struct MemoryStore {
    devices: DashMap<String, DeviceRecord>,
    accounts: DashMap<i64, Account>,
    records: RwLock<HashMap<String, VecDeque<Record>>>,
    record_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_record_limit(DEFAULT_RECORDS_PER_DEVICE)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record_limit(record_limit: usize) -> Self {
        Self {
            devices: DashMap::new(),
            accounts: DashMap::new(),
            records: RwLock::new(HashMap::new()),
            record_limit: record_limit.max(1),
        }
    }

    /// Records currently retained across all devices.
    pub fn record_count(&self) -> usize {
        self.records.read().values().map(VecDeque::len).sum()
    }
}

impl DeviceStore for MemoryStore {
    fn load_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.get(device_id).map(|d| d.clone()))
    }

    fn save_device(&self, record: &DeviceRecord) -> Result<()> {
        self.devices
            .insert(record.device_id.clone(), record.clone());
        Ok(())
    }

    fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let mut devices: Vec<DeviceRecord> =
            self.devices.iter().map(|d| d.value().clone()).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    fn save_account(&self, account: &Account) -> Result<()> {
        self.accounts.insert(account.id, account.clone());
        Ok(())
    }

    fn find_account_by_short_id(&self, short_id: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .iter()
            .find(|a| a.short_id == short_id)
            .map(|a| a.value().clone()))
    }

    fn find_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let key = email_key(email);
        Ok(self
            .accounts
            .iter()
            .find(|a| email_key(&a.email) == key)
            .map(|a| a.value().clone()))
    }

    fn find_account_by_id(&self, account_id: i64) -> Result<Option<Account>> {
        Ok(self.accounts.get(&account_id).map(|a| a.clone()))
    }
}

impl RecordStore for MemoryStore {
    fn append(&self, record: Record) -> Result<()> {
        let mut records = self.records.write();
        let log = records.entry(record.device_id.clone()).or_default();
        if log.len() >= self.record_limit {
            log.pop_front();
        }
        log.push_back(record);
        Ok(())
    }

    fn recent(
        &self,
        device_id: &str,
        kind: Option<RecordKind>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let records = self.records.read();
        let Some(log) = records.get(device_id) else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .rev()
            .filter(|r| kind.map_or(true, |k| r.kind == k))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_account_lookups() {
        let store = MemoryStore::new();
        store
            .save_account(&Account::new(1, "ABC123", "Owner@Example.com"))
            .unwrap();

        assert_eq!(store.find_account_by_short_id("ABC123").unwrap().unwrap().id, 1);
        assert!(store.find_account_by_short_id("abc123").unwrap().is_none());
        assert_eq!(
            store
                .find_account_by_email("owner@example.com")
                .unwrap()
                .unwrap()
                .id,
            1
        );
        assert!(store.find_account_by_id(2).unwrap().is_none());
    }

    #[test]
    fn test_recent_is_newest_first_and_filtered() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append(Record::new("board1", RecordKind::SensorReading, json!({ "i": i })))
                .unwrap();
        }
        store
            .append(Record::new("board1", RecordKind::Heartbeat, json!({})))
            .unwrap();
        store
            .append(Record::new("board2", RecordKind::SensorReading, json!({})))
            .unwrap();

        let readings = store
            .recent("board1", Some(RecordKind::SensorReading), 2)
            .unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].data["i"], 4);
        assert_eq!(readings[1].data["i"], 3);

        assert_eq!(store.recent("board1", None, 10).unwrap().len(), 6);
        assert_eq!(store.record_count(), 7);
    }

    #[test]
    fn test_history_is_bounded_per_device() {
        let store = MemoryStore::with_record_limit(3);
        for i in 0..10 {
            store
                .append(Record::new("chatty", RecordKind::Heartbeat, json!({ "i": i })))
                .unwrap();
        }
        store
            .append(Record::new("quiet", RecordKind::Heartbeat, json!({})))
            .unwrap();

        let kept = store.recent("chatty", None, 10).unwrap();
        let seen: Vec<i64> = kept.iter().map(|r| r.data["i"].as_i64().unwrap()).collect();
        assert_eq!(seen, vec![9, 8, 7]);
        assert_eq!(store.recent("quiet", None, 10).unwrap().len(), 1);
        assert_eq!(store.record_count(), 4);
    }

    #[test]
    fn test_devices_for_account() {
        let store = MemoryStore::new();
        for (id, account) in [("a", Some(1)), ("b", Some(2)), ("c", Some(1)), ("d", None)] {
            store
                .save_device(&DeviceRecord {
                    device_id: id.to_string(),
                    account_id: account,
                    ..Default::default()
                })
                .unwrap();
        }

        let ids: Vec<String> = store
            .list_devices_for_account(1)
            .unwrap()
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
    }
}
