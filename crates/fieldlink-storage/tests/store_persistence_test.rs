//! Store contract tests shared by both backends, plus reopen durability for redb.

use fieldlink_storage::{
    Account, DeviceRecord, DeviceStore, DeviceUpdate, GatewayStore, MemoryStore, Record,
    RecordKind, RecordStore, RedbStore,
};
use serde_json::json;

fn exercise_store(store: &dyn GatewayStore) {
    store
        .save_account(&Account::new(1, "SHORT1", "one@example.com"))
        .unwrap();

    let mut device = DeviceRecord::from_update(
        "board1",
        DeviceUpdate {
            account_id: Some(1),
            command_topic: Some("cmd/board1".to_string()),
            response_topic: Some("resp/board1".to_string()),
            ..Default::default()
        },
        100,
    );
    device.touch(200);
    store.save_device(&device).unwrap();

    let loaded = store.load_device("board1").unwrap().unwrap();
    assert!(loaded.online);
    assert_eq!(loaded.last_seen, Some(200));
    assert_eq!(loaded.created_at, 100);
    assert_eq!(store.list_devices_for_account(1).unwrap().len(), 1);

    store
        .append(Record::new("board1", RecordKind::Command, json!({"id": "c1"})))
        .unwrap();
    store
        .append(Record::new("board1", RecordKind::CommandResult, json!({"id": "c1"})))
        .unwrap();

    let results = store
        .recent("board1", Some(RecordKind::CommandResult), 5)
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].data["id"], "c1");
}

#[test]
fn test_memory_store_contract() {
    exercise_store(&MemoryStore::new());
}

#[test]
fn test_redb_store_contract() {
    let dir = tempfile::tempdir().unwrap();
    let store = RedbStore::open(dir.path().join("contract.redb")).unwrap();
    exercise_store(&store);
}

#[test]
fn test_redb_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("reopen.redb");

    {
        let store = RedbStore::open(&path).unwrap();
        store
            .save_account(&Account::new(5, "KEEP", "keep@example.com"))
            .unwrap();
        store
            .append(Record::new("dev", RecordKind::Heartbeat, json!({})))
            .unwrap();
    }

    let store = RedbStore::open(&path).unwrap();
    assert_eq!(store.find_account_by_short_id("KEEP").unwrap().unwrap().id, 5);

    store
        .append(Record::new("dev", RecordKind::Heartbeat, json!({"second": true})))
        .unwrap();
    let records = store.recent("dev", None, 10).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].data["second"], true);
}
