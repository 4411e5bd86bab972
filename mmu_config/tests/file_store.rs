use mmu_config::FileStore;
use mmu_traits::{PersistenceStore, StoredValue};
use tempfile::tempdir;

#[test]
fn values_survive_reopen_after_flush() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.toml");

    let mut store = FileStore::open(&path).unwrap();
    store.set("mmu_state_filament_pos", StoredValue::Int(10));
    store.set("mmu_calibration_bowden_lengths", StoredValue::List(vec![612.3, -1.0]));
    store.set("ratio", StoredValue::Float(0.98));
    assert!(store.is_dirty());
    store.flush().unwrap();
    assert!(!store.is_dirty());
    assert!(!path.with_extension("new").exists());

    let reopened = FileStore::open(&path).unwrap();
    assert_eq!(
        reopened.get("mmu_state_filament_pos", StoredValue::Int(-1)),
        StoredValue::Int(10)
    );
    assert_eq!(
        reopened.get("mmu_calibration_bowden_lengths", StoredValue::List(vec![])),
        StoredValue::List(vec![612.3, -1.0])
    );
    assert_eq!(reopened.get("ratio", StoredValue::Float(0.0)), StoredValue::Float(0.98));
}

#[test]
fn unflushed_values_are_not_durable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.toml");
    let mut store = FileStore::open(&path).unwrap();
    store.set("mmu_state_filament_pos", StoredValue::Int(-1));
    drop(store);
    assert!(!path.exists());
}

#[test]
fn missing_keys_return_the_default() {
    let dir = tempdir().unwrap();
    let store = FileStore::open(dir.path().join("state.toml")).unwrap();
    assert_eq!(store.get("absent", StoredValue::Int(7)), StoredValue::Int(7));
}

#[test]
fn corrupt_state_file_is_reported() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.toml");
    std::fs::write(&path, "not = [valid").unwrap();
    let err = FileStore::open(&path).unwrap_err();
    assert!(err.to_string().contains("parse state file"));
}
