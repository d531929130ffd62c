//! Integration tests for checkpoint persistence
//!
//! Every behavioural test runs against all three backends.

use serde_json::json;
use std::sync::Arc;
use std::thread;
use tempfile::{tempdir, TempDir};

use invoice_flow::engine::checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, FileFormat, MemoryCheckpointStore,
};
use invoice_flow::engine::checkpoint_sqlite::SqliteCheckpointStore;
use invoice_flow::{FlowError, StateRecord};

/// A store plus whatever keeps its backing files alive
struct Backend {
    name: &'static str,
    store: Arc<dyn CheckpointStore>,
    _dir: Option<TempDir>,
}

fn backends() -> Vec<Backend> {
    let file_dir = tempdir().unwrap();
    let msgpack_dir = tempdir().unwrap();
    let sqlite_dir = tempdir().unwrap();

    vec![
        Backend {
            name: "memory",
            store: Arc::new(MemoryCheckpointStore::new()),
            _dir: None,
        },
        Backend {
            name: "file-json",
            store: Arc::new(FileCheckpointStore::new(file_dir.path()).unwrap()),
            _dir: Some(file_dir),
        },
        Backend {
            name: "file-msgpack",
            store: Arc::new(FileCheckpointStore::msgpack(msgpack_dir.path()).unwrap()),
            _dir: Some(msgpack_dir),
        },
        Backend {
            name: "sqlite",
            store: Arc::new(
                SqliteCheckpointStore::open(sqlite_dir.path().join("checkpoints.db")).unwrap(),
            ),
            _dir: Some(sqlite_dir),
        },
    ]
}

fn suspended_record(id: &str) -> StateRecord {
    let mut state = StateRecord::from_payload(json!({
        "invoice_id": "INV-001",
        "amount": 1200,
        "lines": [{"sku": "A-1", "qty": 3, "price": 400.0}],
        "note": null
    }));
    state
        .derived_mut("parsed_invoice")
        .insert("amount".to_string(), json!(1200));
    state
        .derived_mut("flags")
        .insert("risk_score".to_string(), json!(0.2));
    state.score = 0.8234567891234567;
    state.decision = "FAILED".to_string();
    state.trace.record("INTAKE: Payload validated and stored");
    state.trace.record("MATCH_TWO_WAY: score=0.82 result=FAILED");
    state.suspend(id, "PAUSED_FOR_HITL");
    state
}

// ============================================================================
// Checkpoint Creation
// ============================================================================

#[test]
fn test_checkpoint_copies_status() {
    let checkpoint = Checkpoint::new("chk_1", "CHECKPOINT_HITL", suspended_record("chk_1"));

    assert_eq!(checkpoint.status, "PAUSED_FOR_HITL");
    assert_eq!(checkpoint.step, "CHECKPOINT_HITL");
    assert_eq!(checkpoint.created_at, checkpoint.updated_at);
}

#[test]
fn test_checkpoint_with_status() {
    let checkpoint = Checkpoint::new("chk_1", "B", suspended_record("chk_1")).with_status("CLAIMED");

    assert_eq!(checkpoint.status, "CLAIMED");
    assert_eq!(checkpoint.state.status, "PAUSED_FOR_HITL");
}

#[test]
fn test_checkpoint_json_encoding() {
    let checkpoint = Checkpoint::new("chk_1", "B", suspended_record("chk_1"));

    let restored = Checkpoint::from_json(&checkpoint.to_json().unwrap()).unwrap();
    assert_eq!(restored, checkpoint);
}

#[test]
fn test_checkpoint_msgpack_encoding() {
    let checkpoint = Checkpoint::new("chk_1", "B", suspended_record("chk_1"));

    let restored = Checkpoint::from_bytes(&checkpoint.to_bytes().unwrap()).unwrap();
    assert_eq!(restored, checkpoint);
}

// ============================================================================
// Save / Load (all backends)
// ============================================================================

#[test]
fn test_save_load_round_trip() {
    for backend in backends() {
        let checkpoint = Checkpoint::new("x1", "B", suspended_record("x1"));
        backend.store.save(&checkpoint).unwrap();

        let loaded = backend.store.load("x1").unwrap();
        assert_eq!(loaded, checkpoint, "backend {}", backend.name);
        assert_eq!(loaded.state.score, 0.8234567891234567, "backend {}", backend.name);
    }
}

#[test]
fn test_non_finite_score_round_trip() {
    for backend in backends() {
        for (id, score) in [("nan", f64::NAN), ("inf", f64::INFINITY), ("neg", f64::NEG_INFINITY)] {
            let mut record = suspended_record(id);
            record.score = score;
            backend.store.save(&Checkpoint::new(id, "B", record)).unwrap();

            let loaded = backend.store.load(id).unwrap().state.score;
            assert!(
                loaded.to_bits() == score.to_bits() || (score.is_nan() && loaded.is_nan()),
                "backend {}: {} loaded as {}",
                backend.name,
                score,
                loaded
            );
        }
    }
}

#[test]
fn test_load_missing_is_not_found() {
    for backend in backends() {
        let err = backend.store.load("missing").unwrap_err();
        assert!(
            matches!(err, FlowError::NotFound(ref id) if id == "missing"),
            "backend {}: {:?}",
            backend.name,
            err
        );
    }
}

#[test]
fn test_load_state() {
    for backend in backends() {
        let record = suspended_record("x1");
        backend
            .store
            .save(&Checkpoint::new("x1", "B", record.clone()))
            .unwrap();

        assert_eq!(backend.store.load_state("x1").unwrap(), record, "backend {}", backend.name);
    }
}

#[test]
fn test_overwrite_replaces_record() {
    for backend in backends() {
        let first = Checkpoint::new("x1", "B", suspended_record("x1"));
        backend.store.save(&first).unwrap();

        let mut replacement = StateRecord::from_payload(json!({"invoice_id": "INV-002"}));
        replacement.suspend("x1", "PAUSED_AGAIN");
        let second = Checkpoint::new("x1", "C", replacement.clone());
        backend.store.save(&second).unwrap();

        let loaded = backend.store.load("x1").unwrap();
        assert_eq!(loaded.state, replacement, "backend {}", backend.name);
        assert_eq!(loaded.step, "C");
        assert_eq!(loaded.status, "PAUSED_AGAIN");
        assert!(loaded.state.derived.is_empty(), "no merge with the previous record");
        assert_eq!(backend.store.list(None).unwrap().len(), 1);
    }
}

#[test]
fn test_save_is_idempotent() {
    for backend in backends() {
        let checkpoint = Checkpoint::new("x1", "B", suspended_record("x1"));
        backend.store.save(&checkpoint).unwrap();
        backend.store.save(&checkpoint).unwrap();

        assert_eq!(backend.store.load("x1").unwrap(), checkpoint, "backend {}", backend.name);
    }
}

#[test]
fn test_created_at_is_write_once() {
    for backend in backends() {
        let first = Checkpoint::new("x1", "B", suspended_record("x1"));
        backend.store.save(&first).unwrap();

        thread::sleep(std::time::Duration::from_millis(5));
        let second = Checkpoint::new("x1", "B", suspended_record("x1"));
        assert!(second.created_at > first.created_at);
        backend.store.save(&second).unwrap();

        let loaded = backend.store.load("x1").unwrap();
        assert_eq!(loaded.created_at, first.created_at, "backend {}", backend.name);
        assert_eq!(loaded.updated_at, second.updated_at, "backend {}", backend.name);
    }
}

// ============================================================================
// Status / List / Delete (all backends)
// ============================================================================

#[test]
fn test_set_status_updates_index_only() {
    for backend in backends() {
        backend
            .store
            .save(&Checkpoint::new("x1", "B", suspended_record("x1")))
            .unwrap();
        backend.store.set_status("x1", "CLAIMED").unwrap();

        let loaded = backend.store.load("x1").unwrap();
        assert_eq!(loaded.status, "CLAIMED", "backend {}", backend.name);
        assert_eq!(loaded.state.status, "PAUSED_FOR_HITL", "backend {}", backend.name);
    }
}

#[test]
fn test_set_status_missing_is_not_found() {
    for backend in backends() {
        assert!(
            matches!(backend.store.set_status("nope", "CLAIMED"), Err(FlowError::NotFound(_))),
            "backend {}",
            backend.name
        );
    }
}

#[test]
fn test_claim_is_compare_and_set() {
    for backend in backends() {
        backend
            .store
            .save(&Checkpoint::new("x1", "B", suspended_record("x1")))
            .unwrap();

        assert!(backend.store.claim("x1", "CLAIMED").unwrap(), "backend {}", backend.name);
        assert!(!backend.store.claim("x1", "CLAIMED").unwrap(), "backend {}", backend.name);

        let loaded = backend.store.load("x1").unwrap();
        assert_eq!(loaded.status, "CLAIMED", "backend {}", backend.name);
        assert_eq!(loaded.state.status, "PAUSED_FOR_HITL", "backend {}", backend.name);

        assert!(
            matches!(backend.store.claim("nope", "CLAIMED"), Err(FlowError::NotFound(_))),
            "backend {}",
            backend.name
        );
    }
}

#[test]
fn test_concurrent_claims_have_one_winner() {
    for backend in backends() {
        backend
            .store
            .save(&Checkpoint::new("x1", "B", suspended_record("x1")))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&backend.store);
                thread::spawn(move || store.claim("x1", "CLAIMED").unwrap())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1, "backend {}", backend.name);
        assert_eq!(backend.store.load("x1").unwrap().status, "CLAIMED");
    }
}

#[test]
fn test_list_filters_by_status() {
    for backend in backends() {
        for id in ["a1", "a2", "a3"] {
            backend
                .store
                .save(&Checkpoint::new(id, "B", suspended_record(id)))
                .unwrap();
            thread::sleep(std::time::Duration::from_millis(2));
        }
        backend.store.set_status("a2", "CLAIMED").unwrap();

        let all: Vec<String> = backend
            .store
            .list(None)
            .unwrap()
            .into_iter()
            .map(|s| s.checkpoint_id)
            .collect();
        assert_eq!(all, ["a1", "a2", "a3"], "backend {}", backend.name);

        let paused: Vec<String> = backend
            .store
            .list(Some("PAUSED_FOR_HITL"))
            .unwrap()
            .into_iter()
            .map(|s| s.checkpoint_id)
            .collect();
        assert_eq!(paused, ["a1", "a3"], "backend {}", backend.name);

        let claimed = backend.store.list(Some("CLAIMED")).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].step, "B");
    }
}

#[test]
fn test_delete() {
    for backend in backends() {
        backend
            .store
            .save(&Checkpoint::new("x1", "B", suspended_record("x1")))
            .unwrap();

        assert!(backend.store.delete("x1").unwrap(), "backend {}", backend.name);
        assert!(!backend.store.delete("x1").unwrap(), "backend {}", backend.name);
        assert!(matches!(backend.store.load("x1"), Err(FlowError::NotFound(_))));
    }
}

#[test]
fn test_concurrent_distinct_ids() {
    for backend in backends() {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&backend.store);
                thread::spawn(move || {
                    let id = format!("chk_{}", i);
                    let checkpoint = Checkpoint::new(id.as_str(), "B", suspended_record(&id));
                    store.save(&checkpoint).unwrap();
                    assert_eq!(store.load(&id).unwrap(), checkpoint);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(backend.store.list(None).unwrap().len(), 8, "backend {}", backend.name);
    }
}

// ============================================================================
// File Store
// ============================================================================

#[test]
fn test_file_store_layout() {
    let dir = tempdir().unwrap();
    let json_store = FileCheckpointStore::new(dir.path()).unwrap();
    let msgpack_store = FileCheckpointStore::with_format(dir.path(), FileFormat::Msgpack).unwrap();

    json_store
        .save(&Checkpoint::new("chk_1", "B", suspended_record("chk_1")))
        .unwrap();
    msgpack_store
        .save(&Checkpoint::new("chk_2", "B", suspended_record("chk_2")))
        .unwrap();

    assert!(dir.path().join("chk_1.json").exists());
    assert!(dir.path().join("chk_2.msgpack").exists());

    // Each format only sees its own files
    assert_eq!(json_store.list(None).unwrap().len(), 1);
    assert_eq!(msgpack_store.list(None).unwrap().len(), 1);
}

#[test]
fn test_file_store_corrupt_file_is_storage_error() {
    let dir = tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path()).unwrap();
    std::fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();

    assert!(matches!(store.load("broken"), Err(FlowError::Storage(_))));
}

#[test]
fn test_file_save_replaces_corrupt_file() {
    let dir = tempdir().unwrap();
    let store = FileCheckpointStore::new(dir.path()).unwrap();
    std::fs::write(dir.path().join("x1.json"), b"garbage").unwrap();

    let checkpoint = Checkpoint::new("x1", "B", suspended_record("x1"));
    store.save(&checkpoint).unwrap();

    assert_eq!(store.load("x1").unwrap(), checkpoint);
    assert_eq!(store.list(None).unwrap().len(), 1);
}

// ============================================================================
// SQLite Store
// ============================================================================

#[test]
fn test_sqlite_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoints.db");
    let checkpoint = Checkpoint::new("chk_001", "CHECKPOINT_HITL", suspended_record("chk_001"));

    {
        let store = SqliteCheckpointStore::open(&path).unwrap();
        store.save(&checkpoint).unwrap();
    }

    let reopened = SqliteCheckpointStore::open(&path).unwrap();
    assert_eq!(reopened.load("chk_001").unwrap(), checkpoint);
}

#[test]
fn test_sqlite_creates_parent_directory() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("db").join("checkpoints.db");

    let store = SqliteCheckpointStore::open(&path).unwrap();
    store
        .save(&Checkpoint::new("chk_1", "B", suspended_record("chk_1")))
        .unwrap();
    assert!(path.exists());
}

#[test]
fn test_sqlite_in_memory() {
    let store = SqliteCheckpointStore::in_memory().unwrap();
    let checkpoint = Checkpoint::new("chk_1", "B", suspended_record("chk_1"));

    store.save(&checkpoint).unwrap();
    assert_eq!(store.load("chk_1").unwrap(), checkpoint);
}
