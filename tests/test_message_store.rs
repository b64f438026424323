//! Durable message store tests
//!
//! Persistence across reopen, plus property tests for ordering and
//! acknowledgement.

use mgmt_broker::protocol::message_from_value;
use mgmt_broker::store::{Identity, MessageStore, StoreError};
use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

fn open(dir: &TempDir) -> MessageStore {
    MessageStore::open(dir.path()).unwrap()
}

#[test]
fn test_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let session;
    {
        let store = open(&dir);
        store.set_accepted_types(["test", "other"]).unwrap();
        session = store.get_session_id().unwrap();
        for n in 0..3 {
            store
                .add(message_from_value(json!({"type": "test", "n": n})), Some(&session))
                .unwrap();
        }
        store.acknowledge_up_to(1).unwrap();
        store.set_server_uuid(Some("uuid-1")).unwrap();
        store.set_server_sequence(7).unwrap();
        store
            .set_identity(&Identity {
                secure_id: "secure".to_string(),
                insecure_id: Some("42".to_string()),
            })
            .unwrap();
    }

    let store = open(&dir);
    assert_eq!(store.get_session_id().unwrap(), session);
    assert!(store.accepts("other").unwrap());
    assert_eq!(store.get_server_uuid().unwrap().as_deref(), Some("uuid-1"));
    assert_eq!(store.get_server_sequence().unwrap(), 7);
    assert_eq!(store.get_identity().unwrap().unwrap().secure_id, "secure");

    let pending = store.get_pending_messages(None).unwrap();
    let sequences: Vec<u64> = pending.iter().map(|m| m.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);

    // Numbering continues where it left off
    let id = store
        .add(message_from_value(json!({"type": "test"})), Some(&session))
        .unwrap();
    assert_eq!(id.0, 3);
}

#[test]
fn test_dropped_session_stays_dropped_after_reopen() {
    let dir = TempDir::new().unwrap();
    let session;
    {
        let store = open(&dir);
        store.set_accepted_types(["test"]).unwrap();
        session = store.get_session_id().unwrap();
        store.drop_session_ids().unwrap();
    }

    let store = open(&dir);
    let result = store.add(message_from_value(json!({"type": "test"})), Some(&session));
    assert!(matches!(result, Err(StoreError::WrongSession)));
    assert_eq!(store.pending_count(), 0);
}

#[tokio::test]
async fn test_flushed_writes_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let session;
    {
        let store = open(&dir);
        store.set_accepted_types(["test"]).unwrap();
        session = store.get_session_id().unwrap();
        store
            .add(message_from_value(json!({"type": "test"})), Some(&session))
            .unwrap();
        store.flush().await.unwrap();
    }

    let store = open(&dir);
    assert_eq!(store.get_session_id().unwrap(), session);
    assert_eq!(store.pending_count(), 1);
}

proptest! {
    #[test]
    fn prop_pending_order_matches_enqueue_order(count in 1usize..40, acked in 0u64..50) {
        let store = MessageStore::temporary().unwrap();
        store.set_accepted_types(["test"]).unwrap();
        let session = store.get_session_id().unwrap();

        let ids: Vec<u64> = (0..count)
            .map(|n| {
                store
                    .add(message_from_value(json!({"type": "test", "n": n})), Some(&session))
                    .unwrap()
                    .0
            })
            .collect();
        prop_assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

        store.acknowledge_up_to(acked).unwrap();

        let pending = store.get_pending_messages(None).unwrap();
        let expected: Vec<u64> = ids.iter().copied().filter(|id| *id >= acked).collect();
        let actual: Vec<u64> = pending.iter().map(|m| m.sequence).collect();
        prop_assert_eq!(&actual, &expected);
        prop_assert_eq!(store.pending_count(), expected.len());

        for message in &pending {
            prop_assert_eq!(message.payload["n"].as_u64(), Some(message.sequence));
        }
    }
}
