use super::*;
use crate::store::{MemoryStore, MockStateStore};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

fn fast_config() -> ManagerConfig {
    ManagerConfig {
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        retry_jitter: false,
        ..ManagerConfig::default()
    }
}

fn manager_with(store: impl StateStore + 'static, config: ManagerConfig) -> SessionStateManager {
    SessionStateManager::with_config(Arc::new(store), config)
}

fn record(session_id: &str, version: Version, fields: Fields) -> StateRecord {
    StateRecord {
        version,
        fields,
        ..StateRecord::empty(session_id)
    }
}

/// Store whose calls never complete
struct StalledStore;

#[async_trait]
impl StateStore for StalledStore {
    async fn get(&self, _: &str) -> StoreResult<Option<StateRecord>> {
        std::future::pending().await
    }

    async fn put(&self, _: &str, _: &Fields, _: Version) -> StoreResult<Version> {
        std::future::pending().await
    }

    async fn delete(&self, _: &str) -> StoreResult<()> {
        std::future::pending().await
    }

    async fn touch(&self, _: &str) -> StoreResult<Session> {
        std::future::pending().await
    }

    async fn session(&self, _: &str) -> StoreResult<Option<Session>> {
        std::future::pending().await
    }

    async fn list_keys(&self) -> StoreResult<Vec<String>> {
        std::future::pending().await
    }

    async fn health_check(&self) -> StoreResult<()> {
        std::future::pending().await
    }
}

#[test]
fn test_config_defaults() {
    let config = ManagerConfig::default();
    assert_eq!(config.max_commit_attempts, 3);
    assert_eq!(config.store_timeout(), Duration::from_secs(5));

    let backoff = config.backoff();
    assert_eq!(backoff.initial_delay, Duration::from_millis(10));
    assert_eq!(backoff.max_delay, Duration::from_millis(200));
}

#[tokio::test]
async fn test_load_missing_session_is_empty() {
    let mgr = SessionStateManager::new(Arc::new(MemoryStore::new()));

    let state = mgr.load("u1").await.unwrap();
    assert_eq!(state.session_id(), "u1");
    assert_eq!(state.version(), 0);
    assert!(state.is_new());
    assert!(state.fields().is_empty());
    assert!(!state.is_dirty());
}

#[tokio::test]
async fn test_first_commit_creates_version_one() {
    let mgr = SessionStateManager::new(Arc::new(MemoryStore::new()));

    let mut state = mgr.load("u1").await.unwrap();
    mgr.update(&mut state, Patch::new().with("user_name", "Alice"));
    assert_eq!(state.get_str("user_name"), Some("Alice"));
    assert!(state.is_dirty());

    let outcome = mgr.commit(&mut state).await.unwrap();
    assert_eq!(
        outcome,
        CommitOutcome {
            version: 1,
            attempts: 1,
            written: true
        }
    );
    assert_eq!(state.version(), 1);
    assert!(!state.is_dirty());

    let reloaded = mgr.load("u1").await.unwrap();
    assert_eq!(reloaded.version(), 1);
    assert_eq!(reloaded.fields().len(), 1);
    assert_eq!(reloaded.get("user_name"), Some(&json!("Alice")));
}

#[tokio::test]
async fn test_empty_commit_is_noop() {
    let store = MemoryStore::new();
    let mgr = manager_with(store.clone(), fast_config());

    let mut state = mgr.load("u1").await.unwrap();
    mgr.update(&mut state, Patch::new().with("user_name", "Alice"));
    mgr.commit(&mut state).await.unwrap();

    let mut state = mgr.load("u1").await.unwrap();
    mgr.update(&mut state, Patch::new());
    let outcome = mgr.commit(&mut state).await.unwrap();
    assert!(!outcome.written);
    assert_eq!(outcome.attempts, 0);
    assert_eq!(outcome.version, 1);

    let stored = store.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.version, 1);
    assert_eq!(stored.fields["user_name"], json!("Alice"));
}

#[tokio::test]
async fn test_empty_commit_on_new_session_writes_nothing() {
    let store = MemoryStore::new();
    let mgr = manager_with(store.clone(), fast_config());

    let mut state = mgr.load("ghost").await.unwrap();
    mgr.commit(&mut state).await.unwrap();

    assert_eq!(store.count().await, 0);
}

#[tokio::test]
async fn test_conflicting_commit_rebases_onto_latest() {
    let store = MemoryStore::new();
    let mgr = manager_with(store.clone(), fast_config());

    let mut seed = mgr.load("u1").await.unwrap();
    mgr.update(&mut seed, Patch::new().with("user_name", "Alice"));
    mgr.commit(&mut seed).await.unwrap();

    // Both turns read version 1
    let mut turn_a = mgr.load("u1").await.unwrap();
    let mut turn_b = mgr.load("u1").await.unwrap();
    assert_eq!(turn_a.version(), 1);
    assert_eq!(turn_b.version(), 1);

    mgr.update(&mut turn_a, Patch::new().with("user_name", "Bob"));
    let a = mgr.commit(&mut turn_a).await.unwrap();
    assert_eq!(a.version, 2);

    mgr.update(&mut turn_b, Patch::new().with("city", "Paris"));
    let b = mgr.commit(&mut turn_b).await.unwrap();
    assert_eq!(b.version, 3);
    assert_eq!(b.attempts, 2);

    let stored = store.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.version, 3);
    assert_eq!(stored.fields["user_name"], json!("Bob"));
    assert_eq!(stored.fields["city"], json!("Paris"));

    // The working copy reflects what was written
    assert_eq!(turn_b.fields(), &stored.fields);
}

#[tokio::test]
async fn test_same_field_last_committer_wins() {
    let mgr = manager_with(MemoryStore::new(), fast_config());

    let mut turn_a = mgr.load("u1").await.unwrap();
    let mut turn_b = mgr.load("u1").await.unwrap();

    mgr.update(&mut turn_a, Patch::new().with("user_name", "Alice"));
    mgr.update(&mut turn_b, Patch::new().with("user_name", "Bob"));
    mgr.commit(&mut turn_a).await.unwrap();
    mgr.commit(&mut turn_b).await.unwrap();

    let state = mgr.load("u1").await.unwrap();
    assert_eq!(state.version(), 2);
    assert_eq!(state.get_str("user_name"), Some("Bob"));
}

#[tokio::test]
async fn test_remove_is_reapplied_after_conflict() {
    let store = MemoryStore::new();
    let mgr = manager_with(store.clone(), fast_config());

    let mut seed = mgr.load("u1").await.unwrap();
    mgr.update(
        &mut seed,
        Patch::new().with("user_name", "Alice").with("city", "Paris"),
    );
    mgr.commit(&mut seed).await.unwrap();

    let mut turn = mgr.load("u1").await.unwrap();
    mgr.update(&mut turn, Patch::new().without("city"));

    // Concurrent writer adds a field in between
    let mut other = mgr.load("u1").await.unwrap();
    mgr.update(&mut other, Patch::new().with("mood", "happy"));
    mgr.commit(&mut other).await.unwrap();

    mgr.commit(&mut turn).await.unwrap();

    let stored = store.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.version, 3);
    assert!(!stored.fields.contains_key("city"));
    assert_eq!(stored.fields["mood"], json!("happy"));
    assert_eq!(stored.fields["user_name"], json!("Alice"));
}

#[tokio::test]
async fn test_persistent_conflict_surfaces_retryable() {
    let mut store = MockStateStore::new();
    store
        .expect_get()
        .times(3)
        .returning(|id| Ok(Some(record(id, 7, Fields::new()))));
    store.expect_put().times(3).returning(|id, _, expected| {
        Err(StoreError::VersionConflict {
            session_id: id.to_string(),
            expected,
            actual: 8,
        })
    });

    let mgr = manager_with(store, fast_config());
    let mut state = mgr.load("u1").await.unwrap();
    mgr.update(&mut state, Patch::new().with("user_name", "Alice"));

    let err = mgr.commit(&mut state).await.unwrap_err();
    match err {
        Error::Retryable {
            session_id,
            attempts,
            last_seen_version,
        } => {
            assert_eq!(session_id, "u1");
            assert_eq!(attempts, 3);
            assert_eq!(last_seen_version, 8);
        }
        other => panic!("expected Retryable, got {other:?}"),
    }
    assert!(state.is_dirty());
}

#[tokio::test]
async fn test_retryable_leaves_stored_record_intact() {
    let store = MemoryStore::new();
    let mgr = manager_with(
        store.clone(),
        ManagerConfig {
            max_commit_attempts: 1,
            ..fast_config()
        },
    );

    let mut seed = mgr.load("u1").await.unwrap();
    mgr.update(&mut seed, Patch::new().with("user_name", "Alice"));
    mgr.commit(&mut seed).await.unwrap();

    let mut stale = mgr.load("u1").await.unwrap();
    let mut winner = mgr.load("u1").await.unwrap();
    mgr.update(&mut winner, Patch::new().with("user_name", "Bob"));
    mgr.commit(&mut winner).await.unwrap();

    mgr.update(&mut stale, Patch::new().with("city", "Paris"));
    let err = mgr.commit(&mut stale).await.unwrap_err();
    assert!(matches!(err, Error::Retryable { attempts: 1, .. }));

    let stored = store.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.fields.len(), 1);
    assert_eq!(stored.fields["user_name"], json!("Bob"));
}

#[tokio::test]
async fn test_unavailable_is_not_retried() {
    let mut store = MockStateStore::new();
    store.expect_get().times(1).returning(|_| Ok(None));
    store
        .expect_put()
        .times(1)
        .returning(|_, _, _| Err(StoreError::Unavailable("connection refused".to_string())));

    let mgr = manager_with(store, fast_config());
    let mut state = mgr.load("u1").await.unwrap();
    mgr.update(&mut state, Patch::new().with("user_name", "Alice"));

    let err = mgr.commit(&mut state).await.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(err, Error::Store(StoreError::Unavailable(_))));
}

#[tokio::test]
async fn test_cancelled_before_commit_writes_nothing() {
    let store = MemoryStore::new();
    let mgr = manager_with(store.clone(), fast_config());

    let mut state = mgr.load("u1").await.unwrap();
    mgr.update(&mut state, Patch::new().with("user_name", "Alice"));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = mgr.commit_with_cancel(&mut state, &cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled { ref session_id } if session_id == "u1"));
    assert!(state.is_dirty());
    assert_eq!(store.count().await, 0);
}

#[tokio::test]
async fn test_cancelled_during_backoff() {
    let mut store = MockStateStore::new();
    store.expect_get().times(1).returning(|_| Ok(None));
    store.expect_put().times(1).returning(|id, _, expected| {
        Err(StoreError::VersionConflict {
            session_id: id.to_string(),
            expected,
            actual: 1,
        })
    });

    let config = ManagerConfig {
        retry_initial_delay_ms: 10_000,
        retry_max_delay_ms: 10_000,
        retry_jitter: false,
        ..ManagerConfig::default()
    };
    let mgr = manager_with(store, config);
    let mut state = mgr.load("u1").await.unwrap();
    mgr.update(&mut state, Patch::new().with("user_name", "Alice"));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = mgr.commit_with_cancel(&mut state, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled { .. }));
}

#[tokio::test]
async fn test_stalled_store_times_out_as_unavailable() {
    let mgr = manager_with(
        StalledStore,
        ManagerConfig {
            store_timeout_ms: 30,
            ..fast_config()
        },
    );

    let err = mgr.load("u1").await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::Unavailable(ref msg)) if msg.contains("timed out")));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_health_check_is_bounded_by_store_timeout() {
    let mgr = manager_with(
        StalledStore,
        ManagerConfig {
            store_timeout_ms: 30,
            ..fast_config()
        },
    );

    let err = mgr.health_check().await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::Unavailable(ref msg)) if msg.contains("health_check timed out")));

    let healthy = manager_with(MemoryStore::new(), fast_config());
    healthy.health_check().await.unwrap();
}

#[tokio::test]
async fn test_enter_touches_session() {
    let store = MemoryStore::new();
    let mgr = manager_with(store.clone(), fast_config());

    let (session, state) = mgr.enter("u1").await.unwrap();
    assert_eq!(session.session_id, "u1");
    assert!(state.is_new());

    let (again, _) = mgr.enter("u1").await.unwrap();
    assert_eq!(again.created_at, session.created_at);
    assert!(again.last_seen_at >= session.last_seen_at);

    // Touching never creates a state record
    assert_eq!(store.count().await, 0);
    assert!(mgr.session("u1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_forget_and_list() {
    let mgr = manager_with(MemoryStore::new(), fast_config());

    for id in ["u2", "u1"] {
        let mut state = mgr.load(id).await.unwrap();
        mgr.update(&mut state, Patch::new().with("user_name", id));
        mgr.commit(&mut state).await.unwrap();
    }
    assert_eq!(mgr.list_sessions().await.unwrap(), vec!["u1", "u2"]);

    mgr.forget("u1").await.unwrap();
    assert!(mgr.record("u1").await.unwrap().is_none());
    assert_eq!(mgr.list_sessions().await.unwrap(), vec!["u2"]);

    let err = mgr.forget("u1").await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::NotFound(_))));
}

#[tokio::test]
async fn test_stale_commit_after_forget_keeps_new_facts() {
    let store = MemoryStore::new();
    let mgr = manager_with(store.clone(), fast_config());

    let mut seed = mgr.load("u1").await.unwrap();
    mgr.update(&mut seed, Patch::new().with("user_name", "Alice"));
    mgr.commit(&mut seed).await.unwrap();

    // Read before the forget, committed after someone else recreated the record
    let mut stale = mgr.load("u1").await.unwrap();
    assert_eq!(stale.version(), 1);

    mgr.forget("u1").await.unwrap();

    let mut other = mgr.load("u1").await.unwrap();
    assert!(other.is_new());
    mgr.update(&mut other, Patch::new().with("city", "Paris"));
    let recreated = mgr.commit(&mut other).await.unwrap();
    assert!(recreated.version > stale.version());

    mgr.update(&mut stale, Patch::new().with("mood", "happy"));
    let outcome = mgr.commit(&mut stale).await.unwrap();
    assert_eq!(outcome.attempts, 2);
    assert!(outcome.version > recreated.version);

    let stored = store.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.version, outcome.version);
    assert_eq!(stored.fields["city"], json!("Paris"));
    assert_eq!(stored.fields["mood"], json!("happy"));
    assert!(!stored.fields.contains_key("user_name"));
}

#[tokio::test]
async fn test_stale_commit_after_forget_recreates_above_tombstone() {
    let store = MemoryStore::new();
    let mgr = manager_with(store.clone(), fast_config());

    let mut seed = mgr.load("u1").await.unwrap();
    mgr.update(&mut seed, Patch::new().with("user_name", "Alice"));
    mgr.commit(&mut seed).await.unwrap();

    let mut stale = mgr.load("u1").await.unwrap();
    mgr.forget("u1").await.unwrap();

    mgr.update(&mut stale, Patch::new().with("mood", "happy"));
    let outcome = mgr.commit(&mut stale).await.unwrap();
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.version, 3);

    let stored = store.get("u1").await.unwrap().unwrap();
    assert_eq!(stored.fields.len(), 1);
    assert_eq!(stored.fields["mood"], json!("happy"));
}

#[tokio::test]
async fn test_removing_absent_field_writes_nothing() {
    let store = MemoryStore::new();
    let mgr = manager_with(store.clone(), fast_config());

    let mut state = mgr.load("u1").await.unwrap();
    mgr.update(&mut state, Patch::new().without("user_name"));
    assert!(state.is_dirty());

    let outcome = mgr.commit(&mut state).await.unwrap();
    assert_eq!(
        outcome,
        CommitOutcome {
            version: 0,
            attempts: 0,
            written: false
        }
    );
    assert!(!state.is_dirty());
    assert_eq!(store.count().await, 0);

    mgr.update(&mut state, Patch::new().with("city", "Paris"));
    mgr.commit(&mut state).await.unwrap();

    let mut state = mgr.load("u1").await.unwrap();
    mgr.update(
        &mut state,
        Patch::new().without("user_name").with("city", "Paris"),
    );
    let outcome = mgr.commit(&mut state).await.unwrap();
    assert!(!outcome.written);
    assert_eq!(outcome.version, 1);
    assert_eq!(store.get("u1").await.unwrap().unwrap().version, 1);
}

#[tokio::test]
async fn test_no_op_patch_never_calls_put() {
    let mut store = MockStateStore::new();
    store
        .expect_get()
        .times(1)
        .returning(|id| Ok(Some(record(id, 4, Fields::new()))));
    store.expect_put().never();

    let mgr = manager_with(store, fast_config());
    let mut state = mgr.load("u1").await.unwrap();
    mgr.update(&mut state, Patch::new().without("mood"));

    let outcome = mgr.commit(&mut state).await.unwrap();
    assert!(!outcome.written);
    assert_eq!(outcome.version, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_disjoint_commits_all_survive() {
    let store = MemoryStore::new();
    let mgr = Arc::new(manager_with(
        store.clone(),
        ManagerConfig {
            max_commit_attempts: 100,
            retry_jitter: true,
            ..fast_config()
        },
    ));

    let writers = 8;
    let mut handles = Vec::new();
    for i in 0..writers {
        let mgr = Arc::clone(&mgr);
        handles.push(tokio::spawn(async move {
            let mut state = mgr.load("shared").await?;
            mgr.update(&mut state, Patch::new().with(format!("field_{i}"), i));
            mgr.commit(&mut state).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = store.get("shared").await.unwrap().unwrap();
    assert_eq!(stored.version, writers);
    assert_eq!(stored.fields.len(), writers as usize);
    for i in 0..writers {
        assert_eq!(stored.fields[&format!("field_{i}")], json!(i));
    }
}

#[test]
fn test_record_helper_keeps_identity() {
    let r = record("u9", 4, Fields::new());
    assert_eq!(r.session_id, "u9");
    assert_eq!(r.version, 4);
    assert!(r.updated_at <= Utc::now());
}
