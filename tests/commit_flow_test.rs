//! End-to-end commit negotiation tests
//!
//! Drives real executors over the local ledger and in-memory or file-backed
//! cache stores:
//! - Manual first commit, automatic follow-up
//! - Cache invalidation after a write
//! - Submission failures and retry
//! - Superseded permission reads
//! - Cancellation with a submission in flight

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ledger_commit::cache::EntryPredicate;
use ledger_commit::{
    Balance, CacheKey, CacheStore, CommitCallbacks, CommitError, CommitExecutor, CommitHandle,
    CommitRequest, CommitSnapshot, CommitState, DepositCalculator, DepositTier, FileCacheStore,
    GrantScope, LedgerClient, LocalLedger, MemoryCacheStore, PermissionCache, PermissionKey,
    PermissionView, Result, StorageBalance, WritePermission, DEFAULT_COST_PER_BYTE,
};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

const WIDGET: &str = "bob/widget/App";

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Clone, Default)]
struct Recorder {
    commits: Arc<Mutex<Vec<Value>>>,
    errors: Arc<Mutex<Vec<CommitError>>>,
}

impl Recorder {
    fn callbacks(&self) -> CommitCallbacks {
        let commits = self.commits.clone();
        let errors = self.errors.clone();
        CommitCallbacks::new()
            .on_commit(move |diff| commits.lock().unwrap().push(diff.clone()))
            .on_error(move |e| errors.lock().unwrap().push(e.clone()))
    }

    fn commits(&self) -> Vec<Value> {
        self.commits.lock().unwrap().clone()
    }

    fn errors(&self) -> Vec<CommitError> {
        self.errors.lock().unwrap().clone()
    }
}

/// Local ledger whose submissions can be made to fail or to block
struct TestLedger {
    inner: LocalLedger,
    fail: AtomicBool,
    hold: AtomicBool,
    gate: Semaphore,
}

impl TestLedger {
    fn new() -> Self {
        Self {
            inner: LocalLedger::new(DEFAULT_COST_PER_BYTE),
            fail: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    async fn checkpoint(&self) -> Result<()> {
        if self.hold.load(Ordering::SeqCst) {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| CommitError::Submission(e.to_string()))?;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(CommitError::Submission("network down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerClient for TestLedger {
    async fn fetch_state(&self, keys: &[String]) -> Result<Value> {
        self.inner.fetch_state(keys).await
    }

    async fn storage_balance(&self, account_id: &str) -> Result<Option<StorageBalance>> {
        self.inner.storage_balance(account_id).await
    }

    async fn is_write_permission_granted(&self, account_id: &str, diff: &Value) -> Result<bool> {
        self.inner.is_write_permission_granted(account_id, diff).await
    }

    async fn submit_write(&self, account_id: &str, payload: &Value, deposit: Balance) -> Result<()> {
        self.checkpoint().await?;
        self.inner.submit_write(account_id, payload, deposit).await
    }

    async fn submit_write_with_grant(
        &self,
        account_id: &str,
        payload: &Value,
        deposit: Balance,
    ) -> Result<()> {
        self.checkpoint().await?;
        self.inner.submit_write_with_grant(account_id, payload, deposit).await
    }
}

/// Memory store whose permission reads for one resource block until released
struct GatedStore {
    inner: MemoryCacheStore,
    gated_resource: String,
    gate: Semaphore,
}

#[async_trait]
impl CacheStore for GatedStore {
    async fn read(&self, key: &CacheKey) -> Result<Option<Value>> {
        if key.key.get("resource_id").and_then(Value::as_str) == Some(self.gated_resource.as_str()) {
            let _permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| CommitError::Storage(e.to_string()))?;
        }
        self.inner.read(key).await
    }

    async fn write(&self, key: &CacheKey, value: Value) -> Result<()> {
        self.inner.write(key, value).await
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        self.inner.remove(key).await
    }

    async fn remove_matching(&self, predicate: EntryPredicate<'_>) -> Result<usize> {
        self.inner.remove_matching(predicate).await
    }
}

fn post(text: &str) -> Value {
    json!({"alice": {"post": {"main": text}}})
}

fn request(payload: Value) -> CommitRequest {
    CommitRequest::new(payload).resource(WIDGET).account("alice")
}

async fn wait(handle: &CommitHandle, predicate: impl FnMut(&CommitSnapshot) -> bool) -> CommitSnapshot {
    tokio::time::timeout(Duration::from_secs(5), handle.wait_for(predicate))
        .await
        .expect("executor did not reach the expected state")
        .unwrap()
}

/// Wait until the executor has prepared and loaded the permission
async fn ready(handle: &CommitHandle) -> CommitSnapshot {
    wait(handle, |s| !s.state.is_busy() && s.permission.is_loaded()).await
}

async fn settled(handle: &CommitHandle) -> CommitSnapshot {
    wait(handle, |s| s.is_settled() && s.permission.is_loaded()).await
}

// =============================================================================
// Manual and automatic commits
// =============================================================================

#[tokio::test]
async fn test_manual_commit_then_auto_commit() {
    let ledger = Arc::new(TestLedger::new());
    let store = Arc::new(MemoryCacheStore::new());
    let recorder = Recorder::default();
    let handle = CommitExecutor::spawn(ledger.clone(), store.clone(), recorder.callbacks());

    handle.set_request(request(post("first"))).await.unwrap();
    let snapshot = ready(&handle).await;
    assert_eq!(snapshot.state, CommitState::AwaitingDecision);
    assert_eq!(snapshot.permission, PermissionView::Loaded(WritePermission::Unknown));
    assert!(snapshot.delegate_future);
    assert_eq!(
        snapshot.mandatory_deposit,
        DepositCalculator::default().cost_of(2_000)
    );

    handle.confirm(DepositTier::None, true).await.unwrap();
    let snapshot = settled(&handle).await;
    assert_eq!(snapshot.state, CommitState::Submitted);

    let cached = PermissionCache::new(store.clone())
        .get(&PermissionKey::new(WIDGET, "alice"))
        .await;
    assert_eq!(
        cached,
        WritePermission::Grant(GrantScope::from_value(json!({"post": {"main": true}})))
    );

    // Same shape, already paid for: goes out without a confirmation
    handle.set_request(request(post("second"))).await.unwrap();
    let snapshot = wait(&handle, |s| s.state == CommitState::Submitted && s.is_settled()).await;
    assert!(snapshot.last_error.is_none());

    assert_eq!(recorder.commits(), vec![post("first"), post("second")]);
    assert!(recorder.errors().is_empty());
    assert_eq!(ledger.inner.snapshot().await.data, post("second"));
}

#[tokio::test]
async fn test_new_path_needs_confirmation() {
    let ledger = Arc::new(TestLedger::new());
    let store = Arc::new(MemoryCacheStore::new());
    let handle = CommitExecutor::spawn(ledger.clone(), store, CommitCallbacks::new());

    handle.set_request(request(post("first"))).await.unwrap();
    ready(&handle).await;
    handle.confirm(DepositTier::None, true).await.unwrap();
    settled(&handle).await;

    handle
        .set_request(request(json!({"alice": {"profile": {"name": "Alice"}}})))
        .await
        .unwrap();
    let snapshot = ready(&handle).await;
    assert_eq!(snapshot.state, CommitState::AwaitingDecision);
    assert!(snapshot.prepared.unwrap().permission_granted);
}

#[tokio::test]
async fn test_opt_out_keeps_asking() {
    let ledger = Arc::new(TestLedger::new());
    let store = Arc::new(MemoryCacheStore::new());
    let handle = CommitExecutor::spawn(ledger.clone(), store.clone(), CommitCallbacks::new());

    handle.set_request(request(post("first"))).await.unwrap();
    ready(&handle).await;
    handle.confirm(DepositTier::Small, false).await.unwrap();
    settled(&handle).await;

    handle.set_request(request(post("second"))).await.unwrap();
    let snapshot = ready(&handle).await;
    assert_eq!(snapshot.state, CommitState::AwaitingDecision);
    assert_eq!(snapshot.permission, PermissionView::Loaded(WritePermission::Denied));
    assert!(!snapshot.delegate_future);
}

#[tokio::test]
async fn test_commit_without_resource_stores_nothing() {
    let ledger = Arc::new(TestLedger::new());
    let store = Arc::new(MemoryCacheStore::new());
    let handle = CommitExecutor::spawn(ledger.clone(), store.clone(), CommitCallbacks::new());

    handle
        .set_request(CommitRequest::new(post("first")).account("alice"))
        .await
        .unwrap();
    let snapshot = ready(&handle).await;
    assert_eq!(snapshot.permission, PermissionView::Loaded(WritePermission::Denied));

    handle.confirm(DepositTier::None, true).await.unwrap();
    assert_eq!(settled(&handle).await.state, CommitState::Submitted);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_unchanged_payload_reports_nothing_to_commit() {
    let ledger = Arc::new(TestLedger::new());
    let store = Arc::new(MemoryCacheStore::new());
    let handle = CommitExecutor::spawn(ledger.clone(), store, CommitCallbacks::new());

    handle.set_request(request(post("first"))).await.unwrap();
    ready(&handle).await;
    handle.confirm(DepositTier::None, true).await.unwrap();
    settled(&handle).await;

    handle.set_request(request(post("first"))).await.unwrap();
    let snapshot = ready(&handle).await;
    assert_eq!(snapshot.state, CommitState::AwaitingDecision);
    assert_eq!(snapshot.prepared.unwrap().diff, None);
    assert_eq!(
        handle.confirm(DepositTier::None, true).await.unwrap_err(),
        CommitError::NothingToCommit
    );
}

// =============================================================================
// Invalidation
// =============================================================================

#[tokio::test]
async fn test_commit_invalidates_dependent_entries() {
    let ledger = Arc::new(TestLedger::new());
    let store = Arc::new(MemoryCacheStore::new());
    let posts = CacheKey::new("social", json!({"action": "get", "keys": ["alice/post/**"]}));
    let profile = CacheKey::new("social", json!({"action": "get", "keys": ["alice/profile/**"]}));
    let wildcard = CacheKey::new("social", json!({"action": "keys", "keys": ["*/post/main"]}));
    for key in [&posts, &profile, &wildcard] {
        store.write(key, json!("cached")).await.unwrap();
    }

    let handle = CommitExecutor::spawn(ledger, store.clone(), CommitCallbacks::new());
    handle.set_request(request(post("first"))).await.unwrap();
    ready(&handle).await;
    handle.confirm(DepositTier::None, true).await.unwrap();
    settled(&handle).await;

    assert_eq!(store.read(&posts).await.unwrap(), None);
    assert_eq!(store.read(&wildcard).await.unwrap(), None);
    assert!(store.read(&profile).await.unwrap().is_some());
    assert!(PermissionCache::new(store)
        .get(&PermissionKey::new(WIDGET, "alice"))
        .await
        .scope()
        .is_some());
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_unauthenticated_request_is_refused() {
    let ledger = Arc::new(TestLedger::new());
    let handle = CommitExecutor::spawn(ledger, Arc::new(MemoryCacheStore::new()), CommitCallbacks::new());

    let err = handle
        .set_request(CommitRequest::new(post("first")).resource(WIDGET))
        .await
        .unwrap_err();
    assert_eq!(err, CommitError::NotAuthenticated);
    assert_eq!(handle.snapshot().state, CommitState::Idle);
}

#[tokio::test]
async fn test_submission_failure_then_retry() {
    let ledger = Arc::new(TestLedger::new());
    ledger.fail.store(true, Ordering::SeqCst);
    let store = Arc::new(MemoryCacheStore::new());
    let recorder = Recorder::default();
    let handle = CommitExecutor::spawn(ledger.clone(), store.clone(), recorder.callbacks());

    handle.set_request(request(post("first"))).await.unwrap();
    ready(&handle).await;
    handle.confirm(DepositTier::None, true).await.unwrap();
    let snapshot = settled(&handle).await;

    assert_eq!(snapshot.state, CommitState::Failed);
    assert_eq!(
        snapshot.last_error,
        Some(CommitError::Submission("network down".into()))
    );
    assert_eq!(recorder.errors().len(), 1);
    assert!(recorder.commits().is_empty());
    assert!(store.is_empty().await);

    ledger.fail.store(false, Ordering::SeqCst);
    handle.retry().await.unwrap();
    let snapshot = ready(&handle).await;
    assert_eq!(snapshot.state, CommitState::AwaitingDecision);
    assert!(snapshot.prepared.unwrap().diff.is_some());

    handle.confirm(DepositTier::None, true).await.unwrap();
    assert_eq!(settled(&handle).await.state, CommitState::Submitted);
}

#[tokio::test]
async fn test_panicking_callbacks_keep_executor_running() {
    let ledger = Arc::new(TestLedger::new());
    ledger.fail.store(true, Ordering::SeqCst);
    let callbacks = CommitCallbacks::new()
        .on_commit(|_| panic!("commit hook bug"))
        .on_error(|_| panic!("error hook bug"));
    let handle = CommitExecutor::spawn(ledger.clone(), Arc::new(MemoryCacheStore::new()), callbacks);

    handle.set_request(request(post("first"))).await.unwrap();
    ready(&handle).await;
    handle.confirm(DepositTier::None, true).await.unwrap();
    assert_eq!(settled(&handle).await.state, CommitState::Failed);

    ledger.fail.store(false, Ordering::SeqCst);
    handle.retry().await.unwrap();
    ready(&handle).await;
    handle.confirm(DepositTier::None, true).await.unwrap();
    assert_eq!(settled(&handle).await.state, CommitState::Submitted);

    // Still answering after the commit hook panicked
    handle.set_request(request(post("second"))).await.unwrap();
    let snapshot = wait(&handle, |s| s.state == CommitState::Submitted && s.is_settled()).await;
    assert!(snapshot.last_error.is_none());
    assert_eq!(ledger.inner.snapshot().await.data, post("second"));
}

#[tokio::test]
async fn test_registered_account_skips_initial_storage() {
    let ledger = Arc::new(TestLedger::new());
    let store = Arc::new(MemoryCacheStore::new());
    let handle = CommitExecutor::spawn(ledger.clone(), store, CommitCallbacks::new());

    // Registered out of band with almost nothing deposited
    ledger
        .inner
        .deposit_storage("alice", Balance::from_units(1))
        .await
        .unwrap();

    handle.set_request(request(post("first"))).await.unwrap();
    let snapshot = ready(&handle).await;
    let prepared = snapshot.prepared.unwrap();
    assert!(prepared.deposit_bytes > 0);
    assert!(prepared.deposit_bytes < 2_000);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn test_stale_permission_read_is_discarded() {
    let ledger = Arc::new(TestLedger::new());
    let store = Arc::new(GatedStore {
        inner: MemoryCacheStore::new(),
        gated_resource: "r1".into(),
        gate: Semaphore::new(0),
    });
    let r2_grant = WritePermission::Grant(GrantScope::from_value(json!({"profile": true})));
    let seed = PermissionCache::new(store.clone());
    seed.set(&PermissionKey::new("r1", "alice"), &WritePermission::Denied)
        .await
        .unwrap();
    seed.set(&PermissionKey::new("r2", "alice"), &r2_grant).await.unwrap();

    let handle = CommitExecutor::spawn(ledger, store.clone(), CommitCallbacks::new());

    handle
        .set_request(CommitRequest::new(post("first")).resource("r1").account("alice"))
        .await
        .unwrap();
    wait(&handle, |s| s.state != CommitState::Preparing).await;
    handle.cancel().await.unwrap();

    handle
        .set_request(CommitRequest::new(post("first")).resource("r2").account("alice"))
        .await
        .unwrap();
    let snapshot = ready(&handle).await;
    assert_eq!(snapshot.permission, PermissionView::Loaded(r2_grant.clone()));

    store.gate.add_permits(1);
    let snapshot = wait(&handle, |s| s.stale_permission_reads == 1).await;
    assert_eq!(snapshot.permission, PermissionView::Loaded(r2_grant));
}

#[tokio::test]
async fn test_cancel_leaves_submission_running() {
    let ledger = Arc::new(TestLedger::new());
    ledger.hold.store(true, Ordering::SeqCst);
    let store = Arc::new(MemoryCacheStore::new());
    let recorder = Recorder::default();
    let handle = CommitExecutor::spawn(ledger.clone(), store.clone(), recorder.callbacks());

    handle.set_request(request(post("first"))).await.unwrap();
    ready(&handle).await;
    handle.confirm(DepositTier::None, true).await.unwrap();
    assert_eq!(
        handle.confirm(DepositTier::None, true).await.unwrap_err(),
        CommitError::Busy(CommitState::ManualSubmitting)
    );

    handle.cancel().await.unwrap();
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.state, CommitState::Idle);
    assert!(snapshot.in_flight);

    ledger.gate.add_permits(1);
    let snapshot = wait(&handle, |s| !s.in_flight).await;
    assert_eq!(snapshot.state, CommitState::Idle);
    assert_eq!(recorder.commits(), vec![post("first")]);
    assert!(PermissionCache::new(store)
        .get(&PermissionKey::new(WIDGET, "alice"))
        .await
        .scope()
        .is_some());
}

#[tokio::test]
async fn test_submission_completes_after_handles_drop() {
    let ledger = Arc::new(TestLedger::new());
    ledger.hold.store(true, Ordering::SeqCst);
    let recorder = Recorder::default();
    let handle = CommitExecutor::spawn(
        ledger.clone(),
        Arc::new(MemoryCacheStore::new()),
        recorder.callbacks(),
    );

    handle.set_request(request(post("first"))).await.unwrap();
    ready(&handle).await;
    handle.confirm(DepositTier::None, true).await.unwrap();
    drop(handle);

    ledger.gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(5), async {
        while recorder.commits().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("submission never reported");
    assert_eq!(ledger.inner.snapshot().await.data, post("first"));
}

// =============================================================================
// Shared file cache
// =============================================================================

#[tokio::test]
async fn test_permission_survives_executor_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("cache.json");
    let ledger = Arc::new(TestLedger::new());

    {
        let store = Arc::new(FileCacheStore::open(&cache_path).await.unwrap());
        let handle = CommitExecutor::spawn(ledger.clone(), store, CommitCallbacks::new());
        handle.set_request(request(post("first"))).await.unwrap();
        ready(&handle).await;
        handle.confirm(DepositTier::None, true).await.unwrap();
        assert_eq!(settled(&handle).await.state, CommitState::Submitted);
    }

    let store = Arc::new(FileCacheStore::open(&cache_path).await.unwrap());
    let handle = CommitExecutor::spawn(ledger.clone(), store, CommitCallbacks::new());
    handle.set_request(request(post("second"))).await.unwrap();
    let snapshot = wait(&handle, |s| s.state == CommitState::Submitted && s.is_settled()).await;
    assert!(snapshot.last_error.is_none());
    assert_eq!(ledger.inner.snapshot().await.data, post("second"));
}
