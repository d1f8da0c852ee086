// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end checker tests on a single node: full scans, fault
//! injection, interruption and resumption, admission control.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use rustfs_datacheck::checker::CheckerService;
use rustfs_datacheck::healthlog::{EntryKind, HealthLog, HealthLogFilter, Severity, StopReason};
use rustfs_datacheck::healthlog::EntryPayload;
use rustfs_datacheck::storage::{CollectionStore, IndexSpec, IndexValue, MemStore, ReadTickets, StoredDocument};
use rustfs_datacheck::types::{CheckRequest, DocKey, ValidationMode, WriteConcern};
use rustfs_datacheck::{CheckLifecycle, CheckStatus, Error, Result};

const NS: &str = "db.coll";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn seeded_store(n: u64) -> Arc<MemStore> {
    let store = Arc::new(MemStore::new());
    store
        .create_collection(NS, vec![IndexSpec::new("x_1", "x"), IndexSpec::new("tags_1", "tags")])
        .await;
    for i in 0..n {
        store
            .upsert(NS, DocKey::from_u64(i), json!({"x": i, "tags": ["t0", "t1"]}))
            .await
            .unwrap();
    }
    store
}

fn service(store: Arc<MemStore>, log: Arc<HealthLog>) -> CheckerService {
    CheckerService::new("node-0", store as Arc<dyn CollectionStore>, log)
}

async fn wait_terminal(service: &CheckerService, id: Uuid) -> CheckStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(status) = service.get_status(id).await {
                if status.state.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("check did not reach a terminal state")
}

#[tokio::test]
async fn clean_collection_full_scan() {
    init_tracing();
    let store = seeded_store(100).await;
    let log = Arc::new(HealthLog::new());
    let svc = service(store, log.clone());

    let request = CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(100))
        .with_mode(ValidationMode::DataConsistencyAndMissingAndExtraIndexKeys)
        .with_batch_limits(10, u64::MAX);
    let id = svc.run_check(request).await.unwrap();

    let status = wait_terminal(&svc, id).await;
    assert_eq!(status.state, CheckLifecycle::Completed);
    assert_eq!(status.counters.batches, 10);
    assert_eq!(status.counters.docs_examined, 100);
    assert_eq!(status.counters.total_findings(), 0);
    assert_eq!(status.last_completed_key, Some(DocKey::from_u64(99)));

    // One start, one boundary entry per batch, one completed stop.
    let filter = HealthLogFilter::default().invocation(id);
    assert_eq!(log.query(&filter.clone().kind(EntryKind::Start)).await.len(), 1);
    assert_eq!(log.query(&filter.clone().kind(EntryKind::Batch)).await.len(), 10);
    assert!(log.query(&filter.clone().kind(EntryKind::Finding)).await.is_empty());
    let stops = log.query(&filter.kind(EntryKind::Stop)).await;
    assert_eq!(stops.len(), 1);
    match &stops[0].payload {
        EntryPayload::Stop { reason, counters, .. } => {
            assert_eq!(*reason, StopReason::Completed);
            assert_eq!(counters.docs_examined, 100);
        }
        other => panic!("unexpected stop payload: {other:?}"),
    }
}

#[tokio::test]
async fn single_missing_index_key_is_found_in_the_right_half() {
    init_tracing();
    let store = seeded_store(100).await;
    store
        .suppress_index_entries(NS, "x_1", &DocKey::from_u64(25))
        .await
        .unwrap();
    let log = Arc::new(HealthLog::new());
    let svc = service(store, log.clone());

    let lower = CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(50))
        .with_mode(ValidationMode::DataConsistencyAndMissingIndexKeys)
        .with_batch_limits(10, u64::MAX);
    let upper = CheckRequest::new(NS, DocKey::from_u64(50), DocKey::from_u64(100))
        .with_mode(ValidationMode::DataConsistencyAndMissingIndexKeys)
        .with_batch_limits(10, u64::MAX);

    let lower_id = svc.run_check(lower).await.unwrap();
    let lower_status = wait_terminal(&svc, lower_id).await;
    let upper_id = svc.run_check(upper).await.unwrap();
    let upper_status = wait_terminal(&svc, upper_id).await;

    assert_eq!(lower_status.counters.missing_index_keys, 1);
    assert_eq!(upper_status.counters.missing_index_keys, 0);

    let findings = log
        .query(&HealthLogFilter::default().invocation(lower_id).kind(EntryKind::Finding))
        .await;
    assert_eq!(findings.len(), 1);
    match &findings[0].payload {
        EntryPayload::Finding { doc_key, index, .. } => {
            assert_eq!(*doc_key, DocKey::from_u64(25));
            assert_eq!(index.as_deref(), Some("x_1"));
        }
        other => panic!("unexpected finding payload: {other:?}"),
    }
}

#[tokio::test]
async fn orphan_entry_between_batches_is_detected() {
    init_tracing();
    let store = seeded_store(20).await;
    // The orphan's key falls strictly between the last document of
    // batch 1 (9) and the first of batch 2 (10).
    let gap_key = DocKey::from_u64(9).successor();
    store
        .plant_index_entry(NS, "x_1", "777".to_string(), gap_key.clone())
        .await
        .unwrap();
    let log = Arc::new(HealthLog::new());
    let svc = service(store, log.clone());

    let request = CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(20))
        .with_mode(ValidationMode::DataConsistencyAndMissingAndExtraIndexKeys)
        .with_batch_limits(10, u64::MAX);
    let id = svc.run_check(request).await.unwrap();

    let status = wait_terminal(&svc, id).await;
    assert_eq!(status.state, CheckLifecycle::Completed);
    assert_eq!(status.counters.extra_index_keys, 1);

    let findings = log
        .query(&HealthLogFilter::default().invocation(id).kind(EntryKind::Finding))
        .await;
    assert_eq!(findings.len(), 1);
    match &findings[0].payload {
        EntryPayload::Finding { doc_key, .. } => assert_eq!(*doc_key, gap_key),
        other => panic!("unexpected finding payload: {other:?}"),
    }
}

#[tokio::test]
async fn orphan_entry_past_the_last_document_is_detected() {
    init_tracing();
    let store = seeded_store(10).await;
    // No document anywhere near key 50, but the request range covers it.
    store
        .plant_index_entry(NS, "x_1", "888".to_string(), DocKey::from_u64(50))
        .await
        .unwrap();
    let log = Arc::new(HealthLog::new());
    let svc = service(store, log.clone());

    let request = CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(100))
        .with_mode(ValidationMode::DataConsistencyAndMissingAndExtraIndexKeys)
        .with_batch_limits(10, u64::MAX);
    let id = svc.run_check(request).await.unwrap();

    let status = wait_terminal(&svc, id).await;
    assert_eq!(status.state, CheckLifecycle::Completed);
    assert_eq!(status.counters.docs_examined, 10);
    assert_eq!(status.counters.extra_index_keys, 1);
}

/// Wraps a store and parks the cursor after a fixed number of batch
/// scans, so a test can interrupt a check at a known boundary.
struct GateStore {
    inner: Arc<MemStore>,
    scans: AtomicUsize,
    gate_after: usize,
    parked: Notify,
}

impl GateStore {
    fn new(inner: Arc<MemStore>, gate_after: usize) -> Self {
        GateStore {
            inner,
            scans: AtomicUsize::new(0),
            gate_after,
            parked: Notify::new(),
        }
    }
}

#[async_trait]
impl CollectionStore for GateStore {
    async fn keys_in_range(
        &self,
        ns: &str,
        start: &DocKey,
        start_inclusive: bool,
        end: &DocKey,
        limit: usize,
    ) -> Result<Vec<(DocKey, u64)>> {
        if self.scans.fetch_add(1, Ordering::SeqCst) >= self.gate_after {
            self.parked.notify_one();
            std::future::pending::<()>().await;
        }
        self.inner.keys_in_range(ns, start, start_inclusive, end, limit).await
    }

    async fn read_document(&self, ns: &str, key: &DocKey) -> Result<Option<StoredDocument>> {
        self.inner.read_document(ns, key).await
    }

    async fn list_indexes(&self, ns: &str) -> Result<Vec<IndexSpec>> {
        self.inner.list_indexes(ns).await
    }

    async fn index_entry_exists(&self, ns: &str, index: &str, value: &IndexValue, key: &DocKey) -> Result<bool> {
        self.inner.index_entry_exists(ns, index, value, key).await
    }

    async fn index_entries_for_range(
        &self,
        ns: &str,
        index: &str,
        lower: &DocKey,
        upper: &DocKey,
    ) -> Result<Vec<(IndexValue, DocKey)>> {
        self.inner.index_entries_for_range(ns, index, lower, upper).await
    }
}

#[tokio::test]
async fn interrupted_check_resumes_without_rescanning() {
    init_tracing();
    let store = seeded_store(100).await;
    let log = Arc::new(HealthLog::new());

    // First run: parked while fetching the fourth batch, then cancelled.
    let gated = Arc::new(GateStore::new(store.clone(), 3));
    let svc = CheckerService::new("node-0", gated.clone() as Arc<dyn CollectionStore>, log.clone());
    let request = CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(100)).with_batch_limits(10, u64::MAX);
    let id = svc.run_check(request).await.unwrap();

    gated.parked.notified().await;
    svc.cancel(id).await.unwrap();
    let first = wait_terminal(&svc, id).await;
    assert_eq!(first.state, CheckLifecycle::Interrupted);
    assert_eq!(first.counters.batches, 3);
    assert_eq!(first.counters.docs_examined, 30);
    assert_eq!(first.last_completed_key, Some(DocKey::from_u64(29)));

    // The resume position comes from the log, not the dead coordinator.
    let resume = log.resume_point(NS).await.unwrap();
    assert_eq!(resume, DocKey::from_u64(29).successor());

    // Second run covers exactly the rest of the range.
    let svc = service(store, log.clone());
    let second_id = svc
        .run_check(CheckRequest::new(NS, resume, DocKey::from_u64(100)).with_batch_limits(10, u64::MAX))
        .await
        .unwrap();
    let second = wait_terminal(&svc, second_id).await;
    assert_eq!(second.state, CheckLifecycle::Completed);
    assert_eq!(second.counters.batches, 7);
    assert_eq!(second.counters.docs_examined, 70);

    // Both runs together examined each document exactly once.
    assert_eq!(first.counters.docs_examined + second.counters.docs_examined, 100);
    assert_eq!(first.counters.batches + second.counters.batches, 10);
}

#[tokio::test]
async fn exhausted_read_tickets_surface_as_unreadable_findings() {
    init_tracing();
    let store = Arc::new(MemStore::with_tickets(ReadTickets::new(1, Duration::from_millis(10))));
    store.create_collection(NS, Vec::new()).await;
    for i in 0..5 {
        store.upsert(NS, DocKey::from_u64(i), json!({"x": i})).await.unwrap();
    }
    // Hold the only ticket so every checker read times out.
    let _held = store.read_tickets().acquire().await.unwrap();

    let log = Arc::new(HealthLog::new());
    let svc = service(store.clone(), log.clone());
    let id = svc
        .run_check(CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(5)))
        .await
        .unwrap();

    let status = wait_terminal(&svc, id).await;
    assert_eq!(status.state, CheckLifecycle::Completed);
    assert_eq!(status.counters.unreadable_docs, 5);
    assert_eq!(status.counters.docs_examined, 0);
    assert_eq!(
        log.query(&HealthLogFilter::default().invocation(id).kind(EntryKind::Finding))
            .await
            .len(),
        5
    );
}

#[tokio::test]
async fn run_wide_document_budget_ends_the_check_normally() {
    init_tracing();
    let store = seeded_store(100).await;
    let log = Arc::new(HealthLog::new());
    let svc = service(store, log.clone());

    let request = CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(100))
        .with_batch_limits(10, u64::MAX)
        .with_run_limits(25, u64::MAX);
    let id = svc.run_check(request).await.unwrap();

    let status = wait_terminal(&svc, id).await;
    // The budget is checked at batch boundaries: the batch that crossed
    // it still finishes and counts.
    assert_eq!(status.state, CheckLifecycle::Completed);
    assert_eq!(status.counters.batches, 3);
    assert_eq!(status.counters.docs_examined, 30);

    let stops = log
        .query(&HealthLogFilter::default().invocation(id).kind(EntryKind::Stop))
        .await;
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].severity, Severity::Info);
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_running() {
    init_tracing();
    let store = seeded_store(10).await;
    let log = Arc::new(HealthLog::new());
    let svc = service(store, log.clone());

    let inverted = CheckRequest::new(NS, DocKey::from_u64(5), DocKey::from_u64(5));
    assert!(matches!(svc.run_check(inverted).await, Err(Error::Config(_))));

    let zero_batch = CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(5)).with_batch_limits(0, 1);
    assert!(matches!(svc.run_check(zero_batch).await, Err(Error::Config(_))));

    // Nothing ran and nothing was logged.
    assert_eq!(svc.invocation_count().await, 0);
    assert!(log.is_empty().await);
}

#[tokio::test]
async fn one_check_per_namespace_at_a_time() {
    init_tracing();
    let store = seeded_store(100).await;
    let log = Arc::new(HealthLog::new());

    let gated = Arc::new(GateStore::new(store.clone(), 1));
    let svc = CheckerService::new("node-0", gated.clone() as Arc<dyn CollectionStore>, log.clone());
    let request = CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(100)).with_batch_limits(10, u64::MAX);
    let id = svc.run_check(request.clone()).await.unwrap();
    gated.parked.notified().await;

    // Same namespace: rejected while the first is running.
    assert!(matches!(svc.run_check(request).await, Err(Error::CheckInProgress(_))));

    svc.cancel(id).await.unwrap();
    let status = wait_terminal(&svc, id).await;
    assert_eq!(status.state, CheckLifecycle::Interrupted);
}

#[tokio::test]
async fn finished_invocations_are_pruned_from_the_registry() {
    init_tracing();
    let store = seeded_store(1).await;
    let log = Arc::new(HealthLog::new());
    let svc = service(store, log);

    let mut last = None;
    for _ in 0..300 {
        let id = svc
            .run_check(CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(1)))
            .await
            .unwrap();
        wait_terminal(&svc, id).await;
        last = Some(id);
    }

    // The registry sheds finished entries instead of growing forever,
    // but the most recent status is still queryable.
    assert!(svc.invocation_count().await < 300);
    assert!(svc.get_status(last.unwrap()).await.is_some());
}

#[tokio::test]
async fn concurrent_consistent_writes_produce_no_findings() {
    init_tracing();
    let store = seeded_store(100).await;
    let log = Arc::new(HealthLog::new());
    let svc = service(store.clone(), log.clone());

    let request = CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(200))
        .with_mode(ValidationMode::DataConsistencyAndMissingAndExtraIndexKeys)
        .with_batch_limits(5, u64::MAX);
    let id = svc.run_check(request).await.unwrap();

    // Ordinary traffic while the check runs: inserts ahead of the scan
    // and rewrites behind it, all going through the normal write path.
    for i in 100..150 {
        store
            .upsert(NS, DocKey::from_u64(i), json!({"x": i, "tags": ["t0"]}))
            .await
            .unwrap();
    }
    for i in 0..10 {
        store
            .upsert(NS, DocKey::from_u64(i), json!({"x": i, "tags": ["t0", "t1"], "rev": 2}))
            .await
            .unwrap();
    }

    let status = wait_terminal(&svc, id).await;
    assert_eq!(status.state, CheckLifecycle::Completed);
    assert_eq!(status.counters.total_findings(), 0);
}

#[tokio::test]
async fn local_write_concern_checks_need_no_replication() {
    init_tracing();
    let store = seeded_store(20).await;
    let log = Arc::new(HealthLog::new());
    let svc = service(store, log.clone());

    let request = CheckRequest::new(NS, DocKey::min(), DocKey::from_u64(20))
        .with_batch_limits(5, u64::MAX)
        .with_write_concern(WriteConcern::Local, Duration::from_secs(1));
    let id = svc.run_check(request).await.unwrap();

    let status = wait_terminal(&svc, id).await;
    assert_eq!(status.state, CheckLifecycle::Completed);
    // No replication handle, no write concern waits, no warnings.
    assert!(log
        .query(&HealthLogFilter::default().invocation(id).severity(Severity::Warning))
        .await
        .is_empty());
}
