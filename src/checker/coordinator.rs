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

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::healthlog::{FindingKind, HealthLogEntry, HealthLogWriter, StopReason};
use crate::storage::CollectionStore;
use crate::types::{CheckRequest, Counters, DocKey, WriteConcern};

use super::range_iter::RangeIterator;
use super::validator::BatchValidator;

/// Lifecycle of one check invocation on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckLifecycle {
    Idle,
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl CheckLifecycle {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CheckLifecycle::Completed | CheckLifecycle::Interrupted | CheckLifecycle::Failed)
    }
}

/// Externally visible invocation state, served by `get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStatus {
    pub state: CheckLifecycle,
    pub last_completed_key: Option<DocKey>,
    pub counters: Counters,
}

impl Default for CheckStatus {
    fn default() -> Self {
        CheckStatus {
            state: CheckLifecycle::Idle,
            last_completed_key: None,
            counters: Counters::default(),
        }
    }
}

/// Drives one invocation end to end on one node: pulls batches, hands
/// them to the validator, streams results into the health log, and
/// finishes with a stop entry whatever happens.
///
/// Cancellation and deadline expiry are honored between batches only;
/// a batch in flight always finishes and is counted.
pub struct CheckCoordinator {
    invocation_id: Uuid,
    node_id: String,
    request: CheckRequest,
    store: Arc<dyn CollectionStore>,
    writer: HealthLogWriter,
    status: Arc<RwLock<CheckStatus>>,
    cancel: CancellationToken,
}

impl CheckCoordinator {
    pub fn new(
        invocation_id: Uuid,
        node_id: impl Into<String>,
        request: CheckRequest,
        store: Arc<dyn CollectionStore>,
        writer: HealthLogWriter,
        cancel: CancellationToken,
    ) -> Self {
        CheckCoordinator {
            invocation_id,
            node_id: node_id.into(),
            request,
            store,
            writer,
            status: Arc::new(RwLock::new(CheckStatus::default())),
            cancel,
        }
    }

    pub fn status_handle(&self) -> Arc<RwLock<CheckStatus>> {
        self.status.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run to termination. All outcomes, including failures, are
    /// reported through the health log and the status handle.
    pub async fn run(self) {
        let ns = self.request.ns.clone();
        let deadline = self.request.max_run_time.map(|d| Instant::now() + d);

        self.status.write().await.state = CheckLifecycle::Running;
        info!(
            invocation = %self.invocation_id,
            node = %self.node_id,
            ns = %ns,
            mode = ?self.request.mode,
            "check started"
        );

        self.append_local(HealthLogEntry::start(self.invocation_id, &self.node_id, &self.request))
            .await;

        let iter = RangeIterator::new(self.store.clone(), &self.request);
        let validator = BatchValidator::new(self.store.clone(), ns.clone(), self.request.mode);

        let mut after: Option<DocKey> = None;
        // Exclusive lower bound of the next extra-key reverse scan;
        // consecutive stretches tile [start, end) with no gaps.
        let mut boundary = self.request.start.clone();
        let mut counters = Counters::default();

        let (reason, error_detail) = loop {
            if self.cancel.is_cancelled() {
                break (StopReason::Interrupted, None);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break (StopReason::Interrupted, Some("invocation deadline expired".to_string()));
                }
            }

            // Suspension point: waiting on the storage cursor.
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break (StopReason::Interrupted, None),
                next = iter.next_batch(after.as_ref()) => next,
            };
            let batch = match next {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    // Range exhausted. Index entries can reference
                    // keys past the last live document, so the tail
                    // stretch still gets a reverse scan.
                    match validator.sweep_orphans(&boundary, &self.request.end).await {
                        Ok(findings) if !findings.is_empty() => {
                            for finding in &findings {
                                if finding.kind == FindingKind::ExtraIndexKey {
                                    counters.extra_index_keys += 1;
                                } else {
                                    counters.unreadable_docs += 1;
                                }
                            }
                            for finding in findings {
                                self.append_local(HealthLogEntry::finding(
                                    self.invocation_id,
                                    &self.node_id,
                                    &ns,
                                    finding.kind,
                                    finding.doc_key,
                                    finding.index,
                                    finding.expected,
                                    finding.actual,
                                    finding.message,
                                ))
                                .await;
                            }
                            self.status.write().await.counters = counters.clone();
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(invocation = %self.invocation_id, ns = %ns, error = %e, "orphan sweep failed");
                            break (StopReason::Failed, Some(e.to_string()));
                        }
                    }
                    break (StopReason::Completed, None);
                }
                Err(e) => {
                    error!(invocation = %self.invocation_id, ns = %ns, error = %e, "range iterator failed");
                    break (StopReason::Failed, Some(e.to_string()));
                }
            };

            // The batch in flight is never aborted mid-validation.
            let (result, findings) = match validator.validate(&batch, &boundary).await {
                Ok(out) => out,
                Err(e) => {
                    error!(invocation = %self.invocation_id, ns = %ns, error = %e, "batch validation failed");
                    break (StopReason::Failed, Some(e.to_string()));
                }
            };

            for finding in findings {
                self.append_local(HealthLogEntry::finding(
                    self.invocation_id,
                    &self.node_id,
                    &ns,
                    finding.kind,
                    finding.doc_key,
                    finding.index,
                    finding.expected,
                    finding.actual,
                    finding.message,
                ))
                .await;
            }

            // The batch boundary entry is written unconditionally; the
            // local append lands before any replication wait.
            let entry = HealthLogEntry::batch(self.invocation_id, &self.node_id, &ns, result.clone());
            let commit_index = self.writer.append_replicated(entry).await;

            counters.absorb(&result);
            boundary = batch.last_key.successor();
            after = Some(batch.last_key.clone());
            {
                let mut status = self.status.write().await;
                status.counters = counters.clone();
                status.last_completed_key = Some(batch.last_key.clone());
            }

            // Suspension point: write concern acknowledgment. Bounds
            // how far ahead of commit the check may run; a timeout is a
            // warning, not a failure, because the entry is already
            // durable locally.
            if let Some(index) = commit_index {
                let wait = self.writer.wait_commit(
                    index,
                    self.request.batch_write_concern,
                    self.request.write_concern_timeout,
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => break (StopReason::Interrupted, None),
                    acked = wait => {
                        if let Err(e) = acked {
                            warn!(invocation = %self.invocation_id, ns = %ns, error = %e, "batch write concern not satisfied");
                            self.append_local(HealthLogEntry::warning(
                                self.invocation_id,
                                &self.node_id,
                                &ns,
                                format!("batch write concern not satisfied: {e}"),
                            ))
                            .await;
                        }
                    }
                }
            }

            // Run-wide budgets end the check normally.
            if counters.docs_examined >= self.request.max_count || counters.bytes_examined >= self.request.max_size {
                info!(invocation = %self.invocation_id, ns = %ns, "run-wide limit reached");
                break (StopReason::Completed, None);
            }
        };

        let last_completed_key = self.status.read().await.last_completed_key.clone();
        self.append_local(HealthLogEntry::stop(
            self.invocation_id,
            &self.node_id,
            &ns,
            reason,
            last_completed_key,
            counters.clone(),
            error_detail,
        ))
        .await;

        let final_state = match reason {
            StopReason::Completed => CheckLifecycle::Completed,
            StopReason::Interrupted => CheckLifecycle::Interrupted,
            StopReason::Failed => CheckLifecycle::Failed,
        };
        self.status.write().await.state = final_state;
        info!(
            invocation = %self.invocation_id,
            node = %self.node_id,
            ns = %ns,
            state = ?final_state,
            batches = counters.batches,
            findings = counters.total_findings(),
            "check finished"
        );
    }

    /// Append with local durability only; start/stop/finding entries do
    /// not gate progress on replication.
    async fn append_local(&self, entry: HealthLogEntry) {
        if let Err(e) = self.writer.append(entry, WriteConcern::Local, Duration::from_secs(1)).await {
            warn!(invocation = %self.invocation_id, error = %e, "health log append failed");
        }
    }
}
