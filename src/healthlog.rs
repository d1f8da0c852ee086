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
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::repl::oplog::{LoggedOp, OpOrigin, ReplicatedLogHandle};
use crate::types::{CheckRequest, Counters, DocKey, ValidationResult, WriteConcern};
use crate::Result;

/// Severity of a health log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Why an invocation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Completed,
    Interrupted,
    Failed,
}

/// The kinds of inconsistency the validator can report. Findings are
/// expected output, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindingKind {
    ContentMismatch,
    MissingIndexKey,
    ExtraIndexKey,
    Unreadable,
}

/// Discriminant of an entry's payload, usable as a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Start,
    Batch,
    Finding,
    Warning,
    Stop,
}

/// Payload of one health log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryPayload {
    /// The invocation began on this node.
    Start { request: CheckRequest },
    /// One batch finished. Written for every batch regardless of outcome.
    Batch { result: ValidationResult },
    /// One offending document (or orphaned index entry), with enough
    /// detail to act on without re-scanning.
    Finding {
        kind: FindingKind,
        doc_key: DocKey,
        index: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
        message: String,
    },
    /// An operational condition worth recording (a write concern not
    /// met in time, say). Never an inconsistency finding.
    Warning { message: String },
    /// The invocation terminated.
    Stop {
        reason: StopReason,
        last_completed_key: Option<DocKey>,
        counters: Counters,
        error: Option<String>,
    },
}

impl EntryPayload {
    pub fn kind(&self) -> EntryKind {
        match self {
            EntryPayload::Start { .. } => EntryKind::Start,
            EntryPayload::Batch { .. } => EntryKind::Batch,
            EntryPayload::Finding { .. } => EntryKind::Finding,
            EntryPayload::Warning { .. } => EntryKind::Warning,
            EntryPayload::Stop { .. } => EntryKind::Stop,
        }
    }
}

/// One append-only, immutable record in a node's health log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthLogEntry {
    pub id: Uuid,
    pub invocation_id: Uuid,
    /// Node that produced the entry (not necessarily the node storing it).
    pub node_id: String,
    pub ns: String,
    pub severity: Severity,
    pub at: SystemTime,
    pub payload: EntryPayload,
}

impl HealthLogEntry {
    fn new(invocation_id: Uuid, node_id: &str, ns: &str, severity: Severity, payload: EntryPayload) -> Self {
        HealthLogEntry {
            id: Uuid::new_v4(),
            invocation_id,
            node_id: node_id.to_string(),
            ns: ns.to_string(),
            severity,
            at: SystemTime::now(),
            payload,
        }
    }

    pub fn start(invocation_id: Uuid, node_id: &str, request: &CheckRequest) -> Self {
        HealthLogEntry::new(
            invocation_id,
            node_id,
            &request.ns,
            Severity::Info,
            EntryPayload::Start {
                request: request.clone(),
            },
        )
    }

    pub fn batch(invocation_id: Uuid, node_id: &str, ns: &str, result: ValidationResult) -> Self {
        HealthLogEntry::new(invocation_id, node_id, ns, Severity::Info, EntryPayload::Batch { result })
    }

    pub fn finding(
        invocation_id: Uuid,
        node_id: &str,
        ns: &str,
        kind: FindingKind,
        doc_key: DocKey,
        index: Option<String>,
        expected: Option<String>,
        actual: Option<String>,
        message: String,
    ) -> Self {
        HealthLogEntry::new(
            invocation_id,
            node_id,
            ns,
            Severity::Error,
            EntryPayload::Finding {
                kind,
                doc_key,
                index,
                expected,
                actual,
                message,
            },
        )
    }

    pub fn warning(invocation_id: Uuid, node_id: &str, ns: &str, message: String) -> Self {
        HealthLogEntry::new(invocation_id, node_id, ns, Severity::Warning, EntryPayload::Warning { message })
    }

    pub fn stop(
        invocation_id: Uuid,
        node_id: &str,
        ns: &str,
        reason: StopReason,
        last_completed_key: Option<DocKey>,
        counters: Counters,
        error: Option<String>,
    ) -> Self {
        let severity = match reason {
            StopReason::Completed => Severity::Info,
            StopReason::Interrupted => Severity::Warning,
            StopReason::Failed => Severity::Error,
        };
        HealthLogEntry::new(
            invocation_id,
            node_id,
            ns,
            severity,
            EntryPayload::Stop {
                reason,
                last_completed_key,
                counters,
                error,
            },
        )
    }
}

/// Read-only query over the log.
#[derive(Debug, Clone, Default)]
pub struct HealthLogFilter {
    pub ns: Option<String>,
    pub severity: Option<Severity>,
    pub invocation_id: Option<Uuid>,
    pub kind: Option<EntryKind>,
    pub finding_kind: Option<FindingKind>,
}

impl HealthLogFilter {
    pub fn ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn invocation(mut self, id: Uuid) -> Self {
        self.invocation_id = Some(id);
        self
    }

    pub fn kind(mut self, kind: EntryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn finding_kind(mut self, kind: FindingKind) -> Self {
        self.finding_kind = Some(kind);
        self
    }

    fn matches(&self, entry: &HealthLogEntry) -> bool {
        if let Some(ns) = &self.ns {
            if &entry.ns != ns {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if entry.severity != severity {
                return false;
            }
        }
        if let Some(id) = self.invocation_id {
            if entry.invocation_id != id {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if entry.payload.kind() != kind {
                return false;
            }
        }
        if let Some(fk) = self.finding_kind {
            match &entry.payload {
                EntryPayload::Finding { kind, .. } if *kind == fk => {}
                _ => return false,
            }
        }
        true
    }
}

/// The append-only health log of one node. Entries are never updated;
/// pruning is an external concern.
#[derive(Default)]
pub struct HealthLog {
    entries: RwLock<Vec<HealthLogEntry>>,
}

impl HealthLog {
    pub fn new() -> Self {
        HealthLog::default()
    }

    pub async fn append_local(&self, entry: HealthLogEntry) {
        debug!(
            invocation = %entry.invocation_id,
            ns = %entry.ns,
            kind = ?entry.payload.kind(),
            "health log append"
        );
        self.entries.write().await.push(entry);
    }

    pub async fn query(&self, filter: &HealthLogFilter) -> Vec<HealthLogEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Where a new invocation should start to continue the most recent
    /// check of `ns`: the successor of the last key the log shows as
    /// completed. `None` when the log holds no boundary for `ns`.
    ///
    /// Position is always re-derived from the log, never from any
    /// in-memory coordinator state.
    pub async fn resume_point(&self, ns: &str) -> Option<DocKey> {
        let entries = self.entries.read().await;
        for entry in entries.iter().rev() {
            if entry.ns != ns {
                continue;
            }
            match &entry.payload {
                EntryPayload::Batch { result } => return Some(result.last_key.successor()),
                EntryPayload::Stop {
                    last_completed_key: Some(key),
                    ..
                } => return Some(key.successor()),
                _ => {}
            }
        }
        None
    }
}

/// Appends entries to the local log and, on the primary, replicates
/// them through the operation log, blocking until the requested write
/// concern is met or the timeout elapses.
#[derive(Clone)]
pub struct HealthLogWriter {
    log: Arc<HealthLog>,
    replication: Option<ReplicatedLogHandle>,
}

impl HealthLogWriter {
    /// Writer for a node that cannot replicate (a secondary's own
    /// checker, or standalone use). Appends are local and immediate.
    pub fn local(log: Arc<HealthLog>) -> Self {
        HealthLogWriter { log, replication: None }
    }

    /// Writer for the primary: appends flow through the replicated
    /// operation log as well.
    pub fn replicated(log: Arc<HealthLog>, handle: ReplicatedLogHandle) -> Self {
        HealthLogWriter {
            log,
            replication: Some(handle),
        }
    }

    /// Append one entry locally and, when replicating, into the op
    /// log. Returns the op log index to wait on, or `None` for a
    /// local-only writer. The local write always happens first, so a
    /// later write concern timeout leaves the entry durably written.
    pub async fn append_replicated(&self, entry: HealthLogEntry) -> Option<u64> {
        self.log.append_local(entry.clone()).await;
        match &self.replication {
            Some(handle) => {
                let record = handle.oplog.append(OpOrigin::Checker, LoggedOp::HealthLogAppend { entry }).await;
                handle.oplog.ack(&handle.node_id, record.index).await;
                Some(record.index)
            }
            None => None,
        }
    }

    /// Block until the given append reaches the requested write concern.
    pub async fn wait_commit(&self, index: u64, concern: WriteConcern, timeout: Duration) -> Result<()> {
        match &self.replication {
            Some(handle) => handle.oplog.wait_for_commit(index, concern, timeout).await,
            None => Ok(()),
        }
    }

    /// Append one entry and wait for the write concern in one call.
    pub async fn append(&self, entry: HealthLogEntry, concern: WriteConcern, timeout: Duration) -> Result<()> {
        match self.append_replicated(entry).await {
            Some(index) => self.wait_commit(index, concern, timeout).await,
            None => Ok(()),
        }
    }

    pub fn log(&self) -> &Arc<HealthLog> {
        &self.log
    }
}
