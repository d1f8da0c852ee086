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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::healthlog::HealthLogEntry;
use crate::storage::IndexSpec;
use crate::types::{CheckRequest, DocKey, WriteConcern};
use crate::{Error, Result};

/// Who logged an operation. This is the distinguishing tag the recovery
/// filter classifies on; it is set at append time and never inferred
/// from the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpOrigin {
    /// Ordinary client traffic (document CRUD, DDL).
    Client,
    /// Checker control records and health log appends.
    Checker,
}

/// One replicated operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LoggedOp {
    CreateCollection {
        ns: String,
        indexes: Vec<IndexSpec>,
    },
    Insert {
        ns: String,
        key: DocKey,
        body: Value,
    },
    Update {
        ns: String,
        key: DocKey,
        body: Value,
    },
    Delete {
        ns: String,
        key: DocKey,
    },
    /// One control record per dispatched check; every node that applies
    /// it runs its own coordinator against its local copy.
    CheckControl {
        invocation_id: Uuid,
        request: CheckRequest,
    },
    /// A primary-side health log append, replicated so the primary's
    /// check history is visible cluster-wide.
    HealthLogAppend {
        entry: HealthLogEntry,
    },
}

/// An operation as it sits in the log: payload, origin tag, position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogRecord {
    /// 1-based position in the log.
    pub index: u64,
    pub origin: OpOrigin,
    pub at: SystemTime,
    pub op: LoggedOp,
}

/// The shared replicated operation log.
///
/// Steady-state appliers tail it in order; `wait_for_commit` blocks a
/// writer until enough nodes have acknowledged application of a record,
/// which is how batch write concerns bound how far ahead of
/// majority-commit a check may run.
pub struct Oplog {
    records: RwLock<Vec<OplogRecord>>,
    /// node id -> highest applied index.
    applied: RwLock<HashMap<String, u64>>,
    append_notify: Notify,
    commit_notify: Notify,
}

impl Oplog {
    pub fn new() -> Self {
        Oplog {
            records: RwLock::new(Vec::new()),
            applied: RwLock::new(HashMap::new()),
            append_notify: Notify::new(),
            commit_notify: Notify::new(),
        }
    }

    /// Make a node visible to write concern accounting, starting at
    /// nothing applied.
    pub async fn register_node(&self, node_id: &str) {
        self.applied.write().await.entry(node_id.to_string()).or_insert(0);
    }

    /// Append one operation, returning the record as logged.
    pub async fn append(&self, origin: OpOrigin, op: LoggedOp) -> OplogRecord {
        let mut records = self.records.write().await;
        let index = records.len() as u64 + 1;
        let record = OplogRecord {
            index,
            origin,
            at: SystemTime::now(),
            op,
        };
        records.push(record.clone());
        drop(records);
        self.append_notify.notify_waiters();
        record
    }

    /// Highest index a node has acknowledged.
    pub async fn applied_index(&self, node_id: &str) -> u64 {
        self.applied.read().await.get(node_id).copied().unwrap_or(0)
    }

    /// Acknowledge that `node_id` has applied everything up to `index`.
    pub async fn ack(&self, node_id: &str, index: u64) {
        let mut applied = self.applied.write().await;
        let slot = applied.entry(node_id.to_string()).or_insert(0);
        if index > *slot {
            *slot = index;
        }
        drop(applied);
        self.commit_notify.notify_waiters();
    }

    pub async fn last_index(&self) -> u64 {
        self.records.read().await.len() as u64
    }

    /// Records strictly after `after`, in log order.
    pub async fn records_after(&self, after: u64) -> Vec<OplogRecord> {
        let records = self.records.read().await;
        records.iter().filter(|r| r.index > after).cloned().collect()
    }

    /// Records in the inclusive index window [from, to]; the bounded
    /// window a point-in-time restore replays.
    pub async fn window(&self, from: u64, to: u64) -> Vec<OplogRecord> {
        let records = self.records.read().await;
        records.iter().filter(|r| r.index >= from && r.index <= to).cloned().collect()
    }

    /// Wait until a new record is appended past `after` or the log is
    /// already there.
    pub async fn wait_for_append(&self, after: u64) {
        loop {
            let notified = self.append_notify.notified();
            if self.last_index().await > after {
                return;
            }
            notified.await;
        }
    }

    async fn acks_at_or_past(&self, index: u64) -> (usize, usize) {
        let applied = self.applied.read().await;
        let acked = applied.values().filter(|&&v| v >= index).count();
        (acked, applied.len())
    }

    async fn satisfied(&self, index: u64, concern: WriteConcern) -> bool {
        match concern {
            WriteConcern::Local => true,
            WriteConcern::Majority => {
                let (acked, total) = self.acks_at_or_past(index).await;
                acked >= total / 2 + 1
            }
            WriteConcern::Nodes(n) => {
                let (acked, _) = self.acks_at_or_past(index).await;
                acked >= n
            }
        }
    }

    /// Block until enough nodes acknowledged `index` for `concern`, or
    /// return `Error::WriteConcernTimeout`. The record stays in the log
    /// either way; a timeout is not a write failure.
    pub async fn wait_for_commit(&self, index: u64, concern: WriteConcern, timeout: std::time::Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.commit_notify.notified();
            if self.satisfied(index, concern).await {
                return Ok(());
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(Error::WriteConcernTimeout(timeout));
            };
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(Error::WriteConcernTimeout(timeout));
            }
        }
    }
}

impl Default for Oplog {
    fn default() -> Self {
        Oplog::new()
    }
}

/// What a primary-side health log writer needs to replicate appends.
#[derive(Clone)]
pub struct ReplicatedLogHandle {
    pub oplog: Arc<Oplog>,
    pub node_id: String,
}
