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

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checker::CheckerService;
use crate::healthlog::HealthLog;
use crate::storage::{CollectionStore, IndexSpec, MemStore};
use crate::types::DocKey;
use crate::{Error, Result};

use super::oplog::{LoggedOp, OpOrigin, Oplog, OplogRecord, ReplicatedLogHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Primary,
    Secondary,
}

/// One member of the replica set: its own data copy, its own health
/// log, its own checker service.
pub struct Node {
    pub id: String,
    role: RwLock<NodeRole>,
    pub store: Arc<MemStore>,
    pub checker: Arc<CheckerService>,
}

impl Node {
    async fn new(id: String, role: NodeRole, oplog: &Arc<Oplog>) -> Arc<Node> {
        let store = Arc::new(MemStore::new());
        let health_log = Arc::new(HealthLog::new());
        let checker = Arc::new(CheckerService::new(
            id.clone(),
            store.clone() as Arc<dyn CollectionStore>,
            health_log,
        ));
        if role == NodeRole::Primary {
            checker
                .set_replication(Some(ReplicatedLogHandle {
                    oplog: oplog.clone(),
                    node_id: id.clone(),
                }))
                .await;
        }
        Arc::new(Node {
            id,
            role: RwLock::new(role),
            store,
            checker,
        })
    }

    pub fn health_log(&self) -> &Arc<HealthLog> {
        self.checker.health_log()
    }

    pub async fn role(&self) -> NodeRole {
        *self.role.read().await
    }

    pub async fn is_primary(&self) -> bool {
        self.role().await == NodeRole::Primary
    }

    /// Apply one logged operation to this node's local state. Used by
    /// the steady-state applier and by restore replay; the former never
    /// filters, the latter filters before calling.
    pub async fn apply(&self, record: &OplogRecord) -> Result<()> {
        match &record.op {
            LoggedOp::CreateCollection { ns, indexes } => {
                self.store.create_collection(ns, indexes.clone()).await;
                Ok(())
            }
            LoggedOp::Insert { ns, key, body } | LoggedOp::Update { ns, key, body } => {
                self.store.upsert(ns, key.clone(), body.clone()).await
            }
            LoggedOp::Delete { ns, key } => self.store.delete(ns, key).await,
            LoggedOp::CheckControl {
                invocation_id,
                request,
            } => {
                if !request.secondaries_run_check && !self.is_primary().await {
                    debug!(
                        node = %self.id,
                        invocation = %invocation_id,
                        ns = %request.ns,
                        "control record observed; secondary checks disabled for this invocation"
                    );
                    return Ok(());
                }
                if let Err(e) = self.checker.start(*invocation_id, request.clone()).await {
                    warn!(node = %self.id, invocation = %invocation_id, error = %e, "could not start check from control record");
                }
                Ok(())
            }
            LoggedOp::HealthLogAppend { entry } => {
                self.health_log().append_local(entry.clone()).await;
                Ok(())
            }
        }
    }
}

/// An in-process replica set: one shared operation log, N nodes, one
/// steady-state applier task per secondary.
///
/// The applier replays every record in order, checker control records
/// and health log appends included; only restore replay (see
/// `repl::recovery`) ever skips anything.
pub struct ReplicaSet {
    oplog: Arc<Oplog>,
    nodes: Vec<Arc<Node>>,
    cancel: CancellationToken,
}

impl ReplicaSet {
    /// Build a set of `n` nodes; node 0 starts as primary.
    pub async fn new(n: usize) -> Result<Arc<ReplicaSet>> {
        if n == 0 {
            return Err(Error::Config("replica set needs at least one node".to_string()));
        }
        let oplog = Arc::new(Oplog::new());
        let cancel = match crate::get_services_cancel_token() {
            Some(global) => global.child_token(),
            None => CancellationToken::new(),
        };

        let mut nodes = Vec::with_capacity(n);
        for i in 0..n {
            let role = if i == 0 { NodeRole::Primary } else { NodeRole::Secondary };
            let node = Node::new(format!("node-{i}"), role, &oplog).await;
            oplog.register_node(&node.id).await;
            nodes.push(node);
        }

        let set = Arc::new(ReplicaSet { oplog, nodes, cancel });
        for node in set.nodes.iter().skip(1) {
            set.spawn_applier(node.clone(), 0);
        }
        info!(nodes = n, "replica set started");
        Ok(set)
    }

    fn spawn_applier(&self, node: Arc<Node>, from: u64) {
        let oplog = self.oplog.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut applied = from;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(node = %node.id, "applier shutting down");
                        break;
                    }
                    _ = oplog.wait_for_append(applied) => {
                        for record in oplog.records_after(applied).await {
                            // Records the node already acknowledged
                            // through the inline write path are not
                            // applied twice.
                            if oplog.applied_index(&node.id).await >= record.index {
                                applied = record.index;
                                continue;
                            }
                            if let Err(e) = node.apply(&record).await {
                                warn!(node = %node.id, index = record.index, error = %e, "failed to apply oplog record");
                            }
                            applied = record.index;
                            oplog.ack(&node.id, applied).await;
                        }
                    }
                }
            }
        });
    }

    pub fn oplog(&self) -> &Arc<Oplog> {
        &self.oplog
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.nodes[i]
    }

    pub async fn primary(&self) -> Option<Arc<Node>> {
        for node in &self.nodes {
            if node.is_primary().await {
                return Some(node.clone());
            }
        }
        None
    }

    /// A client write: applied on the primary inline, replicated to
    /// secondaries through the log.
    pub async fn client_write(&self, op: LoggedOp) -> Result<u64> {
        let primary = self.primary().await.ok_or(Error::NotPrimary)?;
        let record = self.oplog.append(OpOrigin::Client, op).await;
        primary.apply(&record).await?;
        self.oplog.ack(&primary.id, record.index).await;
        Ok(record.index)
    }

    pub async fn create_collection(&self, ns: &str, indexes: Vec<IndexSpec>) -> Result<u64> {
        self.client_write(LoggedOp::CreateCollection {
            ns: ns.to_string(),
            indexes,
        })
        .await
    }

    pub async fn insert(&self, ns: &str, key: DocKey, body: Value) -> Result<u64> {
        self.client_write(LoggedOp::Insert {
            ns: ns.to_string(),
            key,
            body,
        })
        .await
    }

    pub async fn delete(&self, ns: &str, key: DocKey) -> Result<u64> {
        self.client_write(LoggedOp::Delete {
            ns: ns.to_string(),
            key,
        })
        .await
    }

    /// Wait until every node has applied everything currently logged.
    pub async fn await_replication(&self, timeout: Duration) -> Result<()> {
        let target = self.oplog.last_index().await;
        let deadline = Instant::now() + timeout;
        loop {
            let mut caught_up = true;
            for node in &self.nodes {
                if self.oplog.applied_index(&node.id).await < target {
                    caught_up = false;
                    break;
                }
            }
            if caught_up {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Other(format!("replication did not reach index {target} in {timeout:?}")));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Demote the primary. Running checks on it are interrupted and are
    /// not resumed automatically; a new invocation must be issued with
    /// the health log's resume point as its start bound.
    pub async fn step_down(&self) -> Result<()> {
        let primary = self.primary().await.ok_or(Error::NotPrimary)?;
        info!(node = %primary.id, "stepping down");
        *primary.role.write().await = NodeRole::Secondary;
        primary.checker.set_replication(None).await;
        primary.checker.cancel_all().await;
        // Resume replication where the inline applies left off.
        let from = self.oplog.applied_index(&primary.id).await;
        self.spawn_applier(primary.clone(), from);
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for node in &self.nodes {
            node.checker.cancel_all().await;
        }
        info!("replica set shut down");
    }
}
