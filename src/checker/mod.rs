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

pub mod coordinator;
pub mod range_iter;
pub mod validator;

pub use coordinator::{CheckCoordinator, CheckLifecycle, CheckStatus};
pub use range_iter::{Batch, RangeIterator};
pub use validator::{BatchValidator, Finding};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::healthlog::{HealthLog, HealthLogWriter};
use crate::repl::oplog::ReplicatedLogHandle;
use crate::storage::CollectionStore;
use crate::types::CheckRequest;
use crate::{Error, Result};

/// Terminal invocations kept around for status queries; past this the
/// registry sheds finished entries on the next start. History survives
/// in the health log either way.
const MAX_RETAINED_INVOCATIONS: usize = 256;

struct Invocation {
    ns: String,
    status: Arc<RwLock<CheckStatus>>,
    cancel: CancellationToken,
}

/// Per-node entry point: accepts check requests, spawns one coordinator
/// task per invocation, and serves status and cancellation.
///
/// At most one check runs per namespace at a time on a node.
pub struct CheckerService {
    node_id: String,
    store: Arc<dyn CollectionStore>,
    health_log: Arc<HealthLog>,
    replication: RwLock<Option<ReplicatedLogHandle>>,
    invocations: RwLock<HashMap<Uuid, Invocation>>,
    cancel: CancellationToken,
}

impl CheckerService {
    pub fn new(node_id: impl Into<String>, store: Arc<dyn CollectionStore>, health_log: Arc<HealthLog>) -> Self {
        let cancel = match crate::get_services_cancel_token() {
            Some(global) => global.child_token(),
            None => CancellationToken::new(),
        };
        CheckerService {
            node_id: node_id.into(),
            store,
            health_log,
            replication: RwLock::new(None),
            invocations: RwLock::new(HashMap::new()),
            cancel,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn health_log(&self) -> &Arc<HealthLog> {
        &self.health_log
    }

    /// Install or clear the replication handle. Present only while the
    /// node is primary; governs whether health log appends replicate.
    pub async fn set_replication(&self, handle: Option<ReplicatedLogHandle>) {
        *self.replication.write().await = handle;
    }

    /// Start a check with a fresh invocation id. Configuration errors
    /// are returned synchronously and produce no Running state.
    pub async fn run_check(&self, request: CheckRequest) -> Result<Uuid> {
        request.validate()?;
        let invocation_id = Uuid::new_v4();
        self.start(invocation_id, request).await?;
        Ok(invocation_id)
    }

    /// Start a check under an id assigned elsewhere (the id carried by
    /// a replicated control record, so every node reports the same one).
    pub async fn start(&self, invocation_id: Uuid, request: CheckRequest) -> Result<()> {
        request.validate()?;

        let mut invocations = self.invocations.write().await;
        for inv in invocations.values() {
            if inv.ns == request.ns && !inv.status.read().await.state.is_terminal() {
                return Err(Error::CheckInProgress(request.ns.clone()));
            }
        }

        if invocations.len() >= MAX_RETAINED_INVOCATIONS {
            let mut finished = Vec::new();
            for (id, inv) in invocations.iter() {
                if inv.status.read().await.state.is_terminal() {
                    finished.push(*id);
                }
            }
            for id in finished {
                invocations.remove(&id);
            }
        }

        let writer = match self.replication.read().await.clone() {
            Some(handle) => HealthLogWriter::replicated(self.health_log.clone(), handle),
            None => HealthLogWriter::local(self.health_log.clone()),
        };

        let cancel = self.cancel.child_token();
        let coordinator = CheckCoordinator::new(
            invocation_id,
            self.node_id.clone(),
            request.clone(),
            self.store.clone(),
            writer,
            cancel.clone(),
        );
        invocations.insert(
            invocation_id,
            Invocation {
                ns: request.ns.clone(),
                status: coordinator.status_handle(),
                cancel,
            },
        );
        drop(invocations);

        tokio::spawn(coordinator.run());
        Ok(())
    }

    pub async fn get_status(&self, invocation_id: Uuid) -> Option<CheckStatus> {
        let invocations = self.invocations.read().await;
        match invocations.get(&invocation_id) {
            Some(inv) => Some(inv.status.read().await.clone()),
            None => None,
        }
    }

    /// Request cancellation. The coordinator stops after the batch in
    /// flight and writes an interrupted stop entry.
    pub async fn cancel(&self, invocation_id: Uuid) -> Result<()> {
        let invocations = self.invocations.read().await;
        let inv = invocations
            .get(&invocation_id)
            .ok_or(Error::InvocationNotFound(invocation_id))?;
        info!(invocation = %invocation_id, ns = %inv.ns, "cancelling check");
        inv.cancel.cancel();
        Ok(())
    }

    /// Cancel every non-terminal invocation (shutdown, step-down).
    pub async fn cancel_all(&self) {
        let invocations = self.invocations.read().await;
        for (id, inv) in invocations.iter() {
            if !inv.status.read().await.state.is_terminal() {
                warn!(invocation = %id, ns = %inv.ns, "interrupting check");
                inv.cancel.cancel();
            }
        }
    }

    pub async fn running_count(&self) -> usize {
        let invocations = self.invocations.read().await;
        let mut running = 0;
        for inv in invocations.values() {
            if !inv.status.read().await.state.is_terminal() {
                running += 1;
            }
        }
        running
    }

    pub async fn invocation_count(&self) -> usize {
        self.invocations.read().await.len()
    }
}
