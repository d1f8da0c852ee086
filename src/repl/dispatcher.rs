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

use tracing::info;
use uuid::Uuid;

use crate::types::CheckRequest;
use crate::{Error, Result};

use super::oplog::{LoggedOp, OpOrigin};
use super::replica_set::ReplicaSet;

/// Converts one check request into one replicated control record.
///
/// No results are computed centrally: the primary runs its coordinator
/// inline, and every secondary that applies the control record runs its
/// own against its local copy (subject to the request's
/// `secondaries_run_check` knob). The shared invocation id ties the
/// per-node health log trails together for later comparison.
pub struct ClusterDispatcher {
    set: Arc<ReplicaSet>,
}

impl ClusterDispatcher {
    pub fn new(set: Arc<ReplicaSet>) -> Self {
        ClusterDispatcher { set }
    }

    /// Dispatch a check cluster-wide. Only the primary may dispatch;
    /// configuration errors are rejected before anything is logged.
    pub async fn dispatch(&self, request: CheckRequest) -> Result<Uuid> {
        request.validate()?;
        let primary = self.set.primary().await.ok_or(Error::NotPrimary)?;

        // The primary's coordinator starts first: a rejected start
        // (a check already running on the namespace, say) must not
        // leave a control record behind for secondaries to act on.
        let invocation_id = Uuid::new_v4();
        primary.checker.start(invocation_id, request.clone()).await?;

        let record = self
            .set
            .oplog()
            .append(
                OpOrigin::Checker,
                LoggedOp::CheckControl {
                    invocation_id,
                    request: request.clone(),
                },
            )
            .await;
        self.set.oplog().ack(&primary.id, record.index).await;

        info!(
            invocation = %invocation_id,
            ns = %request.ns,
            index = record.index,
            secondaries = request.secondaries_run_check,
            "dispatched check control record"
        );
        Ok(invocation_id)
    }
}
