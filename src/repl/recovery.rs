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

use tracing::{debug, info};

use crate::Result;

use super::oplog::{OpOrigin, OplogRecord};
use super::replica_set::Node;

/// How a bounded log window is being replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Continuous secondary replication. Never filters: checker control
    /// records and health log appends replay normally so every node's
    /// checker still runs.
    SteadyState,
    /// Bringing a snapshot forward as a standalone step. Checker-origin
    /// records are skipped so a stale control record cannot re-trigger
    /// a scan and health log entries are not duplicated.
    PointInTimeRestore,
}

/// Whether a logged operation is checker-originated and must be skipped
/// by replay modes that opt in. Classification is by the record's
/// origin tag alone, never by inspecting the payload.
pub fn should_skip(record: &OplogRecord) -> bool {
    matches!(record.origin, OpOrigin::Checker)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub applied: u64,
    pub skipped: u64,
}

/// Replay a bounded window of the log onto a node.
///
/// Only `PointInTimeRestore` consults the filter; `SteadyState` mode
/// applies everything, matching what the continuous applier does.
pub async fn replay_window(node: &Node, window: &[OplogRecord], mode: ReplayMode) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();
    for record in window {
        if mode == ReplayMode::PointInTimeRestore && should_skip(record) {
            debug!(node = %node.id, index = record.index, "skipping checker-origin record in restore replay");
            summary.skipped += 1;
            continue;
        }
        node.apply(record).await?;
        summary.applied += 1;
    }
    info!(
        node = %node.id,
        mode = ?mode,
        applied = summary.applied,
        skipped = summary.skipped,
        "replayed log window"
    );
    Ok(summary)
}
