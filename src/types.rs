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

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default batch sizing, matching the invocation defaults of the
/// storage-validation command this checker replaces.
pub const DEFAULT_MAX_DOCS_PER_BATCH: usize = 5000;
pub const DEFAULT_MAX_BYTES_PER_BATCH: u64 = 16 * 1024 * 1024;
pub const DEFAULT_WRITE_CONCERN_TIMEOUT: Duration = Duration::from_secs(10);

/// Ordered opaque document key.
///
/// Keys compare bytewise, matching the storage engine's ordering of the
/// primary key index. Ranges over keys are always [start, end).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocKey(Vec<u8>);

impl DocKey {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        DocKey(bytes.into())
    }

    /// Big-endian encoding so numeric order matches byte order.
    pub fn from_u64(n: u64) -> Self {
        DocKey(n.to_be_bytes().to_vec())
    }

    /// The smallest key (empty byte string).
    pub fn min() -> Self {
        DocKey(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The immediate successor in byte order. Used to turn an inclusive
    /// last-completed key into an exclusive resume bound: a range
    /// starting at `k.successor()` contains every key greater than `k`.
    pub fn successor(&self) -> Self {
        let mut bytes = self.0.clone();
        bytes.push(0);
        DocKey(bytes)
    }
}

impl fmt::Debug for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocKey({})", hex::encode(&self.0))
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// What a batch validation pass re-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationMode {
    /// Content digests only.
    DataConsistency,
    /// Content digests plus missing index key detection.
    DataConsistencyAndMissingIndexKeys,
    /// Content digests, missing keys, and orphaned index entries.
    DataConsistencyAndMissingAndExtraIndexKeys,
}

impl ValidationMode {
    pub fn checks_missing_keys(&self) -> bool {
        !matches!(self, ValidationMode::DataConsistency)
    }

    pub fn checks_extra_keys(&self) -> bool {
        matches!(self, ValidationMode::DataConsistencyAndMissingAndExtraIndexKeys)
    }
}

/// Acknowledgment threshold a replicated write must reach before the
/// caller proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteConcern {
    /// Durable on this node only.
    Local,
    /// Acknowledged by a strict majority of the replica set.
    Majority,
    /// Acknowledged by at least `n` nodes.
    Nodes(usize),
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::Majority
    }
}

/// Immutable description of one check invocation.
///
/// Created at the dispatching node, replicated verbatim inside the
/// control record, and consumed once by every node that runs the check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Target collection.
    pub ns: String,
    /// Inclusive lower bound.
    pub start: DocKey,
    /// Exclusive upper bound.
    pub end: DocKey,
    pub mode: ValidationMode,
    pub max_docs_per_batch: usize,
    pub max_bytes_per_batch: u64,
    /// Run-wide document budget. Reaching it ends the run normally.
    pub max_count: u64,
    /// Run-wide byte budget. Reaching it ends the run normally.
    pub max_size: u64,
    /// Write concern each batch boundary entry must reach before the
    /// next batch starts.
    pub batch_write_concern: WriteConcern,
    pub write_concern_timeout: Duration,
    /// Overall invocation deadline; expiry behaves as cancellation.
    pub max_run_time: Option<Duration>,
    /// Whether secondaries start their own check on applying the
    /// control record, or only the primary runs.
    pub secondaries_run_check: bool,
}

impl CheckRequest {
    pub fn new(ns: impl Into<String>, start: DocKey, end: DocKey) -> Self {
        CheckRequest {
            ns: ns.into(),
            start,
            end,
            mode: ValidationMode::DataConsistency,
            max_docs_per_batch: DEFAULT_MAX_DOCS_PER_BATCH,
            max_bytes_per_batch: DEFAULT_MAX_BYTES_PER_BATCH,
            max_count: u64::MAX,
            max_size: u64::MAX,
            batch_write_concern: WriteConcern::default(),
            write_concern_timeout: DEFAULT_WRITE_CONCERN_TIMEOUT,
            max_run_time: None,
            secondaries_run_check: true,
        }
    }

    pub fn with_mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_batch_limits(mut self, max_docs: usize, max_bytes: u64) -> Self {
        self.max_docs_per_batch = max_docs;
        self.max_bytes_per_batch = max_bytes;
        self
    }

    pub fn with_run_limits(mut self, max_count: u64, max_size: u64) -> Self {
        self.max_count = max_count;
        self.max_size = max_size;
        self
    }

    pub fn with_write_concern(mut self, concern: WriteConcern, timeout: Duration) -> Self {
        self.batch_write_concern = concern;
        self.write_concern_timeout = timeout;
        self
    }

    pub fn with_deadline(mut self, max_run_time: Duration) -> Self {
        self.max_run_time = Some(max_run_time);
        self
    }

    pub fn primary_only(mut self) -> Self {
        self.secondaries_run_check = false;
        self
    }

    /// Reject invalid invocations before any state transitions happen.
    /// A request that fails here never reaches the Running state.
    pub fn validate(&self) -> Result<()> {
        if self.ns.is_empty() {
            return Err(Error::Config("namespace must not be empty".to_string()));
        }
        if self.start >= self.end {
            return Err(Error::Config(format!(
                "start key {} must be less than end key {}",
                self.start, self.end
            )));
        }
        if self.max_docs_per_batch == 0 {
            return Err(Error::Config("max_docs_per_batch must be at least 1".to_string()));
        }
        if self.max_bytes_per_batch == 0 {
            return Err(Error::Config("max_bytes_per_batch must be at least 1".to_string()));
        }
        if self.max_count == 0 || self.max_size == 0 {
            return Err(Error::Config("run-wide max_count and max_size must be at least 1".to_string()));
        }
        if self.write_concern_timeout.is_zero() {
            return Err(Error::Config("write_concern_timeout must be non-zero".to_string()));
        }
        if let WriteConcern::Nodes(0) = self.batch_write_concern {
            return Err(Error::Config("WriteConcern::Nodes requires at least 1 node".to_string()));
        }
        Ok(())
    }
}

/// Cumulative per-invocation counters, reported through `get_status`
/// and in the terminal stop entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub batches: u64,
    pub docs_examined: u64,
    pub bytes_examined: u64,
    pub content_mismatches: u64,
    pub missing_index_keys: u64,
    pub extra_index_keys: u64,
    pub unreadable_docs: u64,
}

impl Counters {
    pub fn total_findings(&self) -> u64 {
        self.content_mismatches + self.missing_index_keys + self.extra_index_keys + self.unreadable_docs
    }

    /// Fold one batch outcome into the running totals.
    pub fn absorb(&mut self, result: &ValidationResult) {
        self.batches += 1;
        self.docs_examined += result.docs_examined;
        self.bytes_examined += result.bytes_examined;
        self.content_mismatches += result.content_mismatches;
        self.missing_index_keys += result.missing_index_keys;
        self.extra_index_keys += result.extra_index_keys;
        self.unreadable_docs += result.unreadable_docs;
    }
}

/// Per-batch outcome, produced by the batch validator and immutable
/// once produced. `last_key` feeds the next batch's start bound and the
/// resume point recorded in the health log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub first_key: DocKey,
    pub last_key: DocKey,
    pub docs_examined: u64,
    pub bytes_examined: u64,
    pub content_mismatches: u64,
    pub missing_index_keys: u64,
    pub extra_index_keys: u64,
    pub unreadable_docs: u64,
    pub elapsed: Duration,
}
