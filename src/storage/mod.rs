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

pub mod mem;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::types::DocKey;
use crate::{Error, Result};

pub use mem::MemStore;

/// A document as stored: body plus the digest persisted at write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub key: DocKey,
    pub body: Value,
    /// Digest recorded when the document was last written; the checker
    /// recomputes from `body` and compares.
    pub digest: String,
    pub size: u64,
}

/// Canonical encoding of one index key value. Array-valued fields fan
/// out into one `IndexValue` per element.
pub type IndexValue = String;

/// A declared secondary index: name plus the top-level field it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub field: String,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, field: impl Into<String>) -> Self {
        IndexSpec {
            name: name.into(),
            field: field.into(),
        }
    }

    /// The index keys this document should produce. A missing field
    /// produces no keys; an array field produces one key per element.
    pub fn derive_keys(&self, body: &Value) -> Vec<IndexValue> {
        match body.get(&self.field) {
            None => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(|v| v.to_string()).collect(),
            Some(v) => vec![v.to_string()],
        }
    }
}

/// Storage collaborator interface consumed by the checker.
///
/// The checker never writes through this trait; it performs read-only,
/// point-in-time access to documents and index entries.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Keys in the given sub-range, ascending, with stored sizes.
    /// `start` is inclusive when `start_inclusive`, exclusive otherwise;
    /// `end` is always exclusive. Returns at most `limit` keys.
    async fn keys_in_range(
        &self,
        ns: &str,
        start: &DocKey,
        start_inclusive: bool,
        end: &DocKey,
        limit: usize,
    ) -> Result<Vec<(DocKey, u64)>>;

    /// Point read. `Ok(None)` means the document no longer exists,
    /// which the validator treats as a benign race with a delete.
    async fn read_document(&self, ns: &str, key: &DocKey) -> Result<Option<StoredDocument>>;

    /// Indexes declared on the collection.
    async fn list_indexes(&self, ns: &str) -> Result<Vec<IndexSpec>>;

    /// Whether an entry (value, doc key) exists in the named index.
    async fn index_entry_exists(&self, ns: &str, index: &str, value: &IndexValue, key: &DocKey) -> Result<bool>;

    /// Index entries whose referenced document key lies in
    /// [lower, upper), used for reverse (extra-key) lookup.
    async fn index_entries_for_range(
        &self,
        ns: &str,
        index: &str,
        lower: &DocKey,
        upper: &DocKey,
    ) -> Result<Vec<(IndexValue, DocKey)>>;
}

/// Bounded admission control for checker reads.
///
/// The checker's document reads queue on a fixed pool of tickets and
/// time out instead of blocking foreground traffic indefinitely; a
/// timed-out read surfaces as an unreadable-document finding, never as
/// an unbounded stall.
#[derive(Debug, Clone)]
pub struct ReadTickets {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl ReadTickets {
    pub fn new(permits: usize, timeout: Duration) -> Self {
        ReadTickets {
            permits: Arc::new(Semaphore::new(permits)),
            timeout,
        }
    }

    /// Acquire one read ticket, waiting at most the configured timeout.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(self.timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::Storage("read ticket pool closed".to_string())),
            Err(_) => Err(Error::TicketTimeout(self.timeout)),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for ReadTickets {
    fn default() -> Self {
        // 128 concurrent checker reads, 5s queueing bound.
        ReadTickets::new(128, Duration::from_secs(5))
    }
}
