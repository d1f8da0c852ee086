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

use crate::storage::CollectionStore;
use crate::types::{CheckRequest, DocKey};
use crate::{Error, Result};

/// A contiguous key sub-range sized for one validation pass.
///
/// Batches over one request are contiguous, non-overlapping, ascending,
/// and collectively cover [start, end).
#[derive(Debug, Clone)]
pub struct Batch {
    pub first_key: DocKey,
    pub last_key: DocKey,
    pub keys: Vec<DocKey>,
    pub bytes: u64,
}

/// Produces batches over the request range on demand.
///
/// The next batch always starts after the last key *actually observed*,
/// never from a pre-computed plan, so concurrent inserts and deletes
/// shift batch boundaries but never stall or skip the scan.
pub struct RangeIterator {
    store: Arc<dyn CollectionStore>,
    ns: String,
    start: DocKey,
    end: DocKey,
    max_docs: usize,
    max_bytes: u64,
}

impl RangeIterator {
    pub fn new(store: Arc<dyn CollectionStore>, request: &CheckRequest) -> Self {
        RangeIterator {
            store,
            ns: request.ns.clone(),
            start: request.start.clone(),
            end: request.end.clone(),
            max_docs: request.max_docs_per_batch,
            max_bytes: request.max_bytes_per_batch,
        }
    }

    /// Next batch after `after` (exclusive), or `None` when the range
    /// is exhausted. Never returns an empty batch.
    pub async fn next_batch(&self, after: Option<&DocKey>) -> Result<Option<Batch>> {
        let (from, inclusive) = match after {
            Some(key) => {
                if *key >= self.end {
                    return Ok(None);
                }
                (key, false)
            }
            None => (&self.start, true),
        };

        let scanned = self
            .store
            .keys_in_range(&self.ns, from, inclusive, &self.end, self.max_docs)
            .await
            .map_err(|e| match e {
                // A vanished namespace means the cursor cannot be
                // reopened; fatal for the invocation.
                Error::NamespaceNotFound(ns) => Error::CursorFailed(format!("namespace {ns} no longer exists")),
                other => other,
            })?;

        if scanned.is_empty() {
            return Ok(None);
        }

        // Cut at the byte budget, but always keep at least one key so
        // oversized documents cannot wedge the scan.
        let mut keys = Vec::with_capacity(scanned.len());
        let mut bytes = 0u64;
        for (key, size) in scanned {
            if !keys.is_empty() && bytes + size > self.max_bytes {
                break;
            }
            bytes += size;
            keys.push(key);
        }

        let first_key = keys[0].clone();
        let last_key = keys[keys.len() - 1].clone();
        Ok(Some(Batch {
            first_key,
            last_key,
            keys,
            bytes,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IndexSpec, MemStore};
    use serde_json::json;

    async fn setup(n: u64) -> Arc<MemStore> {
        let store = Arc::new(MemStore::new());
        store.create_collection("db.c", vec![IndexSpec::new("x_1", "x")]).await;
        for i in 0..n {
            store.upsert("db.c", DocKey::from_u64(i), json!({"x": i})).await.unwrap();
        }
        store
    }

    fn request(start: u64, end: u64, max_docs: usize, max_bytes: u64) -> CheckRequest {
        CheckRequest::new("db.c", DocKey::from_u64(start), DocKey::from_u64(end)).with_batch_limits(max_docs, max_bytes)
    }

    #[tokio::test]
    async fn batches_are_contiguous_and_exhaustive() {
        let store = setup(25).await;
        let iter = RangeIterator::new(store, &request(0, 25, 10, u64::MAX));

        let mut seen = Vec::new();
        let mut after: Option<DocKey> = None;
        let mut batches = 0;
        while let Some(batch) = iter.next_batch(after.as_ref()).await.unwrap() {
            assert!(!batch.keys.is_empty());
            seen.extend(batch.keys.iter().cloned());
            after = Some(batch.last_key.clone());
            batches += 1;
        }

        assert_eq!(batches, 3);
        assert_eq!(seen.len(), 25);
        let expected: Vec<DocKey> = (0..25).map(DocKey::from_u64).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn byte_budget_cuts_batches_but_keeps_one_key() {
        let store = setup(10).await;
        // Budget smaller than any single document.
        let iter = RangeIterator::new(store, &request(0, 10, 100, 1));
        let batch = iter.next_batch(None).await.unwrap().unwrap();
        assert_eq!(batch.keys.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_range_returns_end() {
        let store = setup(5).await;
        let iter = RangeIterator::new(store, &request(0, 5, 10, u64::MAX));
        let batch = iter.next_batch(None).await.unwrap().unwrap();
        assert_eq!(batch.keys.len(), 5);
        assert!(iter.next_batch(Some(&batch.last_key)).await.unwrap().is_none());
        // afterKey at or past the end bound is End without a scan.
        assert!(iter.next_batch(Some(&DocKey::from_u64(99))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deletes_after_boundary_do_not_stall() {
        let store = setup(20).await;
        let iter = RangeIterator::new(store.clone(), &request(0, 20, 10, u64::MAX));
        let first = iter.next_batch(None).await.unwrap().unwrap();

        // Everything the next batch would hold disappears.
        for i in 10..20 {
            store.delete("db.c", &DocKey::from_u64(i)).await.unwrap();
        }
        assert!(iter.next_batch(Some(&first.last_key)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dropped_collection_is_a_cursor_failure() {
        let store = setup(5).await;
        let iter = RangeIterator::new(store.clone(), &request(0, 5, 10, u64::MAX));
        store.drop_collection("db.c").await;
        let err = iter.next_batch(None).await.unwrap_err();
        assert!(matches!(err, Error::CursorFailed(_)));
    }
}
