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

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::digest::content_digest;
use crate::types::DocKey;
use crate::{Error, Result};

use super::{CollectionStore, IndexSpec, IndexValue, ReadTickets, StoredDocument};

struct Collection {
    docs: BTreeMap<DocKey, StoredDocument>,
    indexes: Vec<IndexSpec>,
    /// (index name, index value, referenced doc key).
    entries: BTreeSet<(String, IndexValue, DocKey)>,
}

impl Collection {
    fn new(indexes: Vec<IndexSpec>) -> Self {
        Collection {
            docs: BTreeMap::new(),
            indexes,
            entries: BTreeSet::new(),
        }
    }

    fn remove_entries_for(&mut self, key: &DocKey) {
        self.entries.retain(|(_, _, doc)| doc != key);
    }

    fn add_entries_for(&mut self, key: &DocKey, body: &Value) {
        for index in &self.indexes {
            for value in index.derive_keys(body) {
                self.entries.insert((index.name.clone(), value, key.clone()));
            }
        }
    }
}

/// In-memory implementation of [`CollectionStore`], one per node.
///
/// Each replica owns its own `MemStore`, so corruption planted on one
/// node's copy stays invisible to the others. Digests and index
/// entries are maintained at write time with the same functions the
/// validator uses at check time; the fault-injection methods are the
/// only way to make the two disagree.
pub struct MemStore {
    collections: RwLock<HashMap<String, Collection>>,
    tickets: ReadTickets,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::with_tickets(ReadTickets::default())
    }

    pub fn with_tickets(tickets: ReadTickets) -> Self {
        MemStore {
            collections: RwLock::new(HashMap::new()),
            tickets,
        }
    }

    pub fn read_tickets(&self) -> &ReadTickets {
        &self.tickets
    }

    pub async fn create_collection(&self, ns: &str, indexes: Vec<IndexSpec>) {
        let mut collections = self.collections.write().await;
        collections.entry(ns.to_string()).or_insert_with(|| Collection::new(indexes));
    }

    pub async fn drop_collection(&self, ns: &str) {
        self.collections.write().await.remove(ns);
    }

    /// Insert or replace a document, recomputing its stored digest and
    /// its secondary index entries.
    pub async fn upsert(&self, ns: &str, key: DocKey, body: Value) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .get_mut(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;

        coll.remove_entries_for(&key);
        coll.add_entries_for(&key, &body);

        let digest = content_digest(&body);
        let size = body.to_string().len() as u64;
        coll.docs.insert(
            key.clone(),
            StoredDocument {
                key,
                body,
                digest,
                size,
            },
        );
        Ok(())
    }

    pub async fn delete(&self, ns: &str, key: &DocKey) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .get_mut(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
        coll.remove_entries_for(key);
        coll.docs.remove(key);
        Ok(())
    }

    pub async fn doc_count(&self, ns: &str) -> usize {
        let collections = self.collections.read().await;
        collections.get(ns).map(|c| c.docs.len()).unwrap_or(0)
    }

    /// Fault injection: rewrite a document body without refreshing its
    /// stored digest or index entries, simulating on-disk corruption.
    pub async fn corrupt_document_body(&self, ns: &str, key: &DocKey, body: Value) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .get_mut(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
        let doc = coll
            .docs
            .get_mut(key)
            .ok_or_else(|| Error::Storage(format!("no document at key {key} in {ns}")))?;
        doc.body = body;
        Ok(())
    }

    /// Fault injection: drop every entry the named index holds for one
    /// document, without touching the document.
    pub async fn suppress_index_entries(&self, ns: &str, index: &str, key: &DocKey) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .get_mut(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
        coll.entries.retain(|(idx, _, doc)| !(idx == index && doc == key));
        Ok(())
    }

    /// Fault injection: plant an index entry with no matching document
    /// state behind it.
    pub async fn plant_index_entry(&self, ns: &str, index: &str, value: IndexValue, key: DocKey) -> Result<()> {
        let mut collections = self.collections.write().await;
        let coll = collections
            .get_mut(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
        coll.entries.insert((index.to_string(), value, key));
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        MemStore::new()
    }
}

#[async_trait]
impl CollectionStore for MemStore {
    async fn keys_in_range(
        &self,
        ns: &str,
        start: &DocKey,
        start_inclusive: bool,
        end: &DocKey,
        limit: usize,
    ) -> Result<Vec<(DocKey, u64)>> {
        let collections = self.collections.read().await;
        let coll = collections
            .get(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;

        let lower = if start_inclusive {
            Bound::Included(start.clone())
        } else {
            Bound::Excluded(start.clone())
        };
        let keys = coll
            .docs
            .range((lower, Bound::Excluded(end.clone())))
            .take(limit)
            .map(|(k, d)| (k.clone(), d.size))
            .collect();
        Ok(keys)
    }

    async fn read_document(&self, ns: &str, key: &DocKey) -> Result<Option<StoredDocument>> {
        let _ticket = self.tickets.acquire().await?;
        let collections = self.collections.read().await;
        let coll = collections
            .get(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
        Ok(coll.docs.get(key).cloned())
    }

    async fn list_indexes(&self, ns: &str) -> Result<Vec<IndexSpec>> {
        let collections = self.collections.read().await;
        let coll = collections
            .get(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
        Ok(coll.indexes.clone())
    }

    async fn index_entry_exists(&self, ns: &str, index: &str, value: &IndexValue, key: &DocKey) -> Result<bool> {
        let collections = self.collections.read().await;
        let coll = collections
            .get(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
        Ok(coll
            .entries
            .contains(&(index.to_string(), value.clone(), key.clone())))
    }

    async fn index_entries_for_range(
        &self,
        ns: &str,
        index: &str,
        lower: &DocKey,
        upper: &DocKey,
    ) -> Result<Vec<(IndexValue, DocKey)>> {
        let collections = self.collections.read().await;
        let coll = collections
            .get(ns)
            .ok_or_else(|| Error::NamespaceNotFound(ns.to_string()))?;
        Ok(coll
            .entries
            .iter()
            .filter(|(idx, _, doc)| idx == index && doc >= lower && doc < upper)
            .map(|(_, value, doc)| (value.clone(), doc.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_docs(n: u64) -> MemStore {
        let store = MemStore::new();
        store
            .create_collection("db.coll", vec![IndexSpec::new("x_1", "x")])
            .await;
        for i in 0..n {
            store
                .upsert("db.coll", DocKey::from_u64(i), json!({"x": i, "pad": "p"}))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn range_scan_respects_bounds_and_limit() {
        let store = store_with_docs(20).await;
        let keys = store
            .keys_in_range("db.coll", &DocKey::from_u64(5), true, &DocKey::from_u64(15), 100)
            .await
            .unwrap();
        assert_eq!(keys.len(), 10);
        assert_eq!(keys[0].0, DocKey::from_u64(5));
        assert_eq!(keys[9].0, DocKey::from_u64(14));

        let keys = store
            .keys_in_range("db.coll", &DocKey::from_u64(5), false, &DocKey::from_u64(15), 3)
            .await
            .unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].0, DocKey::from_u64(6));
    }

    #[tokio::test]
    async fn upsert_maintains_index_entries() {
        let store = store_with_docs(1).await;
        let key = DocKey::from_u64(0);
        assert!(store
            .index_entry_exists("db.coll", "x_1", &"0".to_string(), &key)
            .await
            .unwrap());

        store.upsert("db.coll", key.clone(), json!({"x": 7})).await.unwrap();
        assert!(!store
            .index_entry_exists("db.coll", "x_1", &"0".to_string(), &key)
            .await
            .unwrap());
        assert!(store
            .index_entry_exists("db.coll", "x_1", &"7".to_string(), &key)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_removes_doc_and_entries() {
        let store = store_with_docs(1).await;
        let key = DocKey::from_u64(0);
        store.delete("db.coll", &key).await.unwrap();
        assert!(store.read_document("db.coll", &key).await.unwrap().is_none());
        assert!(store
            .index_entries_for_range("db.coll", "x_1", &DocKey::min(), &DocKey::from_u64(u64::MAX))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn missing_namespace_is_an_error() {
        let store = MemStore::new();
        let err = store
            .keys_in_range("nope", &DocKey::min(), true, &DocKey::from_u64(1), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound(_)));
    }
}
