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
use std::time::Instant;

use tracing::debug;

use crate::healthlog::FindingKind;
use crate::storage::{CollectionStore, IndexSpec, StoredDocument};
use crate::types::{DocKey, ValidationMode, ValidationResult};
use crate::{digest::content_digest, Result};

use super::range_iter::Batch;

/// One inconsistency, attributed to a single document (or orphaned
/// index entry) so downstream consumers can act without re-scanning.
#[derive(Debug, Clone)]
pub struct Finding {
    pub kind: FindingKind,
    pub doc_key: DocKey,
    pub index: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub message: String,
}

/// Re-validates one batch: content digests, then index coverage as the
/// mode demands. Reads are read-only and go through the storage layer's
/// admission control; a single unreadable document is a finding, not a
/// batch failure.
pub struct BatchValidator {
    store: Arc<dyn CollectionStore>,
    ns: String,
    mode: ValidationMode,
}

impl BatchValidator {
    pub fn new(store: Arc<dyn CollectionStore>, ns: impl Into<String>, mode: ValidationMode) -> Self {
        BatchValidator {
            store,
            ns: ns.into(),
            mode,
        }
    }

    /// Validate one batch. `scan_lower` is the previous batch's
    /// exclusive boundary (the request start for the first batch):
    /// the extra-key reverse scan covers the contiguous stretch
    /// [scan_lower, last_key.successor()), so orphaned entries whose
    /// keys fall between observed documents are still seen.
    pub async fn validate(&self, batch: &Batch, scan_lower: &DocKey) -> Result<(ValidationResult, Vec<Finding>)> {
        let started = Instant::now();
        let mut findings = Vec::new();
        let mut docs_examined = 0u64;
        let mut bytes_examined = 0u64;

        let indexes = if self.mode.checks_missing_keys() || self.mode.checks_extra_keys() {
            self.store.list_indexes(&self.ns).await?
        } else {
            Vec::new()
        };

        for key in &batch.keys {
            match self.store.read_document(&self.ns, key).await {
                Ok(Some(doc)) => {
                    docs_examined += 1;
                    bytes_examined += doc.size;
                    self.check_content(&doc, &mut findings);
                    if self.mode.checks_missing_keys() {
                        self.check_missing_keys(&doc, &indexes, &mut findings).await?;
                    }
                }
                Ok(None) => {
                    // Raced with a legitimate delete: not examined,
                    // not an inconsistency.
                    debug!(ns = %self.ns, key = %key, "document vanished before validation");
                }
                Err(e) if e.is_fatal_for_invocation() => return Err(e),
                Err(e) => findings.push(Finding {
                    kind: FindingKind::Unreadable,
                    doc_key: key.clone(),
                    index: None,
                    expected: None,
                    actual: None,
                    message: format!("document read failed: {e}"),
                }),
            }
        }

        if self.mode.checks_extra_keys() {
            let scan_upper = batch.last_key.successor();
            self.check_extra_keys(scan_lower, &scan_upper, &indexes, &mut findings).await?;
        }

        let mut result = ValidationResult {
            first_key: batch.first_key.clone(),
            last_key: batch.last_key.clone(),
            docs_examined,
            bytes_examined,
            content_mismatches: 0,
            missing_index_keys: 0,
            extra_index_keys: 0,
            unreadable_docs: 0,
            elapsed: started.elapsed(),
        };
        for finding in &findings {
            match finding.kind {
                FindingKind::ContentMismatch => result.content_mismatches += 1,
                FindingKind::MissingIndexKey => result.missing_index_keys += 1,
                FindingKind::ExtraIndexKey => result.extra_index_keys += 1,
                FindingKind::Unreadable => result.unreadable_docs += 1,
            }
        }
        Ok((result, findings))
    }

    fn check_content(&self, doc: &StoredDocument, findings: &mut Vec<Finding>) {
        let actual = content_digest(&doc.body);
        if actual != doc.digest {
            findings.push(Finding {
                kind: FindingKind::ContentMismatch,
                doc_key: doc.key.clone(),
                index: None,
                expected: Some(doc.digest.clone()),
                actual: Some(actual),
                message: "stored digest does not match recomputed content digest".to_string(),
            });
        }
    }

    /// One finding per (document, index) no matter how many of the
    /// document's derived keys are absent.
    async fn check_missing_keys(
        &self,
        doc: &StoredDocument,
        indexes: &[IndexSpec],
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        for index in indexes {
            let mut missing = Vec::new();
            for value in index.derive_keys(&doc.body) {
                match self.store.index_entry_exists(&self.ns, &index.name, &value, &doc.key).await {
                    Ok(true) => {}
                    Ok(false) => missing.push(value),
                    Err(e) if e.is_fatal_for_invocation() => return Err(e),
                    Err(e) => {
                        findings.push(Finding {
                            kind: FindingKind::Unreadable,
                            doc_key: doc.key.clone(),
                            index: Some(index.name.clone()),
                            expected: None,
                            actual: None,
                            message: format!("index lookup failed: {e}"),
                        });
                        missing.clear();
                        break;
                    }
                }
            }
            if !missing.is_empty() {
                findings.push(Finding {
                    kind: FindingKind::MissingIndexKey,
                    doc_key: doc.key.clone(),
                    index: Some(index.name.clone()),
                    expected: Some(missing.join(", ")),
                    actual: None,
                    message: format!("document is missing {} expected key(s) in index {}", missing.len(), index.name),
                });
            }
        }
        Ok(())
    }

    /// Reverse-scan a key stretch that holds no live documents (the
    /// tail of the request range past the last observed key). Index
    /// entries can reference any key in the range, so the stretch
    /// still needs an orphan pass. No-op unless the mode checks extra
    /// keys.
    pub async fn sweep_orphans(&self, lower: &DocKey, upper: &DocKey) -> Result<Vec<Finding>> {
        let mut findings = Vec::new();
        if !self.mode.checks_extra_keys() || lower >= upper {
            return Ok(findings);
        }
        let indexes = self.store.list_indexes(&self.ns).await?;
        self.check_extra_keys(lower, upper, &indexes, &mut findings).await?;
        Ok(findings)
    }

    /// Reverse lookup over [lower, upper): every index entry pointing
    /// into the stretch must map back to a live document that still
    /// derives that key.
    async fn check_extra_keys(
        &self,
        lower: &DocKey,
        upper: &DocKey,
        indexes: &[IndexSpec],
        findings: &mut Vec<Finding>,
    ) -> Result<()> {
        for index in indexes {
            let entries = self
                .store
                .index_entries_for_range(&self.ns, &index.name, lower, upper)
                .await?;
            for (value, doc_key) in entries {
                match self.store.read_document(&self.ns, &doc_key).await {
                    Ok(Some(doc)) => {
                        if !index.derive_keys(&doc.body).contains(&value) {
                            findings.push(Finding {
                                kind: FindingKind::ExtraIndexKey,
                                doc_key,
                                index: Some(index.name.clone()),
                                expected: None,
                                actual: Some(value),
                                message: format!("index {} entry does not match the document's content", index.name),
                            });
                        }
                    }
                    Ok(None) => findings.push(Finding {
                        kind: FindingKind::ExtraIndexKey,
                        doc_key,
                        index: Some(index.name.clone()),
                        expected: None,
                        actual: Some(value),
                        message: format!("index {} entry references a document that does not exist", index.name),
                    }),
                    Err(e) if e.is_fatal_for_invocation() => return Err(e),
                    Err(e) => findings.push(Finding {
                        kind: FindingKind::Unreadable,
                        doc_key,
                        index: Some(index.name.clone()),
                        expected: None,
                        actual: None,
                        message: format!("reverse lookup read failed: {e}"),
                    }),
                }
            }
        }
        Ok(())
    }
}
