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

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic content digest of a document body.
///
/// The digest is the sha256 of the canonical JSON rendering (object
/// keys sorted, no insignificant whitespace), hex encoded. The store
/// computes and persists this at write time; the validator recomputes
/// it from the body it reads back. Both sides must use this function.
pub fn content_digest(body: &Value) -> String {
    // serde_json::Map is ordered by key, so Display output is canonical.
    hex::encode(Sha256::digest(body.to_string().as_bytes()))
}
