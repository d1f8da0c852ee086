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

//! Online replicated data-consistency checker.
//!
//! A background service that walks a collection in deterministic key
//! order, independently re-validates each document's content digest and
//! secondary-index coverage on every node of a replica set, and records
//! results in a replicated, append-only health log. Detection and
//! durable reporting only; nothing here repairs data.

mod error;

pub mod checker;
pub mod digest;
pub mod healthlog;
pub mod repl;
pub mod storage;
pub mod types;

pub use checker::{CheckCoordinator, CheckLifecycle, CheckStatus, CheckerService};
pub use error::{Error, Result};
pub use healthlog::{EntryKind, FindingKind, HealthLog, HealthLogEntry, HealthLogFilter, HealthLogWriter, Severity, StopReason};
pub use repl::{ClusterDispatcher, ReplayMode, ReplicaSet};
pub use types::{CheckRequest, Counters, DocKey, ValidationMode, WriteConcern};

use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

// Global cancellation token for datacheck background tasks (checker
// coordinators and replica set appliers).
static GLOBAL_SERVICES_CANCEL_TOKEN: OnceLock<CancellationToken> = OnceLock::new();

/// Initialize the global services cancellation token.
pub fn init_services_cancel_token(cancel_token: CancellationToken) -> Result<()> {
    GLOBAL_SERVICES_CANCEL_TOKEN
        .set(cancel_token)
        .map_err(|_| Error::Config("services cancel token already initialized".to_string()))
}

/// Get the global services cancellation token, if initialized.
pub fn get_services_cancel_token() -> Option<&'static CancellationToken> {
    GLOBAL_SERVICES_CANCEL_TOKEN.get()
}

/// Create and initialize the global services cancellation token.
pub fn create_services_cancel_token() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let _ = init_services_cancel_token(cancel_token.clone());
    cancel_token
}

/// Shut down all datacheck services gracefully. Running checks stop
/// after their current batch and write interrupted stop entries.
pub fn shutdown_services() {
    if let Some(cancel_token) = GLOBAL_SERVICES_CANCEL_TOKEN.get() {
        cancel_token.cancel();
    }
}
