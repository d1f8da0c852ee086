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

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Custom error type for datacheck operations.
///
/// Per-document inconsistency findings are *not* errors; they are
/// first-class health log output. This enum covers configuration
/// rejection, storage/cursor failures that abort an invocation, and
/// replication-boundary failures such as write concern timeouts.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("range cursor failed: {0}")]
    CursorFailed(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("write concern not satisfied within {0:?}")]
    WriteConcernTimeout(Duration),

    #[error("read ticket not granted within {0:?}")]
    TicketTimeout(Duration),

    #[error("node is not primary")]
    NotPrimary,

    #[error("check invocation not found: {0}")]
    InvocationNotFound(Uuid),

    #[error("a check is already running on namespace {0}")]
    CheckInProgress(String),

    #[error("check cancelled")]
    Cancelled,

    #[error("other error: {0}")]
    Other(String),
}

/// A specialized Result type for datacheck operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Create an Other error from any error type.
    pub fn other<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Other(error.into().to_string())
    }

    /// True when the error should abort a whole invocation rather than
    /// be recorded as an unreadable-document finding.
    pub fn is_fatal_for_invocation(&self) -> bool {
        matches!(self, Error::CursorFailed(_) | Error::NamespaceNotFound(_) | Error::Config(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        std::io::Error::other(err)
    }
}
