//! The capability interface shared by refreshable stores.
//!
//! The reference and checklist stores are interchangeable behind
//! [`KnowledgeStore`]: callers query, refresh and inspect the active
//! generation without knowing which kind of store they hold.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::SearchHit;
use crate::error::Result;

/// What to search for.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Free text, embedded by the store's provider.
    Text(String),
    /// A precomputed embedding.
    Vector(Vec<f32>),
}

impl Query {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<f32>> for Query {
    fn from(vector: Vec<f32>) -> Self {
        Self::Vector(vector)
    }
}

/// Result of a [`KnowledgeStore::refresh`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new generation was built and activated.
    Refreshed { generation: u64 },
    /// Sources are unchanged; the active generation stays.
    Unchanged { generation: u64 },
    /// Another refresh of this store was already running.
    Suppressed,
}

/// A durable, refreshable store of indexed chunks.
///
/// Reads always go to the generation active at call time. A failed refresh
/// leaves that generation in place and reports
/// [`AuditError::StoreRefreshFailure`](crate::AuditError::StoreRefreshFailure).
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Identifier used in logs and change events.
    fn name(&self) -> &str;

    /// Return up to `k` chunks closest to `query`, nearest first, optionally
    /// restricted to one `source`.
    async fn query(&self, query: Query, k: usize, source: Option<&str>) -> Result<Vec<SearchHit>>;

    /// Rebuild from source files if they changed since the active generation.
    async fn refresh(&self) -> Result<RefreshOutcome>;

    /// Id of the active generation.
    fn generation(&self) -> u64;
}

/// Sidecar describing the generation held in a store's persisted files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub(crate) struct Manifest {
    pub store: String,
    pub fingerprint: String,
    pub built_at: DateTime<Utc>,
    pub dimensions: usize,
}

impl Manifest {
    /// Read a manifest; a missing or unparsable file is `None`.
    pub async fn read(path: &Path) -> Option<Self> {
        let data = tokio::fs::read(path).await.ok()?;
        match serde_json::from_slice(&data) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ignoring unreadable manifest");
                None
            }
        }
    }

    /// Write the manifest atomically.
    pub async fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?).await
    }
}

/// Write `data` to a sibling temporary file and rename it over `path`.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// The temporary sibling used while writing `path`.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
