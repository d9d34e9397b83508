//! The durable store of reference rules (standards, regulations).
//!
//! Every source file under the reference directory becomes one rule whose
//! identifier is the file stem. The active [`Generation`] is persisted to the
//! index directory and reused on the next start when the sources still match
//! its fingerprint.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::AuditConfig;
use crate::document::{ReferenceEntry, SearchHit};
use crate::error::{AuditError, Result};
use crate::generation::{Generation, GenerationCell};
use crate::index::VectorIndex;
use crate::ingest::Ingestor;
use crate::sources::{source_name, SourceSet};
use crate::store::{KnowledgeStore, Manifest, Query, RefreshOutcome};

/// File name of the persisted reference index.
pub const REFERENCE_INDEX_FILE: &str = "reference.index.json";
const REFERENCE_MANIFEST_FILE: &str = "reference.manifest.json";

/// Refreshable store of reference-rule passages.
pub struct ReferenceStore {
    name: String,
    source_dir: PathBuf,
    extensions: Vec<String>,
    index_dir: PathBuf,
    ingestor: Ingestor,
    cell: GenerationCell<VectorIndex>,
}

impl std::fmt::Debug for ReferenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceStore")
            .field("source_dir", &self.source_dir)
            .field("generation", &self.cell.current_id())
            .finish()
    }
}

impl ReferenceStore {
    /// Open the store: warm-start from the persisted generation when it
    /// matches the current sources, otherwise build from source files.
    pub async fn open(config: &AuditConfig, ingestor: Ingestor) -> Result<Self> {
        let source_dir = config.paths.reference_dir.clone();
        let extensions = config.workflow.reference_extensions.clone();
        let index_dir = config.paths.index_dir.clone();

        let sources = SourceSet::scan(&source_dir, &extensions)?;
        let fingerprint = sources.fingerprint();

        let index = match warm_start(&index_dir, &fingerprint, ingestor.dimensions()).await {
            Some(index) => {
                info!(store = "reference", chunks = index.len(), "loaded persisted generation");
                index
            }
            None => {
                let index = build_index(&ingestor, &sources).await?;
                persist(&index_dir, &index, &fingerprint).await?;
                index
            }
        };

        let cell = GenerationCell::new(index, fingerprint);
        info!(store = "reference", generation = cell.current_id(), "store ready");
        Ok(Self {
            name: "reference".to_string(),
            source_dir,
            extensions,
            index_dir,
            ingestor,
            cell,
        })
    }

    /// Identifiers of the rules in the active generation, sorted.
    pub fn rules(&self) -> Vec<String> {
        let snapshot = self.cell.snapshot();
        let mut seen = HashSet::new();
        let mut rules: Vec<String> = snapshot
            .content
            .chunks()
            .iter()
            .filter(|c| seen.insert(c.source_id.as_str()))
            .map(|c| c.source_id.clone())
            .collect();
        rules.sort();
        rules
    }

    /// The active generation.
    pub fn snapshot(&self) -> std::sync::Arc<Generation<VectorIndex>> {
        self.cell.snapshot()
    }

    /// Reference passages for `text`, restricted to `rule` when given.
    pub async fn references(
        &self,
        text: &str,
        k: usize,
        rule: Option<&str>,
    ) -> Result<Vec<ReferenceEntry>> {
        let hits = self.query(Query::text(text), k, rule).await?;
        Ok(hits.into_iter().map(ReferenceEntry::from).collect())
    }

    async fn rebuild(&self) -> Result<RefreshOutcome> {
        let sources = SourceSet::scan(&self.source_dir, &self.extensions)?;
        let fingerprint = sources.fingerprint();
        let active = self.cell.snapshot();
        if active.fingerprint == fingerprint {
            return Ok(RefreshOutcome::Unchanged { generation: active.id });
        }

        let index = build_index(&self.ingestor, &sources).await?;
        persist(&self.index_dir, &index, &fingerprint).await?;
        let chunks = index.len();
        let previous = self.cell.swap(index, fingerprint);
        let generation = self.cell.current_id();
        info!(
            store = %self.name,
            generation,
            previous = previous.id,
            chunks,
            "activated new generation"
        );
        Ok(RefreshOutcome::Refreshed { generation })
    }
}

#[async_trait]
impl KnowledgeStore for ReferenceStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, query: Query, k: usize, source: Option<&str>) -> Result<Vec<SearchHit>> {
        let vector = self.ingestor.embed_query(&query).await?;
        let snapshot = self.cell.snapshot();
        let hits = match source {
            Some(rule) => snapshot.content.search_filtered(&vector, k, |c| c.source_id == rule)?,
            None => snapshot.content.search(&vector, k)?,
        };
        debug!(
            store = %self.name,
            generation = snapshot.id,
            rule = ?source,
            hits = hits.len(),
            "reference query"
        );
        Ok(hits)
    }

    async fn refresh(&self) -> Result<RefreshOutcome> {
        let Some(_guard) = self.cell.try_begin_refresh() else {
            debug!(store = %self.name, "refresh already running, suppressed");
            return Ok(RefreshOutcome::Suppressed);
        };
        self.rebuild().await.map_err(|e| {
            warn!(
                store = %self.name,
                generation = self.cell.current_id(),
                error = %e,
                "refresh failed, keeping previous generation"
            );
            AuditError::StoreRefreshFailure { store: self.name.clone(), reason: e.to_string() }
        })
    }

    fn generation(&self) -> u64 {
        self.cell.current_id()
    }
}

async fn warm_start(
    index_dir: &std::path::Path,
    fingerprint: &str,
    dimensions: usize,
) -> Option<VectorIndex> {
    let manifest = Manifest::read(&index_dir.join(REFERENCE_MANIFEST_FILE)).await?;
    if manifest.fingerprint != fingerprint || manifest.dimensions != dimensions {
        debug!(store = "reference", "persisted generation is stale");
        return None;
    }
    match VectorIndex::load(index_dir.join(REFERENCE_INDEX_FILE)).await {
        Ok(index) if index.dimensions() == dimensions => Some(index),
        Ok(_) => None,
        Err(e) => {
            warn!(store = "reference", error = %e, "persisted index unusable, rebuilding");
            None
        }
    }
}

/// Index every readable source file. Unreadable files are skipped.
async fn build_index(ingestor: &Ingestor, sources: &SourceSet) -> Result<VectorIndex> {
    let mut index = VectorIndex::new(ingestor.dimensions());
    let mut seen = HashSet::new();

    for file in &sources.files {
        let rule = source_name(&file.path);
        if !seen.insert(rule.clone()) {
            warn!(
                store = "reference",
                rule = %rule,
                path = %file.path.display(),
                "duplicate rule name, skipped"
            );
            continue;
        }
        let bytes = match tokio::fs::read(&file.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    store = "reference",
                    path = %file.path.display(),
                    error = %e,
                    "cannot read reference file, skipped"
                );
                continue;
            }
        };
        match ingestor.ingest(&rule, &bytes).await {
            Ok(chunks) => index.extend(chunks)?,
            Err(AuditError::UnreadableDocument { reason, .. }) => {
                warn!(
                    store = "reference",
                    rule = %rule,
                    reason = %reason,
                    "unreadable reference file, skipped"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(index)
}

async fn persist(
    index_dir: &std::path::Path,
    index: &VectorIndex,
    fingerprint: &str,
) -> Result<()> {
    index.persist(index_dir.join(REFERENCE_INDEX_FILE)).await?;
    Manifest {
        store: "reference".to_string(),
        fingerprint: fingerprint.to_string(),
        built_at: Utc::now(),
        dimensions: index.dimensions(),
    }
    .write(&index_dir.join(REFERENCE_MANIFEST_FILE))
    .await
}
