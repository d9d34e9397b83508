//! The durable registry of named checklists.
//!
//! Each CSV file in the checklist directory is one checklist, identified by
//! its file stem. A generation holds two indexes over the same items (one of
//! criterion texts, one of descriptions) plus the parsed items themselves.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AuditConfig;
use crate::document::{ChecklistItem, IndexedChunk, SearchHit};
use crate::error::{AuditError, Result};
use crate::generation::{Generation, GenerationCell};
use crate::index::VectorIndex;
use crate::ingest::Ingestor;
use crate::sources::{source_name, SourceSet};
use crate::store::{write_atomic, KnowledgeStore, Manifest, Query, RefreshOutcome};

pub const CRITERIA_INDEX_FILE: &str = "checklist.criteria.json";
pub const DESCRIPTIONS_INDEX_FILE: &str = "checklist.descriptions.json";
pub const ITEMS_FILE: &str = "checklist.items.json";
const CHECKLIST_MANIFEST_FILE: &str = "checklist.manifest.json";

const REQUIRED_COLUMNS: [&str; 3] = ["category", "criterion", "description"];

/// One complete build of the checklist registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChecklistCatalog {
    criteria: VectorIndex,
    descriptions: VectorIndex,
    items: BTreeMap<String, Vec<ChecklistItem>>,
}

impl ChecklistCatalog {
    pub fn criteria(&self) -> &VectorIndex {
        &self.criteria
    }

    pub fn descriptions(&self) -> &VectorIndex {
        &self.descriptions
    }

    /// Total number of items across all checklists.
    pub fn item_count(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    fn item_for(&self, chunk: &IndexedChunk) -> Option<&ChecklistItem> {
        self.items.get(&chunk.source_id).and_then(|items| items.get(chunk.local_index as usize))
    }
}

/// Which field of a checklist item a fallback lookup matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Criterion,
    Description,
}

/// A checklist item found by [`ChecklistStore::query_by_description_fallback`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChecklistMatch {
    pub item: ChecklistItem,
    pub distance: f32,
    pub field: MatchField,
}

/// Parse one checklist CSV.
///
/// # Errors
///
/// Returns [`AuditError::MalformedChecklistEntry`] (row 0) when the header
/// lacks a required column or the text is not valid CSV. Rows with an empty
/// criterion or a duplicate criterion are skipped with a warning.
pub fn parse_checklist(checklist: &str, csv_text: &str) -> Result<Vec<ChecklistItem>> {
    let malformed = |row: usize, reason: String| AuditError::MalformedChecklistEntry {
        checklist: checklist.to_string(),
        row,
        reason,
    };

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_text.as_bytes());

    let headers = rdr
        .headers()
        .map_err(|e| malformed(0, format!("unreadable header: {e}")))?
        .clone();
    let mut columns = [0usize; 3];
    for (slot, name) in columns.iter_mut().zip(REQUIRED_COLUMNS) {
        *slot = headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| malformed(0, format!("missing column '{name}'")))?;
    }
    let [category_col, criterion_col, description_col] = columns;

    let mut items = Vec::new();
    let mut seen = HashSet::new();
    for (i, record) in rdr.records().enumerate() {
        let row = i + 1;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(checklist, row, error = %e, "unparsable checklist row, skipped");
                continue;
            }
        };
        let field = |col: usize| record.get(col).unwrap_or_default().to_string();
        let criterion = field(criterion_col);
        if criterion.is_empty() {
            let err = malformed(row, "empty criterion".to_string());
            warn!(error = %err, "skipping checklist row");
            continue;
        }
        if !seen.insert(criterion.clone()) {
            let err = malformed(row, format!("duplicate criterion '{criterion}'"));
            warn!(error = %err, "skipping checklist row");
            continue;
        }
        items.push(ChecklistItem::new(
            checklist,
            field(category_col),
            criterion,
            field(description_col),
        ));
    }
    Ok(items)
}

/// Refreshable registry of checklists with criterion and description indexes.
pub struct ChecklistStore {
    name: String,
    source_dir: PathBuf,
    index_dir: PathBuf,
    max_match_distance: f32,
    ingestor: Ingestor,
    cell: GenerationCell<ChecklistCatalog>,
}

impl std::fmt::Debug for ChecklistStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecklistStore")
            .field("source_dir", &self.source_dir)
            .field("generation", &self.cell.current_id())
            .finish()
    }
}

impl ChecklistStore {
    /// Open the registry, warm-starting from persisted files when they match
    /// the current CSV files.
    pub async fn open(config: &AuditConfig, ingestor: Ingestor) -> Result<Self> {
        let source_dir = config.paths.checklist_dir.clone();
        let index_dir = config.paths.index_dir.clone();

        let sources = SourceSet::scan(&source_dir, &csv_extension())?;
        let fingerprint = sources.fingerprint();

        let catalog = match warm_start(&index_dir, &fingerprint, ingestor.dimensions()).await {
            Some(catalog) => {
                info!(
                    store = "checklist",
                    items = catalog.item_count(),
                    "loaded persisted generation"
                );
                catalog
            }
            None => {
                let catalog = build_catalog(&ingestor, &sources).await?;
                persist(&index_dir, &catalog, &fingerprint).await?;
                catalog
            }
        };

        let cell = GenerationCell::new(catalog, fingerprint);
        info!(store = "checklist", generation = cell.current_id(), "store ready");
        Ok(Self {
            name: "checklist".to_string(),
            source_dir,
            index_dir,
            max_match_distance: config.retrieval.max_match_distance,
            ingestor,
            cell,
        })
    }

    /// Registered checklist identifiers, sorted.
    pub fn checklist_names(&self) -> Vec<String> {
        self.cell.snapshot().content.items.keys().cloned().collect()
    }

    /// The items of checklist `name`, in file order.
    pub fn items(&self, name: &str) -> Result<Vec<ChecklistItem>> {
        self.cell
            .snapshot()
            .content
            .items
            .get(name)
            .cloned()
            .ok_or_else(|| AuditError::UnknownChecklist(name.to_string()))
    }

    pub fn snapshot(&self) -> Arc<Generation<ChecklistCatalog>> {
        self.cell.snapshot()
    }

    /// Find checklist items for `text` by criterion; when no criterion is
    /// within `max_match_distance`, search the descriptions instead.
    pub async fn query_by_description_fallback(
        &self,
        text: &str,
        k: usize,
        checklist: Option<&str>,
    ) -> Result<Vec<ChecklistMatch>> {
        let vector = self.ingestor.embed_query(&Query::text(text)).await?;
        let snapshot = self.cell.snapshot();
        let catalog = &snapshot.content;
        let filter = |c: &IndexedChunk| checklist.is_none_or(|name| c.source_id == name);
        let threshold = self.max_match_distance;

        let mut field = MatchField::Criterion;
        let mut hits: Vec<SearchHit> = catalog
            .criteria
            .search_filtered(&vector, k, filter)?
            .into_iter()
            .filter(|h| h.distance <= threshold)
            .collect();
        if hits.is_empty() {
            debug!(store = %self.name, query = text, "no criterion match, trying descriptions");
            field = MatchField::Description;
            hits = catalog
                .descriptions
                .search_filtered(&vector, k, filter)?
                .into_iter()
                .filter(|h| h.distance <= threshold)
                .collect();
        }

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                catalog.item_for(&hit.chunk).map(|item| ChecklistMatch {
                    item: item.clone(),
                    distance: hit.distance,
                    field,
                })
            })
            .collect())
    }

    async fn rebuild(&self) -> Result<RefreshOutcome> {
        let sources = SourceSet::scan(&self.source_dir, &csv_extension())?;
        let fingerprint = sources.fingerprint();
        let active = self.cell.snapshot();
        if active.fingerprint == fingerprint {
            return Ok(RefreshOutcome::Unchanged { generation: active.id });
        }

        let catalog = build_catalog(&self.ingestor, &sources).await?;
        persist(&self.index_dir, &catalog, &fingerprint).await?;
        let items = catalog.item_count();
        let previous = self.cell.swap(catalog, fingerprint);
        let generation = self.cell.current_id();
        info!(
            store = %self.name,
            generation,
            previous = previous.id,
            items,
            "activated new generation"
        );
        Ok(RefreshOutcome::Refreshed { generation })
    }
}

#[async_trait]
impl KnowledgeStore for ChecklistStore {
    fn name(&self) -> &str {
        &self.name
    }

    /// Search criterion texts; `source` restricts to one checklist.
    async fn query(&self, query: Query, k: usize, source: Option<&str>) -> Result<Vec<SearchHit>> {
        let vector = self.ingestor.embed_query(&query).await?;
        let snapshot = self.cell.snapshot();
        match source {
            Some(name) => {
                snapshot.content.criteria.search_filtered(&vector, k, |c| c.source_id == name)
            }
            None => snapshot.content.criteria.search(&vector, k),
        }
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

fn csv_extension() -> Vec<String> {
    vec!["csv".to_string()]
}

async fn build_catalog(ingestor: &Ingestor, sources: &SourceSet) -> Result<ChecklistCatalog> {
    let dims = ingestor.dimensions();
    let mut catalog = ChecklistCatalog {
        criteria: VectorIndex::new(dims),
        descriptions: VectorIndex::new(dims),
        items: BTreeMap::new(),
    };

    for file in &sources.files {
        let name = source_name(&file.path);
        if catalog.items.contains_key(&name) {
            warn!(
                store = "checklist",
                checklist = %name,
                path = %file.path.display(),
                "duplicate checklist name, skipped"
            );
            continue;
        }
        let text = match tokio::fs::read_to_string(&file.path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    store = "checklist",
                    path = %file.path.display(),
                    error = %e,
                    "cannot read checklist, skipped"
                );
                continue;
            }
        };
        let mut items = match parse_checklist(&name, &text) {
            Ok(items) => items,
            Err(e) => {
                warn!(store = "checklist", error = %e, "checklist file skipped");
                continue;
            }
        };

        let criteria: Vec<&str> = items.iter().map(|i| i.criterion.as_str()).collect();
        let descriptions: Vec<&str> = items.iter().map(|i| i.alternate_query()).collect();
        let criterion_vectors = ingestor.embedder().embed_batch(&criteria).await?;
        let description_vectors = ingestor.embedder().embed_batch(&descriptions).await?;
        if criterion_vectors.len() != items.len() || description_vectors.len() != items.len() {
            return Err(AuditError::EmbeddingError {
                provider: "batch".to_string(),
                message: format!("embedding count mismatch for checklist '{name}'"),
            });
        }

        for (i, (item, (criterion_vec, description_vec))) in items
            .iter_mut()
            .zip(criterion_vectors.into_iter().zip(description_vectors))
            .enumerate()
        {
            let chunk = |text: &str, embedding: Vec<f32>| IndexedChunk {
                source_id: name.clone(),
                page_number: 1,
                local_index: i as u32,
                text: text.to_string(),
                embedding,
            };
            catalog.criteria.add(chunk(&item.criterion, criterion_vec.clone()))?;
            catalog.descriptions.add(chunk(item.alternate_query(), description_vec))?;
            item.embedding = Some(criterion_vec);
        }
        debug!(store = "checklist", checklist = %name, items = items.len(), "parsed checklist");
        catalog.items.insert(name, items);
    }
    Ok(catalog)
}

async fn warm_start(
    index_dir: &Path,
    fingerprint: &str,
    dimensions: usize,
) -> Option<ChecklistCatalog> {
    let manifest = Manifest::read(&index_dir.join(CHECKLIST_MANIFEST_FILE)).await?;
    if manifest.fingerprint != fingerprint || manifest.dimensions != dimensions {
        debug!(store = "checklist", "persisted generation is stale");
        return None;
    }
    let loaded = async {
        let criteria = VectorIndex::load(index_dir.join(CRITERIA_INDEX_FILE)).await?;
        let descriptions = VectorIndex::load(index_dir.join(DESCRIPTIONS_INDEX_FILE)).await?;
        let raw = tokio::fs::read(index_dir.join(ITEMS_FILE)).await?;
        let items: BTreeMap<String, Vec<ChecklistItem>> = serde_json::from_slice(&raw)?;
        Ok::<_, AuditError>(ChecklistCatalog { criteria, descriptions, items })
    }
    .await;
    match loaded {
        Ok(catalog) => Some(catalog),
        Err(e) => {
            warn!(
                store = "checklist",
                error = %e,
                "persisted checklist files unusable, rebuilding"
            );
            None
        }
    }
}

async fn persist(index_dir: &Path, catalog: &ChecklistCatalog, fingerprint: &str) -> Result<()> {
    catalog.criteria.persist(index_dir.join(CRITERIA_INDEX_FILE)).await?;
    catalog.descriptions.persist(index_dir.join(DESCRIPTIONS_INDEX_FILE)).await?;
    write_atomic(&index_dir.join(ITEMS_FILE), &serde_json::to_vec(&catalog.items)?).await?;
    Manifest {
        store: "checklist".to_string(),
        fingerprint: fingerprint.to_string(),
        built_at: Utc::now(),
        dimensions: catalog.criteria.dimensions(),
    }
    .write(&index_dir.join(CHECKLIST_MANIFEST_FILE))
    .await
}
