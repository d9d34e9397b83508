//! Data types for chunks, checklist items, extractions, verdicts, and results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::CriterionState;

/// One page of text produced by a [`PageExtractor`](crate::PageExtractor).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Page {
    /// 1-based page number.
    pub page_number: u32,
    /// The raw page text. May be empty.
    pub text: String,
}

/// A unit of searchable text with its embedding and positional metadata.
///
/// `local_index` is strictly increasing within one `source_id`, so the
/// sentences before and after a match can be found by offset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexedChunk {
    /// The document or checklist that owns this chunk.
    pub source_id: String,
    /// 1-based page the text came from.
    pub page_number: u32,
    /// Position of this chunk within its source.
    pub local_index: u32,
    /// The chunk text.
    pub text: String,
    /// The vector embedding for `text`.
    pub embedding: Vec<f32>,
}

impl IndexedChunk {
    /// False for the zero vector, which an embedder returns for text with
    /// nothing to embed (a page number, a lone bullet).
    pub fn has_signal(&self) -> bool {
        self.embedding.iter().any(|x| *x != 0.0)
    }
}

/// A retrieved [`IndexedChunk`] paired with its distance to the query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    /// The retrieved chunk.
    pub chunk: IndexedChunk,
    /// Euclidean distance to the query (lower is more relevant).
    pub distance: f32,
}

/// A passage of reference-rule text returned for a criterion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReferenceEntry {
    /// The standard or rule document this passage belongs to.
    pub rule: String,
    pub page_number: u32,
    pub local_index: u32,
    pub text: String,
    /// Distance to the criterion query at retrieval time.
    pub distance: f32,
}

impl From<SearchHit> for ReferenceEntry {
    fn from(hit: SearchHit) -> Self {
        Self {
            rule: hit.chunk.source_id,
            page_number: hit.chunk.page_number,
            local_index: hit.chunk.local_index,
            text: hit.chunk.text,
            distance: hit.distance,
        }
    }
}

/// A single criterion of a named checklist.
///
/// Uniquely keyed by `(checklist_name, criterion)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChecklistItem {
    pub checklist_name: String,
    pub category: String,
    pub criterion: String,
    /// Free-text description, used as the alternate query on retry.
    pub description: String,
    /// Embedding of the criterion text, when the item came from a store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl ChecklistItem {
    pub fn new(
        checklist_name: impl Into<String>,
        category: impl Into<String>,
        criterion: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            checklist_name: checklist_name.into(),
            category: category.into(),
            criterion: criterion.into(),
            description: description.into(),
            embedding: None,
        }
    }

    /// The text used for the retry query: the description when present,
    /// otherwise the criterion itself.
    pub fn alternate_query(&self) -> &str {
        if self.description.trim().is_empty() { &self.criterion } else { &self.description }
    }

    /// A copy without the embedding, for result records.
    pub(crate) fn without_embedding(&self) -> Self {
        Self { embedding: None, ..self.clone() }
    }
}

/// Which extraction/evaluation pass a call belongs to.
///
/// There are exactly two: the initial pass and the single retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attempt {
    Initial,
    Retry,
}

impl Attempt {
    /// 1 for the initial pass, 2 for the retry.
    pub fn number(self) -> u8 {
        match self {
            Self::Initial => 1,
            Self::Retry => 2,
        }
    }
}

/// The best-matching subject passage for a criterion, with its neighbours.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionRecord {
    pub criterion: String,
    pub matched_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_after: Option<String>,
    pub source_id: String,
    pub page_number: u32,
    pub local_index: u32,
    pub distance: f32,
    pub attempt: Attempt,
}

/// Outcome status of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Validated,
    Retry,
    Flagged,
}

/// The decision reached for a criterion, with a short human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationVerdict {
    pub status: VerdictStatus,
    pub reason: String,
}

impl EvaluationVerdict {
    pub fn validated(reason: impl Into<String>) -> Self {
        Self { status: VerdictStatus::Validated, reason: reason.into() }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self { status: VerdictStatus::Retry, reason: reason.into() }
    }

    pub fn flagged(reason: impl Into<String>) -> Self {
        Self { status: VerdictStatus::Flagged, reason: reason.into() }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != VerdictStatus::Retry
    }
}

/// Everything known about one criterion after a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionResult {
    pub item: ChecklistItem,
    /// One record per attempt that found a passage.
    pub extractions: Vec<ExtractionRecord>,
    pub references: Vec<ReferenceEntry>,
    pub verdict: EvaluationVerdict,
    pub summary_text: String,
    /// How many evaluation passes ran (0 when the run timed out first).
    pub attempts: u8,
    pub state: CriterionState,
}

/// The finalized result set of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditReport {
    pub run_id: String,
    pub document_name: String,
    pub checklist_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub standard: Option<String>,
    pub started_at: DateTime<Utc>,
    pub processing_time_secs: f64,
    /// Results in checklist order.
    pub results: Vec<CriterionResult>,
}

impl AuditReport {
    /// Number of results with the given status.
    pub fn count(&self, status: VerdictStatus) -> usize {
        self.results.iter().filter(|r| r.verdict.status == status).count()
    }
}
