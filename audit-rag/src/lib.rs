//! Checklist-driven document audit engine.
//!
//! `audit-rag` checks a subject document (e.g. a sustainability report)
//! against a named checklist of criteria. For every criterion it retrieves
//! the best-matching passage from the document, cross-checks it against the
//! governing reference rules, and records a traceable verdict and summary.
//!
//! # Components
//!
//! - [`VectorIndex`]: exact nearest-neighbour search over embedded chunks
//! - [`ReferenceStore`], [`ChecklistStore`]: durable stores swapped
//!   atomically to new generations by [`RefreshScheduler`] and
//!   [`DirectoryWatcher`]
//! - [`SubjectStore`]: one run's document, cleared when the run ends
//! - [`ResourceGovernor`]: memory and disk budget, concurrency budget
//! - [`ExtractionStage`], [`EvaluationStage`]: per-criterion retrieval and
//!   cross-checking
//! - [`WorkflowCoordinator`]: drives a document through every criterion
//!
//! Collaborators are traits with offline defaults: [`PageExtractor`],
//! [`SentenceSegmenter`], [`EmbeddingProvider`], [`Reasoner`] and
//! [`ResultSink`].
//!
//! # Feature Flags
//!
//! | Feature | Types |
//! |---------|-------|
//! | `openai` | [`openai::OpenAIEmbeddingProvider`], [`openai::OpenAIReasoner`] |

pub mod checklist;
pub mod config;
pub mod coordinator;
pub mod document;
pub mod embedding;
pub mod error;
pub mod evaluation;
pub mod extract;
pub mod extraction;
pub mod generation;
pub mod governor;
pub mod index;
pub mod ingest;
pub mod reasoner;
pub mod reference;
pub mod refresh;
pub mod segment;
pub mod sink;
pub mod sources;
pub mod state;
pub mod store;
pub mod subject;
pub mod watch;

mod text;

#[cfg(feature = "openai")]
pub mod openai;

pub use checklist::{ChecklistCatalog, ChecklistMatch, ChecklistStore, MatchField, parse_checklist};
pub use config::{
    AuditConfig, AuditConfigBuilder, MAX_RETRIES, PathsConfig, RefreshConfig, ResourceBudget,
    ResourceConfig, ResourceProfile, RetrievalConfig, WorkflowConfig,
};
pub use coordinator::{AuditRequest, WorkflowCoordinator, WorkflowCoordinatorBuilder};
pub use document::{
    Attempt, AuditReport, ChecklistItem, CriterionResult, EvaluationVerdict, ExtractionRecord,
    IndexedChunk, Page, ReferenceEntry, SearchHit, VerdictStatus,
};
pub use embedding::{EmbeddingProvider, HashEmbedder};
pub use error::{AuditError, Result};
pub use evaluation::{Evaluation, EvaluationStage};
pub use extract::{PageExtractor, PlainTextExtractor};
pub use extraction::ExtractionStage;
pub use generation::{Generation, GenerationCell};
pub use governor::{ResourceGovernor, ResourceProbe, ResourceSample, SystemProbe};
pub use index::VectorIndex;
pub use ingest::{Ingestor, chunk_pages};
pub use reasoner::{JudgeRequest, Judgment, KeywordReasoner, Reasoner, Sufficiency, SummaryRequest};
pub use reference::ReferenceStore;
pub use refresh::RefreshScheduler;
pub use segment::{PunctuationSegmenter, SentenceSegmenter};
pub use sink::{JsonFileSink, ResultSink};
pub use sources::{SourceFile, SourceSet};
pub use state::{CriterionState, CriterionTracker};
pub use store::{KnowledgeStore, Query, RefreshOutcome};
pub use subject::SubjectStore;
pub use watch::{ChangeEvent, DirectoryWatcher};
