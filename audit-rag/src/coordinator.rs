//! Workflow coordinator.
//!
//! The [`WorkflowCoordinator`] drives one subject document through every
//! criterion of a checklist:
//!
//! 1. load the document into a fresh [`SubjectStore`];
//! 2. fan out extraction for all criteria on spawned tasks, bounded by the
//!    [`ResourceGovernor`]'s concurrency budget and paused while usage is
//!    over budget;
//! 3. evaluate sequentially in checklist order, retrying each criterion at
//!    most once;
//! 4. summarize every `Validated` and `Flagged` criterion;
//! 5. clear the subject store, whatever happened above.
//!
//! # Example
//!
//! ```rust,ignore
//! use audit_rag::{AuditRequest, WorkflowCoordinator};
//!
//! let coordinator = WorkflowCoordinator::builder()
//!     .config(config)
//!     .ingestor(ingestor)
//!     .checklists(checklists)
//!     .references(references)
//!     .reasoner(Arc::new(KeywordReasoner::default()))
//!     .governor(Arc::new(ResourceGovernor::from_config(&config)))
//!     .sink(Arc::new(JsonFileSink::new(&config.paths.output_dir)))
//!     .build()?;
//!
//! let request = AuditRequest::from_path("reports/acme_2023.txt", "unctad").await?;
//! let report = coordinator.run(request).await?;
//! ```

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::checklist::ChecklistStore;
use crate::config::AuditConfig;
use crate::document::{
    Attempt, AuditReport, ChecklistItem, CriterionResult, EvaluationVerdict, ExtractionRecord,
    ReferenceEntry, VerdictStatus,
};
use crate::error::{AuditError, Result};
use crate::evaluation::{Evaluation, EvaluationStage, NO_CONTENT};
use crate::extraction::ExtractionStage;
use crate::governor::ResourceGovernor;
use crate::ingest::Ingestor;
use crate::reasoner::{Reasoner, SummaryRequest};
use crate::sink::ResultSink;
use crate::state::{CriterionState, CriterionTracker};
use crate::store::KnowledgeStore;
use crate::subject::SubjectStore;

/// Reason and summary text of criteria cut off by the document timeout.
pub const TIMEOUT: &str = "timeout";

/// One subject document to audit against one checklist.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRequest {
    pub document_name: String,
    pub document: Vec<u8>,
    pub checklist: String,
    /// Restrict reference lookups to this rule.
    pub standard: Option<String>,
}

impl AuditRequest {
    pub fn new(
        document_name: impl Into<String>,
        document: Vec<u8>,
        checklist: impl Into<String>,
    ) -> Self {
        Self {
            document_name: document_name.into(),
            document,
            checklist: checklist.into(),
            standard: None,
        }
    }

    pub fn with_standard(mut self, standard: impl Into<String>) -> Self {
        self.standard = Some(standard.into());
        self
    }

    /// Read the document at `path`. The document name is the file name.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::UnreadableDocument`] if the file cannot be read.
    pub async fn from_path(path: impl AsRef<Path>, checklist: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let document = tokio::fs::read(path).await.map_err(|e| AuditError::UnreadableDocument {
            document: name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(name, document, checklist))
    }
}

/// Bookkeeping for one criterion during a run.
#[derive(Debug)]
struct Progress {
    item: ChecklistItem,
    tracker: CriterionTracker,
    extractions: Vec<ExtractionRecord>,
    references: Vec<ReferenceEntry>,
    verdict: Option<EvaluationVerdict>,
    attempts: u8,
    timed_out: bool,
    summary: Option<String>,
}

impl Progress {
    fn new(item: ChecklistItem) -> Self {
        Self {
            item,
            tracker: CriterionTracker::new(),
            extractions: Vec::new(),
            references: Vec::new(),
            verdict: None,
            attempts: 0,
            timed_out: false,
            summary: None,
        }
    }

    fn time_out(&mut self) {
        if self.tracker.abort() {
            self.verdict = Some(EvaluationVerdict::flagged(TIMEOUT));
            self.timed_out = true;
        }
    }

    fn record(&mut self, evaluation: Evaluation) {
        self.attempts += 1;
        self.references = evaluation.references;
        self.verdict = Some(evaluation.verdict);
    }

    fn finish(self) -> CriterionResult {
        CriterionResult {
            item: self.item.without_embedding(),
            extractions: self.extractions,
            references: self.references,
            verdict: self.verdict.unwrap_or_else(|| EvaluationVerdict::flagged(TIMEOUT)),
            summary_text: self.summary.unwrap_or_default(),
            attempts: self.attempts,
            state: self.tracker.state(),
        }
    }
}

/// Clears a subject store exactly once: explicitly at the end of a run, or
/// on a background task if the run is dropped or panics first.
struct ClearOnDrop(Option<Arc<SubjectStore>>);

impl ClearOnDrop {
    async fn clear(mut self) {
        if let Some(subject) = self.0.take() {
            if let Err(e) = subject.clear().await {
                error!(error = %e, "subject store cleanup failed");
            }
        }
    }
}

impl Drop for ClearOnDrop {
    fn drop(&mut self) {
        let Some(subject) = self.0.take() else { return };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = subject.clear().await {
                        error!(error = %e, "subject store cleanup failed");
                    }
                });
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_dir_all(subject.scratch_dir()) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        error!(error = %e, "subject scratch cleanup failed");
                    }
                }
            }
        }
    }
}

/// Run `future` to completion, or give up at `deadline`.
async fn within<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Drives subject documents through extraction, evaluation and
/// summarization. Construct one via [`WorkflowCoordinator::builder()`].
pub struct WorkflowCoordinator {
    config: AuditConfig,
    ingestor: Ingestor,
    checklists: Arc<ChecklistStore>,
    references: Arc<dyn KnowledgeStore>,
    reasoner: Arc<dyn Reasoner>,
    governor: Arc<ResourceGovernor>,
    sink: Option<Arc<dyn ResultSink>>,
    extraction: ExtractionStage,
}

impl WorkflowCoordinator {
    pub fn builder() -> WorkflowCoordinatorBuilder {
        WorkflowCoordinatorBuilder::default()
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Audit one document in its own subject store under
    /// `scratch_dir/<run_id>`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::UnreadableDocument`] when the document cannot be
    /// turned into text and [`AuditError::UnknownChecklist`] when the
    /// checklist is not registered. Every other outcome is a report.
    pub async fn run(&self, request: AuditRequest) -> Result<AuditReport> {
        let run_id = Uuid::new_v4().to_string();
        let scratch = self.config.paths.scratch_dir.join(&run_id);
        let subject = Arc::new(SubjectStore::new(scratch, self.ingestor.clone()));
        self.execute(run_id, subject, request).await
    }

    /// Like [`run`](Self::run), using a caller-provided subject store. The
    /// store is cleared when the run ends.
    pub async fn run_in(
        &self,
        subject: Arc<SubjectStore>,
        request: AuditRequest,
    ) -> Result<AuditReport> {
        self.execute(Uuid::new_v4().to_string(), subject, request).await
    }

    async fn execute(
        &self,
        run_id: String,
        subject: Arc<SubjectStore>,
        request: AuditRequest,
    ) -> Result<AuditReport> {
        let span = info_span!("audit_run", run_id = %run_id, document = %request.document_name);
        async move {
            let started_at = Utc::now();
            let clock = Instant::now();
            let deadline = self.config.workflow.document_timeout().map(|t| clock + t);
            info!(checklist = %request.checklist, standard = ?request.standard, "workflow started");

            let cleanup = ClearOnDrop(Some(Arc::clone(&subject)));
            let outcome = self.drive(&subject, &request, deadline).await;
            let processing_time_secs = clock.elapsed().as_secs_f64();
            cleanup.clear().await;

            let results = outcome.inspect_err(|e| error!(error = %e, "workflow aborted"))?;
            let report = AuditReport {
                run_id,
                document_name: request.document_name,
                checklist_name: request.checklist,
                standard: request.standard,
                started_at,
                processing_time_secs,
                results,
            };
            info!(
                validated = report.count(VerdictStatus::Validated),
                flagged = report.count(VerdictStatus::Flagged),
                elapsed_secs = processing_time_secs,
                "workflow finished"
            );

            if let Some(sink) = &self.sink {
                if let Err(e) = sink.write(&report).await {
                    error!(error = %e, "failed to persist results");
                }
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        subject: &Arc<SubjectStore>,
        request: &AuditRequest,
        deadline: Option<Instant>,
    ) -> Result<Vec<CriterionResult>> {
        let items = self.checklists.items(&request.checklist)?;
        let mut progress: Vec<Progress> = items.into_iter().map(Progress::new).collect();

        let chunks = match subject.load_document(&request.document_name, &request.document).await {
            Ok(chunks) => chunks,
            Err(e @ AuditError::UnreadableDocument { .. }) => return Err(e),
            Err(e) => {
                return Err(AuditError::UnreadableDocument {
                    document: request.document_name.clone(),
                    reason: format!("indexing failed: {e}"),
                });
            }
        };

        if chunks == 0 {
            let err = AuditError::EmptyDocument(request.document_name.clone());
            warn!(error = %err, "flagging every criterion");
            for p in &mut progress {
                p.tracker.advance(CriterionState::Flagged);
                p.verdict = Some(EvaluationVerdict::flagged(NO_CONTENT));
            }
        } else {
            debug!(chunks, criteria = progress.len(), "subject indexed");
            let initial = self.extract_all(subject, &mut progress, deadline).await;
            let evaluation = EvaluationStage::new(
                self.config.retrieval.reference_top_k,
                request.standard.clone(),
            );
            self.evaluate_all(subject, &mut progress, initial, &evaluation, deadline).await;
        }

        self.summarize_all(&mut progress, deadline).await;
        Ok(progress.into_iter().map(Progress::finish).collect())
    }

    /// Initial extraction for every criterion, concurrently. Returns one
    /// entry per criterion in checklist order.
    async fn extract_all(
        &self,
        subject: &Arc<SubjectStore>,
        progress: &mut [Progress],
        deadline: Option<Instant>,
    ) -> Vec<Option<ExtractionRecord>> {
        let budget = self.governor.concurrency_budget().await;
        let permits = Arc::new(Semaphore::new(budget));
        info!(workers = budget, criteria = progress.len(), "extracting");

        let mut handles: Vec<Option<JoinHandle<Result<Option<ExtractionRecord>>>>> =
            Vec::with_capacity(progress.len());
        for p in progress.iter_mut() {
            let ready = within(deadline, async {
                self.governor.wait_for_capacity().await;
                Arc::clone(&permits).acquire_owned().await
            })
            .await;
            let Some(Ok(permit)) = ready else {
                handles.push(None);
                continue;
            };

            p.tracker.advance(CriterionState::Extracting);
            let stage = self.extraction;
            let item = p.item.clone();
            let subject = Arc::clone(subject);
            let task = async move {
                let _permit = permit;
                stage.extract(&item, &subject, Attempt::Initial, None).await
            };
            handles.push(Some(tokio::spawn(task.in_current_span())));
        }

        let mut extractions = Vec::with_capacity(progress.len());
        for (p, handle) in progress.iter_mut().zip(handles) {
            let Some(mut handle) = handle else {
                p.time_out();
                extractions.push(None);
                continue;
            };
            let record = match within(deadline, &mut handle).await {
                None => {
                    handle.abort();
                    p.time_out();
                    None
                }
                Some(Ok(Ok(record))) => record,
                Some(Ok(Err(e))) => {
                    warn!(criterion = %p.item.criterion, error = %e, "extraction failed");
                    None
                }
                Some(Err(e)) => {
                    warn!(criterion = %p.item.criterion, error = %e, "extraction task failed");
                    None
                }
            };
            extractions.push(record);
        }
        extractions
    }

    /// Sequential evaluation in checklist order with at most one retry.
    async fn evaluate_all(
        &self,
        subject: &Arc<SubjectStore>,
        progress: &mut [Progress],
        initial: Vec<Option<ExtractionRecord>>,
        evaluation: &EvaluationStage,
        deadline: Option<Instant>,
    ) {
        let references = self.references.as_ref();
        let reasoner = self.reasoner.as_ref();

        for (p, first) in progress.iter_mut().zip(initial) {
            if p.timed_out {
                continue;
            }
            if expired(deadline) {
                p.time_out();
                continue;
            }

            p.tracker.advance(CriterionState::Evaluating);
            p.extractions.extend(first.clone());
            let judged = evaluation.evaluate(
                &p.item,
                first.as_ref(),
                references,
                reasoner,
                Attempt::Initial,
            );
            let Some(outcome) = within(deadline, judged).await else {
                p.time_out();
                continue;
            };
            let retry = outcome.verdict.status == VerdictStatus::Retry;
            p.record(outcome);
            if !retry {
                p.tracker.advance(CriterionState::Validated);
                continue;
            }

            p.tracker.advance(CriterionState::RetryExtracting);
            let retried = within(deadline, async {
                let second = self
                    .extraction
                    .extract(&p.item, subject, Attempt::Retry, first.as_ref())
                    .await
                    .unwrap_or_else(|e| {
                        warn!(criterion = %p.item.criterion, error = %e, "retry extraction failed");
                        None
                    });
                let outcome = evaluation
                    .evaluate(&p.item, second.as_ref(), references, reasoner, Attempt::Retry)
                    .await;
                (second, outcome)
            })
            .await;
            let Some((second, outcome)) = retried else {
                p.time_out();
                continue;
            };

            p.tracker.advance(CriterionState::Evaluating);
            p.extractions.extend(second);
            let validated = outcome.verdict.status == VerdictStatus::Validated;
            p.record(outcome);
            p.tracker.advance(if validated {
                CriterionState::Validated
            } else {
                CriterionState::Flagged
            });
        }
    }

    /// Summaries for every criterion with a verdict, in checklist order.
    async fn summarize_all(&self, progress: &mut [Progress], deadline: Option<Instant>) {
        for p in progress.iter_mut() {
            let Some(verdict) = p.verdict.clone() else { continue };
            let summary = if p.timed_out {
                format!("Unresolved: {TIMEOUT}")
            } else if expired(deadline) {
                format!("Summary not generated: {TIMEOUT}. {}", verdict.reason)
            } else {
                let request = self.summary_request(p, &verdict);
                match within(deadline, self.reasoner.summarize(&request)).await {
                    Some(Ok(text)) if verdict.status == VerdictStatus::Flagged => {
                        format!("Unresolved: {}. {text}", verdict.reason)
                    }
                    Some(Ok(text)) => text,
                    Some(Err(e)) => {
                        warn!(criterion = %p.item.criterion, error = %e, "summary fallback used");
                        format!("Failed to generate summary for {}", p.item.criterion)
                    }
                    None => format!("Summary not generated: {TIMEOUT}. {}", verdict.reason),
                }
            };
            p.summary = Some(summary);
            p.tracker.advance(CriterionState::Summarized);
        }
    }

    fn summary_request(&self, p: &Progress, verdict: &EvaluationVerdict) -> SummaryRequest {
        let mut rules: Vec<String> = Vec::new();
        for reference in &p.references {
            if !rules.contains(&reference.rule) {
                rules.push(reference.rule.clone());
            }
        }
        SummaryRequest {
            criterion: p.item.criterion.clone(),
            category: p.item.category.clone(),
            description: p.item.description.clone(),
            status: verdict.status,
            reason: verdict.reason.clone(),
            passages: p.extractions.iter().map(|e| e.matched_text.clone()).collect(),
            reference_texts: p.references.iter().map(|r| r.text.clone()).collect(),
            rules,
        }
    }
}

/// Builder for constructing a [`WorkflowCoordinator`].
///
/// `config`, `checklists`, `references`, `reasoner` and `governor` are
/// required; the ingestor defaults to the offline collaborators and the sink
/// is optional.
#[derive(Default)]
pub struct WorkflowCoordinatorBuilder {
    config: Option<AuditConfig>,
    ingestor: Option<Ingestor>,
    checklists: Option<Arc<ChecklistStore>>,
    references: Option<Arc<dyn KnowledgeStore>>,
    reasoner: Option<Arc<dyn Reasoner>>,
    governor: Option<Arc<ResourceGovernor>>,
    sink: Option<Arc<dyn ResultSink>>,
}

fn required<T>(part: Option<T>, name: &str) -> Result<T> {
    part.ok_or_else(|| AuditError::ConfigError(format!("{name} is required")))
}

impl WorkflowCoordinatorBuilder {
    pub fn config(mut self, config: AuditConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Collaborators used to index subject documents. Must embed the same
    /// way as the stores.
    pub fn ingestor(mut self, ingestor: Ingestor) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    pub fn checklists(mut self, store: Arc<ChecklistStore>) -> Self {
        self.checklists = Some(store);
        self
    }

    pub fn references(mut self, store: Arc<dyn KnowledgeStore>) -> Self {
        self.references = Some(store);
        self
    }

    pub fn reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    pub fn governor(mut self, governor: Arc<ResourceGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// # Errors
    ///
    /// Returns [`AuditError::ConfigError`] if a required part is missing or
    /// the configuration is invalid.
    pub fn build(self) -> Result<WorkflowCoordinator> {
        let config = required(self.config, "config")?;
        config.validate()?;
        let checklists = required(self.checklists, "checklists")?;
        let references = required(self.references, "references")?;
        let reasoner = required(self.reasoner, "reasoner")?;
        let governor = required(self.governor, "governor")?;

        Ok(WorkflowCoordinator {
            extraction: ExtractionStage::new(&config.retrieval),
            config,
            ingestor: self.ingestor.unwrap_or_default(),
            checklists,
            references,
            reasoner,
            governor,
            sink: self.sink,
        })
    }
}
