//! Cross-checking an extraction against the reference rules.

use tracing::{debug, warn};

use crate::document::{Attempt, ChecklistItem, EvaluationVerdict, ExtractionRecord, ReferenceEntry};
use crate::reasoner::{JudgeRequest, Reasoner, Sufficiency};
use crate::store::{KnowledgeStore, Query};

/// Reason recorded when no passage was found.
pub const NO_CONTENT: &str = "no content";

/// The verdict of one evaluation pass and the references it consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub verdict: EvaluationVerdict,
    pub references: Vec<ReferenceEntry>,
}

/// Decides `Validated`, `Retry` or `Flagged` for one criterion attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationStage {
    reference_top_k: usize,
    /// Governing rule-set; `None` searches every rule.
    standard: Option<String>,
}

impl EvaluationStage {
    pub fn new(reference_top_k: usize, standard: Option<String>) -> Self {
        Self { reference_top_k, standard }
    }

    /// Failure on the initial attempt asks for a retry; failure on the retry
    /// is final.
    fn unsuccessful(attempt: Attempt, reason: impl Into<String>) -> EvaluationVerdict {
        match attempt {
            Attempt::Initial => EvaluationVerdict::retry(reason),
            Attempt::Retry => EvaluationVerdict::flagged(reason),
        }
    }

    async fn references(
        &self,
        item: &ChecklistItem,
        store: &dyn KnowledgeStore,
    ) -> Vec<ReferenceEntry> {
        let query = Query::text(format!("{} {}", item.criterion, item.description));
        match store.query(query, self.reference_top_k, self.standard.as_deref()).await {
            Ok(hits) => hits.into_iter().map(ReferenceEntry::from).collect(),
            Err(e) => {
                warn!(
                    criterion = %item.criterion,
                    store = store.name(),
                    error = %e,
                    "reference lookup failed"
                );
                Vec::new()
            }
        }
    }

    /// Evaluate one attempt. Never fails: lookup and reasoning errors count
    /// as an insufficient result.
    pub async fn evaluate(
        &self,
        item: &ChecklistItem,
        extraction: Option<&ExtractionRecord>,
        references: &dyn KnowledgeStore,
        reasoner: &dyn Reasoner,
        attempt: Attempt,
    ) -> Evaluation {
        let references = self.references(item, references).await;

        let Some(extraction) = extraction else {
            debug!(criterion = %item.criterion, attempt = attempt.number(), "nothing extracted");
            return Evaluation { verdict: Self::unsuccessful(attempt, NO_CONTENT), references };
        };

        let request = JudgeRequest {
            criterion: item.criterion.clone(),
            description: item.description.clone(),
            extracted_text: extraction.with_context(),
            reference_texts: references.iter().map(|r| r.text.clone()).collect(),
            attempt,
        };
        let verdict = match reasoner.judge(&request).await {
            Ok(judgment) if judgment.verdict == Sufficiency::Sufficient => {
                EvaluationVerdict::validated(judgment.rationale)
            }
            Ok(judgment) => {
                Self::unsuccessful(attempt, format!("insufficient: {}", judgment.rationale))
            }
            Err(e) => {
                warn!(
                    criterion = %item.criterion,
                    attempt = attempt.number(),
                    error = %e,
                    "reasoning failed"
                );
                Self::unsuccessful(attempt, "reasoning unavailable")
            }
        };
        debug!(
            criterion = %item.criterion,
            attempt = attempt.number(),
            status = ?verdict.status,
            "evaluated"
        );
        Evaluation { verdict, references }
    }
}
