//! Finding the subject passage that best matches a criterion.

use tracing::debug;

use crate::config::RetrievalConfig;
use crate::document::{Attempt, ChecklistItem, ExtractionRecord};
use crate::error::Result;
use crate::store::Query;
use crate::subject::SubjectStore;
use crate::text::widen_query;

/// Queries the subject store for one criterion and attaches the sentences
/// around the best match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionStage {
    top_k: usize,
    retry_top_k: usize,
    max_match_distance: f32,
}

impl ExtractionStage {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            top_k: config.top_k,
            retry_top_k: config.retry_top_k,
            max_match_distance: config.max_match_distance,
        }
    }

    /// Query text and candidate count for an attempt: the criterion on the
    /// initial pass; on the retry, the description widened with synonyms of
    /// the criterion terms, and a wider `k`.
    pub fn plan(&self, item: &ChecklistItem, attempt: Attempt) -> (String, usize) {
        match attempt {
            Attempt::Initial => (item.criterion.clone(), self.top_k),
            Attempt::Retry => {
                (widen_query(item.alternate_query(), &item.criterion), self.retry_top_k)
            }
        }
    }

    /// Return the best match within `max_match_distance`, skipping the
    /// passage in `rejected` (the one an earlier attempt already judged).
    ///
    /// Chunks embedded as the zero vector never match: their distance to any
    /// unit query is exactly 1.0, which would otherwise pass the threshold.
    pub async fn extract(
        &self,
        item: &ChecklistItem,
        subject: &SubjectStore,
        attempt: Attempt,
        rejected: Option<&ExtractionRecord>,
    ) -> Result<Option<ExtractionRecord>> {
        let (query, k) = self.plan(item, attempt);
        let hits = subject.search(&Query::text(query), k).await?;

        let best = hits
            .into_iter()
            .filter(|h| h.distance <= self.max_match_distance && h.chunk.has_signal())
            .find(|h| {
                rejected.is_none_or(|r| {
                    r.source_id != h.chunk.source_id || r.local_index != h.chunk.local_index
                })
            });
        let Some(hit) = best else {
            debug!(
                criterion = %item.criterion,
                attempt = attempt.number(),
                "no passage within threshold"
            );
            return Ok(None);
        };

        let (context_before, context_after) =
            subject.context(&hit.chunk.source_id, hit.chunk.local_index).await;
        debug!(
            criterion = %item.criterion,
            attempt = attempt.number(),
            page = hit.chunk.page_number,
            local_index = hit.chunk.local_index,
            distance = hit.distance,
            "passage extracted"
        );
        Ok(Some(ExtractionRecord {
            criterion: item.criterion.clone(),
            matched_text: hit.chunk.text,
            context_before,
            context_after,
            source_id: hit.chunk.source_id,
            page_number: hit.chunk.page_number,
            local_index: hit.chunk.local_index,
            distance: hit.distance,
            attempt,
        }))
    }
}

impl ExtractionRecord {
    /// The matched text with its neighbours, in document order.
    pub fn with_context(&self) -> String {
        [
            self.context_before.as_deref(),
            Some(self.matched_text.as_str()),
            self.context_after.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::Ingestor;

    async fn subject(text: &str) -> (tempfile::TempDir, SubjectStore) {
        let temp = tempfile::tempdir().unwrap();
        let store = SubjectStore::new(temp.path().join("run"), Ingestor::default());
        store.load_document("report", text.as_bytes()).await.unwrap();
        (temp, store)
    }

    fn item() -> ChecklistItem {
        ChecklistItem::new(
            "c",
            "Social",
            "Employee training hours",
            "Average hours of training per employee",
        )
    }

    #[tokio::test]
    async fn extracts_best_match_with_context() {
        let text = "Intro text. Employee training hours rose to 20. Board news follows.";
        let (_temp, store) = subject(text).await;
        let stage = ExtractionStage::new(&RetrievalConfig::default());

        let record = stage.extract(&item(), &store, Attempt::Initial, None).await.unwrap().unwrap();
        assert_eq!(record.matched_text, "Employee training hours rose to 20.");
        assert_eq!(record.local_index, 1);
        assert_eq!(record.context_before.as_deref(), Some("Intro text."));
        assert_eq!(record.context_after.as_deref(), Some("Board news follows."));
        assert_eq!(record.with_context(), text);
    }

    #[tokio::test]
    async fn nothing_within_threshold_is_none() {
        let (_temp, store) = subject("The board met four times.").await;
        let stage = ExtractionStage::new(&RetrievalConfig::default());
        assert!(stage.extract(&item(), &store, Attempt::Initial, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_uses_description_and_skips_rejected_passage() {
        let (_temp, store) = subject(
            "Employee training hours were tracked. \
             Average hours of training per employee reached 31.",
        )
        .await;
        let stage = ExtractionStage::new(&RetrievalConfig::default());
        let (query, k) = stage.plan(&item(), Attempt::Retry);
        assert_eq!(query, "Average hours of training per employee");
        assert_eq!(k, 10);

        let first = stage.extract(&item(), &store, Attempt::Initial, None).await.unwrap().unwrap();
        assert_eq!(first.local_index, 0);
        let second =
            stage.extract(&item(), &store, Attempt::Retry, Some(&first)).await.unwrap().unwrap();
        assert_eq!(second.local_index, 1);
        assert_eq!(second.attempt, Attempt::Retry);
    }

    #[tokio::test]
    async fn retry_query_carries_criterion_synonyms() {
        let stage = ExtractionStage::new(&RetrievalConfig::default());
        let item = ChecklistItem::new(
            "c",
            "Governance",
            "Executive remuneration",
            "Pay policy for executives",
        );
        let (query, k) = stage.plan(&item, Attempt::Retry);
        assert_eq!(query, "Pay policy for executives compensation salary wages");
        assert_eq!(k, 10);

        let (_temp, store) =
            subject("The board met four times. Directors received compensation and salary.").await;
        let record = stage.extract(&item, &store, Attempt::Retry, None).await.unwrap().unwrap();
        assert_eq!(record.matched_text, "Directors received compensation and salary.");
    }

    #[tokio::test]
    async fn sentences_without_content_never_match() {
        let (_temp, store) = subject("The board met four times. 1. Revenue grew strongly.").await;
        let stage = ExtractionStage::new(&RetrievalConfig::default());
        let item = ChecklistItem::new("c", "Environment", "Emissions", "CO2 disclosure");

        assert!(stage.extract(&item, &store, Attempt::Initial, None).await.unwrap().is_none());
        assert!(stage.extract(&item, &store, Attempt::Retry, None).await.unwrap().is_none());
    }
}
