//! Page → sentence → embedded chunk conversion shared by every store.

use std::sync::Arc;

use tracing::{debug, error};

use crate::document::{IndexedChunk, Page};
use crate::embedding::{EmbeddingProvider, HashEmbedder};
use crate::error::{AuditError, Result};
use crate::extract::{PageExtractor, PlainTextExtractor};
use crate::segment::{PunctuationSegmenter, SentenceSegmenter};
use crate::store::Query;

/// The extraction, segmentation and embedding collaborators, bundled.
///
/// Every store and the coordinator share one `Ingestor` so that stored
/// chunks and queries are embedded by the same provider.
#[derive(Clone)]
pub struct Ingestor {
    extractor: Arc<dyn PageExtractor>,
    segmenter: Arc<dyn SentenceSegmenter>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl Default for Ingestor {
    fn default() -> Self {
        Self::new(
            Arc::new(PlainTextExtractor),
            Arc::new(PunctuationSegmenter),
            Arc::new(HashEmbedder::default()),
        )
    }
}

impl Ingestor {
    pub fn new(
        extractor: Arc<dyn PageExtractor>,
        segmenter: Arc<dyn SentenceSegmenter>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self { extractor, segmenter, embedder }
    }

    /// Replace the embedding provider, keeping the other collaborators.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    pub fn segmenter(&self) -> &Arc<dyn SentenceSegmenter> {
        &self.segmenter
    }

    pub fn dimensions(&self) -> usize {
        self.embedder.dimensions()
    }

    /// Extract pages from `bytes`. Fails with `UnreadableDocument`.
    pub fn pages(&self, document_name: &str, bytes: &[u8]) -> Result<Vec<Page>> {
        self.extractor.extract(document_name, bytes)
    }

    /// Extract, segment and embed one source document.
    pub async fn ingest(&self, source_id: &str, bytes: &[u8]) -> Result<Vec<IndexedChunk>> {
        let pages = self.pages(source_id, bytes)?;
        chunk_pages(source_id, &pages, self.segmenter.as_ref(), self.embedder.as_ref()).await
    }

    /// The vector for `query`, embedding text when needed.
    pub async fn embed_query(&self, query: &Query) -> Result<Vec<f32>> {
        match query {
            Query::Text(text) => self.embedder.embed(text).await,
            Query::Vector(vector) => Ok(vector.clone()),
        }
    }
}

/// Segment `pages` into sentences and embed them as chunks of `source_id`.
///
/// `local_index` counts sentences across the whole source starting at 0, so
/// neighbouring sentences on adjacent pages are still neighbours.
pub async fn chunk_pages(
    source_id: &str,
    pages: &[Page],
    segmenter: &dyn SentenceSegmenter,
    embedder: &dyn EmbeddingProvider,
) -> Result<Vec<IndexedChunk>> {
    // 1. Segment every page, remembering where each sentence came from
    let mut pending: Vec<(u32, String)> = Vec::new();
    for page in pages {
        for sentence in segmenter.segment(&page.text) {
            pending.push((page.page_number, sentence));
        }
    }
    if pending.is_empty() {
        debug!(source_id, "no sentences to index");
        return Ok(Vec::new());
    }

    // 2. Generate embeddings in one batch
    let texts: Vec<&str> = pending.iter().map(|(_, s)| s.as_str()).collect();
    let embeddings = embedder.embed_batch(&texts).await.map_err(|e| {
        error!(source_id, error = %e, "embedding failed during indexing");
        e
    })?;
    if embeddings.len() != pending.len() {
        return Err(AuditError::EmbeddingError {
            provider: "batch".to_string(),
            message: format!(
                "expected {} embeddings for '{source_id}', got {}",
                pending.len(),
                embeddings.len()
            ),
        });
    }

    // 3. Attach positions and embeddings
    let chunks: Vec<IndexedChunk> = pending
        .into_iter()
        .zip(embeddings)
        .enumerate()
        .map(|(i, ((page_number, text), embedding))| IndexedChunk {
            source_id: source_id.to_string(),
            page_number,
            local_index: i as u32,
            text,
            embedding,
        })
        .collect();

    debug!(source_id, chunk_count = chunks.len(), "chunked source");
    Ok(chunks)
}
