//! The ephemeral store holding the one subject document of a workflow run.

use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::document::{IndexedChunk, SearchHit};
use crate::error::Result;
use crate::index::VectorIndex;
use crate::ingest::Ingestor;
use crate::store::Query;

const SUBJECT_INDEX_FILE: &str = "subject.index.json";

/// Index over the chunks of a single subject document.
///
/// The store owns its scratch directory: [`clear`](Self::clear) removes the
/// in-memory chunks and the directory with everything persisted in it.
pub struct SubjectStore {
    scratch_dir: PathBuf,
    ingestor: Ingestor,
    index: RwLock<VectorIndex>,
}

impl std::fmt::Debug for SubjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubjectStore")
            .field("scratch_dir", &self.scratch_dir)
            .finish_non_exhaustive()
    }
}

impl SubjectStore {
    pub fn new(scratch_dir: impl Into<PathBuf>, ingestor: Ingestor) -> Self {
        let index = RwLock::new(VectorIndex::new(ingestor.dimensions()));
        Self { scratch_dir: scratch_dir.into(), ingestor, index }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    fn index_path(&self) -> PathBuf {
        self.scratch_dir.join(SUBJECT_INDEX_FILE)
    }

    /// Replace the current content with `chunks` and persist them to the
    /// scratch directory.
    pub async fn load(&self, chunks: Vec<IndexedChunk>) -> Result<()> {
        let mut next = VectorIndex::new(self.ingestor.dimensions());
        next.extend(chunks)?;
        let count = next.len();

        let mut active = self.index.write().await;
        *active = next;
        active.persist(self.index_path()).await?;
        debug!(scratch = %self.scratch_dir.display(), chunks = count, "subject loaded");
        Ok(())
    }

    /// Extract, segment and embed a raw document, then [`load`](Self::load)
    /// it. Returns the number of chunks indexed.
    pub async fn load_document(&self, document_name: &str, bytes: &[u8]) -> Result<usize> {
        let chunks = self.ingestor.ingest(document_name, bytes).await?;
        let count = chunks.len();
        self.load(chunks).await?;
        Ok(count)
    }

    /// Up to `k` closest chunks, nearest first.
    pub async fn search(&self, query: &Query, k: usize) -> Result<Vec<SearchHit>> {
        let vector = self.ingestor.embed_query(query).await?;
        self.index.read().await.search(&vector, k)
    }

    /// Text of the chunks immediately before and after `local_index`
    /// within `source_id`.
    pub async fn context(
        &self,
        source_id: &str,
        local_index: u32,
    ) -> (Option<String>, Option<String>) {
        let index = self.index.read().await;
        let (before, after) = index.neighbours(source_id, local_index);
        (before.map(|c| c.text.clone()), after.map(|c| c.text.clone()))
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.is_empty()
    }

    /// Drop all chunks and delete every persisted artifact.
    ///
    /// Safe to call repeatedly and after a failed [`load`](Self::load).
    pub async fn clear(&self) -> Result<()> {
        let mut active = self.index.write().await;
        *active = VectorIndex::new(self.ingestor.dimensions());

        match tokio::fs::remove_dir_all(&self.scratch_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(scratch = %self.scratch_dir.display(), "subject store cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_replaces_previous_subject() {
        let temp = tempfile::tempdir().unwrap();
        let store = SubjectStore::new(temp.path().join("run-1"), Ingestor::default());

        store.load_document("a", b"Alpha one. Alpha two. Alpha three.").await.unwrap();
        assert_eq!(store.len().await, 3);
        store.load_document("b", b"Beta.").await.unwrap();
        assert_eq!(store.len().await, 1);

        let hits = store.search(&Query::text("alpha"), 5).await.unwrap();
        assert!(hits.iter().all(|h| h.chunk.source_id == "b"));
    }

    #[tokio::test]
    async fn context_comes_from_same_source() {
        let temp = tempfile::tempdir().unwrap();
        let store = SubjectStore::new(temp.path().join("run"), Ingestor::default());
        store.load_document("r", b"First. Second. Third.").await.unwrap();

        let (before, after) = store.context("r", 1).await;
        assert_eq!(before.as_deref(), Some("First."));
        assert_eq!(after.as_deref(), Some("Third."));
        assert_eq!(store.context("r", 0).await.0, None);
        assert_eq!(store.context("other", 1).await, (None, None));
    }

    #[tokio::test]
    async fn clear_is_idempotent_and_removes_files() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("run");
        let store = SubjectStore::new(&dir, Ingestor::default());
        store.load_document("r", b"Some text.").await.unwrap();
        assert!(dir.join(SUBJECT_INDEX_FILE).exists());

        store.clear().await.unwrap();
        assert!(store.is_empty().await);
        assert!(!dir.exists());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn clear_after_failed_load() {
        let temp = tempfile::tempdir().unwrap();
        let store = SubjectStore::new(temp.path().join("run"), Ingestor::default());
        assert!(store.load_document("bad", &[0xff, 0x00]).await.is_err());
        store.clear().await.unwrap();
        assert_eq!(store.len().await, 0);
    }
}
