//! Flat exact-search vector index with atomic on-disk persistence.
//!
//! [`VectorIndex`] is the leaf every store builds on. It keeps chunks in
//! insertion order, ranks by ascending Euclidean distance with ties broken by
//! insertion order, and can look a chunk up by `(source_id, local_index)` for
//! context retrieval.
//!
//! Persisted files store each embedding component as its IEEE-754 bit
//! pattern, so a persist/load cycle is bit-exact.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::{IndexedChunk, SearchHit};
use crate::error::{AuditError, Result};
use crate::store::{temp_path, write_atomic};

const FORMAT_VERSION: u32 = 1;

/// An in-memory similarity index over [`IndexedChunk`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorIndex {
    dimensions: usize,
    chunks: Vec<IndexedChunk>,
    positions: HashMap<(String, u32), usize>,
}

/// Euclidean distance between two vectors of equal length.
fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

impl VectorIndex {
    /// Create an empty index for vectors of the given dimensionality.
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions, ..Self::default() }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// All chunks in insertion order.
    pub fn chunks(&self) -> &[IndexedChunk] {
        &self.chunks
    }

    /// Add a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::IndexError`] if the embedding has the wrong
    /// dimensionality or `local_index` does not increase within the chunk's
    /// `source_id`.
    pub fn add(&mut self, chunk: IndexedChunk) -> Result<()> {
        if chunk.embedding.len() != self.dimensions {
            return Err(AuditError::IndexError(format!(
                "embedding has {} dimensions, index expects {}",
                chunk.embedding.len(),
                self.dimensions
            )));
        }
        let last = self
            .chunks
            .iter()
            .rev()
            .find(|c| c.source_id == chunk.source_id)
            .map(|c| c.local_index);
        if let Some(last) = last {
            if chunk.local_index <= last {
                return Err(AuditError::IndexError(format!(
                    "local_index {} of '{}' does not follow {last}",
                    chunk.local_index, chunk.source_id
                )));
            }
        }
        self.positions.insert((chunk.source_id.clone(), chunk.local_index), self.chunks.len());
        self.chunks.push(chunk);
        Ok(())
    }

    /// Add many chunks, stopping at the first invalid one.
    pub fn extend(&mut self, chunks: impl IntoIterator<Item = IndexedChunk>) -> Result<()> {
        for chunk in chunks {
            self.add(chunk)?;
        }
        Ok(())
    }

    /// Return the `k` chunks closest to `query`, nearest first.
    ///
    /// An empty index yields an empty list for any query.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.search_filtered(query, k, |_| true)
    }

    /// Like [`search`](Self::search), restricted to chunks accepted by `filter`.
    ///
    /// The filter is applied before truncation, so up to `k` matching chunks
    /// are returned even when closer non-matching chunks exist.
    pub fn search_filtered<F>(&self, query: &[f32], k: usize, filter: F) -> Result<Vec<SearchHit>>
    where
        F: Fn(&IndexedChunk) -> bool,
    {
        if self.chunks.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimensions {
            return Err(AuditError::IndexError(format!(
                "query has {} dimensions, index expects {}",
                query.len(),
                self.dimensions
            )));
        }

        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| filter(chunk))
            .map(|(i, chunk)| (i, l2_distance(&chunk.embedding, query)))
            .collect();

        // stable: equal distances keep insertion order
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(i, distance)| SearchHit { chunk: self.chunks[i].clone(), distance })
            .collect())
    }

    /// Look up the chunk at `local_index` within `source_id`.
    pub fn get(&self, source_id: &str, local_index: u32) -> Option<&IndexedChunk> {
        self.positions
            .get(&(source_id.to_string(), local_index))
            .and_then(|&i| self.chunks.get(i))
    }

    /// The chunks immediately before and after `local_index` in `source_id`.
    pub fn neighbours(
        &self,
        source_id: &str,
        local_index: u32,
    ) -> (Option<&IndexedChunk>, Option<&IndexedChunk>) {
        let before = local_index.checked_sub(1).and_then(|i| self.get(source_id, i));
        let after = local_index.checked_add(1).and_then(|i| self.get(source_id, i));
        (before, after)
    }

    /// Write the index to `path` atomically: the data goes to a sibling
    /// temporary file which is then renamed over the target.
    pub async fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let persisted = PersistedIndex {
            version: FORMAT_VERSION,
            dimensions: self.dimensions,
            chunks: self.chunks.iter().map(PersistedChunk::from).collect(),
        };
        write_atomic(path, &serde_json::to_vec(&persisted)?).await?;
        debug!(path = %path.display(), chunks = self.chunks.len(), "persisted vector index");
        Ok(())
    }

    /// Read an index previously written by [`persist`](Self::persist).
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await?;
        let persisted: PersistedIndex = serde_json::from_slice(&data)?;
        if persisted.version != FORMAT_VERSION {
            return Err(AuditError::IndexError(format!(
                "unsupported index format version {} in '{}'",
                persisted.version,
                path.display()
            )));
        }
        let mut index = VectorIndex::new(persisted.dimensions);
        index.extend(persisted.chunks.into_iter().map(IndexedChunk::from))?;
        debug!(path = %path.display(), chunks = index.len(), "loaded vector index");
        Ok(index)
    }

    /// Remove a persisted index and any leftover temporary file.
    ///
    /// Missing files are not an error.
    pub async fn delete(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        for target in [path.to_path_buf(), temp_path(path)] {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => debug!(path = %target.display(), "deleted index file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    dimensions: usize,
    chunks: Vec<PersistedChunk>,
}

#[derive(Serialize, Deserialize)]
struct PersistedChunk {
    source_id: String,
    page_number: u32,
    local_index: u32,
    text: String,
    embedding_bits: Vec<u32>,
}

impl From<&IndexedChunk> for PersistedChunk {
    fn from(chunk: &IndexedChunk) -> Self {
        Self {
            source_id: chunk.source_id.clone(),
            page_number: chunk.page_number,
            local_index: chunk.local_index,
            text: chunk.text.clone(),
            embedding_bits: chunk.embedding.iter().map(|v| v.to_bits()).collect(),
        }
    }
}

impl From<PersistedChunk> for IndexedChunk {
    fn from(chunk: PersistedChunk) -> Self {
        Self {
            source_id: chunk.source_id,
            page_number: chunk.page_number,
            local_index: chunk.local_index,
            text: chunk.text,
            embedding: chunk.embedding_bits.into_iter().map(f32::from_bits).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, local_index: u32, embedding: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            source_id: source.to_string(),
            page_number: 1,
            local_index,
            text: format!("{source}-{local_index}"),
            embedding,
        }
    }

    #[test]
    fn empty_index_returns_no_hits() {
        let index = VectorIndex::new(3);
        assert!(index.search(&[1.0, 0.0, 0.0], 5).unwrap().is_empty());
        // even with a mismatched query
        assert!(index.search(&[1.0], 5).unwrap().is_empty());
    }

    #[test]
    fn ranks_by_ascending_distance_with_stable_ties() {
        let mut index = VectorIndex::new(2);
        index.add(chunk("a", 0, vec![0.0, 1.0])).unwrap();
        index.add(chunk("a", 1, vec![1.0, 0.0])).unwrap();
        index.add(chunk("b", 0, vec![1.0, 0.0])).unwrap();
        index.add(chunk("b", 1, vec![0.5, 0.0])).unwrap();

        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        let names: Vec<_> = hits.iter().map(|h| h.chunk.text.as_str()).collect();
        assert_eq!(names, ["a-1", "b-0", "b-1"]);
        assert_eq!(hits[0].distance, 0.0);
        assert!(hits.iter().all(|h| h.distance >= 0.0));
    }

    #[test]
    fn filter_applies_before_truncation() {
        let mut index = VectorIndex::new(1);
        index.add(chunk("near", 0, vec![0.0])).unwrap();
        index.add(chunk("far", 0, vec![5.0])).unwrap();
        let hits = index.search_filtered(&[0.0], 1, |c| c.source_id == "far").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.source_id, "far");
    }

    #[test]
    fn rejects_wrong_dimensions_and_non_increasing_positions() {
        let mut index = VectorIndex::new(2);
        assert!(index.add(chunk("a", 0, vec![1.0])).is_err());
        index.add(chunk("a", 3, vec![1.0, 1.0])).unwrap();
        assert!(index.add(chunk("a", 3, vec![1.0, 1.0])).is_err());
        assert!(index.add(chunk("a", 2, vec![1.0, 1.0])).is_err());
        index.add(chunk("b", 0, vec![1.0, 1.0])).unwrap();
        assert!(index.search(&[1.0, 1.0, 1.0], 1).is_err());
    }

    #[test]
    fn neighbours_stay_within_source() {
        let mut index = VectorIndex::new(1);
        index.add(chunk("a", 0, vec![0.0])).unwrap();
        index.add(chunk("b", 1, vec![0.0])).unwrap();
        index.add(chunk("a", 1, vec![0.0])).unwrap();
        index.add(chunk("a", 2, vec![0.0])).unwrap();

        let (before, after) = index.neighbours("a", 1);
        assert_eq!(before.unwrap().text, "a-0");
        assert_eq!(after.unwrap().text, "a-2");

        let (before, after) = index.neighbours("b", 1);
        assert!(before.is_none());
        assert!(after.is_none());

        let (before, _) = index.neighbours("a", 0);
        assert!(before.is_none());
    }

    #[tokio::test]
    async fn persist_load_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("idx.json");

        let mut index = VectorIndex::new(2);
        index.add(chunk("a", 0, vec![0.1, f32::MIN_POSITIVE])).unwrap();
        index.add(chunk("a", 1, vec![-0.0, 1.0e-38])).unwrap();
        index.persist(&path).await.unwrap();

        let loaded = VectorIndex::load(&path).await.unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded.chunks()[1].embedding[0].to_bits(), (-0.0f32).to_bits());
        assert!(!temp_path(&path).exists());

        VectorIndex::delete(&path).await.unwrap();
        assert!(!path.exists());
        // idempotent
        VectorIndex::delete(&path).await.unwrap();
        assert!(VectorIndex::load(&path).await.is_err());
    }
}
