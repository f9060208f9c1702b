//! Per-persona vector+lexical index partitions with hybrid retrieval.

pub mod fusion;
pub mod store;
pub mod text_search;

use anyhow::anyhow;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::AnimaError;
use crate::types::{ChunkRecord, RetrievalHit};
use fusion::{reciprocal_rank_fusion, Candidate};
use store::{StoredChunk, VectorStore};
use text_search::{LexicalHit, LexicalRow, LexicalStore};

/// Search result plus the partition-missing signal: a query against a
/// missing partition returns empty rather than failing, and the caller
/// uses the signal to mark the persona `corpus_available = false`.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub hits: Vec<RetrievalHit>,
    pub index_missing: bool,
}

pub struct VectorLexicalIndex {
    store: VectorStore,
    lexical: LexicalStore,
    /// Sub-ranking depth multiplier for hybrid fusion.
    candidate_multiplier: usize,
    /// Writes to a single collection are serialized to keep counters accurate.
    write_leases: DashMap<String, Arc<Mutex<()>>>,
}

impl VectorLexicalIndex {
    pub async fn open(
        data_dir: &Path,
        dimension: usize,
        candidate_multiplier: usize,
    ) -> Result<Self, AnimaError> {
        let lance_path = data_dir.join("lance");
        let store = VectorStore::open(
            lance_path.to_str().unwrap_or("./lance"),
            dimension,
        )
        .await
        .map_err(|e| AnimaError::IndexUnavailable(format!("{:#}", e)))?;

        let lexical = LexicalStore::new(data_dir.join("tantivy"));

        Ok(Self {
            store,
            lexical,
            candidate_multiplier: candidate_multiplier.max(1),
            write_leases: DashMap::new(),
        })
    }

    fn lease(&self, collection_id: &str) -> Arc<Mutex<()>> {
        self.write_leases
            .entry(collection_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Idempotent partition creation with the declared vector dimension.
    pub async fn create(&self, collection_id: &str) -> Result<(), AnimaError> {
        let lease = self.lease(collection_id);
        let _guard = lease.lock().await;
        self.store
            .create_collection(collection_id)
            .await
            .map_err(|e| AnimaError::IndexUnavailable(format!("{:#}", e)))?;
        self.lexical
            .create_collection(collection_id)
            .map_err(|e| AnimaError::IndexUnavailable(format!("{:#}", e)))?;
        Ok(())
    }

    pub async fn collection_exists(&self, collection_id: &str) -> bool {
        self.store
            .collection_exists(collection_id)
            .await
            .unwrap_or(false)
    }

    /// Upsert into both stores. Writes fail loudly.
    pub async fn upsert(
        &self,
        collection_id: &str,
        chunks: &[ChunkRecord],
    ) -> Result<(), AnimaError> {
        let lease = self.lease(collection_id);
        let _guard = lease.lock().await;

        if !self
            .store
            .collection_exists(collection_id)
            .await
            .map_err(AnimaError::Internal)?
        {
            return Err(AnimaError::IndexUnavailable(format!(
                "collection {} does not exist",
                collection_id
            )));
        }

        self.store
            .upsert(collection_id, chunks)
            .await
            .map_err(AnimaError::Internal)?;

        let rows: Vec<LexicalRow> = chunks
            .iter()
            .map(|c| LexicalRow {
                chunk_id: c.chunk_id.clone(),
                document_id: c.document_id.to_string(),
                ordinal: c.ordinal,
                text: c.text.clone(),
                source_filename: c.source_filename.clone(),
            })
            .collect();
        self.lexical
            .index_batch(collection_id, &rows)
            .map_err(AnimaError::Internal)?;

        Ok(())
    }

    /// Remove the partition and all contents from both stores.
    pub async fn delete_collection(&self, collection_id: &str) -> Result<(), AnimaError> {
        let lease = self.lease(collection_id);
        let _guard = lease.lock().await;
        self.store
            .delete_collection(collection_id)
            .await
            .map_err(AnimaError::Internal)?;
        self.lexical
            .delete_collection(collection_id)
            .map_err(AnimaError::Internal)?;
        self.write_leases.remove(collection_id);
        Ok(())
    }

    /// Remove one document's chunks from both stores. Returns the number
    /// of vector rows removed.
    pub async fn delete_document(
        &self,
        collection_id: &str,
        document_id: &str,
    ) -> Result<usize, AnimaError> {
        let lease = self.lease(collection_id);
        let _guard = lease.lock().await;
        let removed = self
            .store
            .delete_by_document(collection_id, document_id)
            .await
            .map_err(AnimaError::Internal)?;
        self.lexical
            .delete_document(collection_id, document_id)
            .map_err(AnimaError::Internal)?;
        Ok(removed)
    }

    pub async fn chunk_count(&self, collection_id: &str) -> Result<usize, AnimaError> {
        self.store
            .count(collection_id)
            .await
            .map_err(AnimaError::Internal)
    }

    /// Cosine-similarity search over the collection's vectors.
    pub async fn search_dense(
        &self,
        collection_id: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<SearchOutcome, AnimaError> {
        if query_vector.len() != self.store.dimension() {
            return Err(AnimaError::Internal(anyhow!(
                "query vector dimension {} does not match index dimension {}",
                query_vector.len(),
                self.store.dimension()
            )));
        }

        let Some(stored) = self
            .store
            .search(collection_id, query_vector, k)
            .await
            .map_err(AnimaError::Internal)?
        else {
            return Ok(SearchOutcome {
                hits: Vec::new(),
                index_missing: true,
            });
        };

        let hits = stored
            .into_iter()
            .enumerate()
            .map(|(i, c)| RetrievalHit {
                chunk_id: c.chunk_id,
                text: c.text,
                source_filename: c.source_filename,
                score: c.score,
                dense_rank: Some(i + 1),
                lexical_rank: None,
            })
            .collect();

        Ok(SearchOutcome {
            hits,
            index_missing: false,
        })
    }

    /// BM25 search over the collection's text.
    pub async fn search_lexical(
        &self,
        collection_id: &str,
        query_text: &str,
        k: usize,
    ) -> Result<SearchOutcome, AnimaError> {
        let Some(found) = self
            .lexical
            .search(collection_id, query_text, k)
            .map_err(AnimaError::Internal)?
        else {
            return Ok(SearchOutcome {
                hits: Vec::new(),
                index_missing: true,
            });
        };

        let hits = found
            .into_iter()
            .enumerate()
            .map(|(i, c)| RetrievalHit {
                chunk_id: c.chunk_id,
                text: c.text,
                source_filename: c.source_filename,
                score: c.score,
                dense_rank: None,
                lexical_rank: Some(i + 1),
            })
            .collect();

        Ok(SearchOutcome {
            hits,
            index_missing: false,
        })
    }

    /// Hybrid search: dense and lexical sub-rankings of depth
    /// `candidate_multiplier * k`, fused with RRF plus overlap bonus.
    pub async fn search_hybrid(
        &self,
        collection_id: &str,
        query_text: &str,
        query_vector: &[f32],
        k: usize,
    ) -> Result<SearchOutcome, AnimaError> {
        let k_sub = k * self.candidate_multiplier;

        let dense = self
            .store
            .search(collection_id, query_vector, k_sub)
            .await
            .map_err(AnimaError::Internal)?;
        let lexical = self
            .lexical
            .search(collection_id, query_text, k_sub)
            .map_err(AnimaError::Internal)?;

        let index_missing = dense.is_none() || lexical.is_none();
        let dense_candidates: Vec<Candidate> = dense
            .unwrap_or_default()
            .into_iter()
            .map(candidate_from_stored)
            .collect();
        let lexical_candidates: Vec<Candidate> = lexical
            .unwrap_or_default()
            .into_iter()
            .map(candidate_from_lexical)
            .collect();

        let fused = reciprocal_rank_fusion(dense_candidates, lexical_candidates, k);
        let hits = fused
            .into_iter()
            .map(|f| RetrievalHit {
                chunk_id: f.candidate.chunk_id,
                text: f.candidate.text,
                source_filename: f.candidate.source_filename,
                score: f.score,
                dense_rank: f.dense_rank,
                lexical_rank: f.lexical_rank,
            })
            .collect();

        Ok(SearchOutcome {
            hits,
            index_missing,
        })
    }

    /// List a document's chunks in reading order, for display groupings.
    pub async fn list_document_chunks(
        &self,
        collection_id: &str,
        document_id: &str,
        limit: usize,
    ) -> Result<Vec<(u32, String)>, AnimaError> {
        let chunks = self
            .store
            .list_by_document(collection_id, document_id, limit)
            .await
            .map_err(AnimaError::Internal)?;
        Ok(chunks.into_iter().map(|c| (c.ordinal, c.text)).collect())
    }

    /// Fetch one chunk's verbatim text and source filename by id.
    pub async fn get_chunk(
        &self,
        collection_id: &str,
        chunk_id: &str,
    ) -> Result<Option<RetrievalHit>, AnimaError> {
        let found = self
            .lexical
            .get_by_id(collection_id, chunk_id)
            .map_err(AnimaError::Internal)?;
        Ok(found.map(|c| RetrievalHit {
            chunk_id: c.chunk_id,
            text: c.text,
            source_filename: c.source_filename,
            score: 0.0,
            dense_rank: None,
            lexical_rank: None,
        }))
    }
}

fn candidate_from_stored(c: StoredChunk) -> Candidate {
    Candidate {
        chunk_id: c.chunk_id,
        document_id: c.document_id,
        ordinal: c.ordinal,
        text: c.text,
        source_filename: c.source_filename,
    }
}

fn candidate_from_lexical(c: LexicalHit) -> Candidate {
    Candidate {
        chunk_id: c.chunk_id,
        document_id: c.document_id,
        ordinal: c.ordinal,
        text: c.text,
        source_filename: c.source_filename,
    }
}
