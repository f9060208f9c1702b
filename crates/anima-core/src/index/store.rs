use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
    UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, Field, Schema};
use lancedb::query::{ExecutableQuery, QueryBase};
use std::sync::Arc;

use crate::types::ChunkRecord;

/// Per-collection vector storage. Each collection is its own Lance table
/// with the vector dimension declared at creation time.
pub struct VectorStore {
    db: lancedb::Connection,
    dimension: usize,
}

impl VectorStore {
    pub async fn open(path: &str, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        Ok(Self { db, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("chunk_id", DataType::Utf8, false),
            Field::new("document_id", DataType::Utf8, false),
            Field::new("ordinal", DataType::UInt32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("source_filename", DataType::Utf8, false),
            Field::new("char_start", DataType::UInt64, false),
            Field::new("char_end", DataType::UInt64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
        ]))
    }

    pub async fn collection_exists(&self, collection_id: &str) -> Result<bool> {
        let names = self.db.table_names().execute().await?;
        Ok(names.iter().any(|n| n == collection_id))
    }

    /// Idempotent partition creation. The table is seeded with a throwaway
    /// record so Lance learns the schema, then the seed is removed.
    pub async fn create_collection(&self, collection_id: &str) -> Result<()> {
        if self.collection_exists(collection_id).await? {
            return Ok(());
        }

        let schema = self.schema();
        let seed_vec = vec![0.0f32; self.dimension];
        let values = Float32Array::from(seed_vec);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["__seed__"])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec!["__seed__"])),
                Arc::new(UInt32Array::from(vec![0u32])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(StringArray::from(vec![""])),
                Arc::new(UInt64Array::from(vec![0u64])),
                Arc::new(UInt64Array::from(vec![0u64])),
                Arc::new(vector_array) as Arc<dyn Array>,
            ],
        )
        .context("Failed to create seed RecordBatch")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.db
            .create_table(collection_id, Box::new(batches))
            .execute()
            .await
            .context("Failed to create collection table")?;

        let table = self.db.open_table(collection_id).execute().await?;
        table.delete("chunk_id = '__seed__'").await.ok();

        tracing::info!(collection_id = %collection_id, dimension = self.dimension, "Created vector collection");
        Ok(())
    }

    pub async fn delete_collection(&self, collection_id: &str) -> Result<()> {
        let names = self.db.table_names().execute().await?;
        if names.iter().any(|n| n == collection_id) {
            self.db.drop_table(collection_id, &[]).await?;
            tracing::info!(collection_id = %collection_id, "Dropped vector collection");
        }
        Ok(())
    }

    /// Upsert chunk records: duplicate `chunk_id`s overwrite.
    pub async fn upsert(&self, collection_id: &str, chunks: &[ChunkRecord]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }

        let table = self
            .db
            .open_table(collection_id)
            .execute()
            .await
            .with_context(|| format!("Failed to open collection {}", collection_id))?;

        // Remove any existing rows with the same ids first, in id batches
        // to keep predicates bounded.
        for window in chunks.chunks(50) {
            let id_list: Vec<String> = window
                .iter()
                .map(|c| format!("'{}'", c.chunk_id.replace('\'', "''")))
                .collect();
            table
                .delete(&format!("chunk_id IN ({})", id_list.join(", ")))
                .await
                .ok();
        }

        let schema = self.schema();

        let chunk_ids: Vec<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        let document_ids: Vec<String> = chunks.iter().map(|c| c.document_id.to_string()).collect();
        let ordinals: Vec<u32> = chunks.iter().map(|c| c.ordinal).collect();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let sources: Vec<&str> = chunks.iter().map(|c| c.source_filename.as_str()).collect();
        let char_starts: Vec<u64> = chunks.iter().map(|c| c.char_start as u64).collect();
        let char_ends: Vec<u64> = chunks.iter().map(|c| c.char_end as u64).collect();

        let flat_vectors: Vec<f32> = chunks
            .iter()
            .flat_map(|c| c.vector.iter().copied())
            .collect();
        let values = Float32Array::from(flat_vectors);
        let vector_field = Field::new("item", DataType::Float32, true);
        let vector_array = FixedSizeListArray::new(
            Arc::new(vector_field),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        );

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(chunk_ids)) as Arc<dyn Array>,
                Arc::new(StringArray::from(
                    document_ids.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
                )),
                Arc::new(UInt32Array::from(ordinals)),
                Arc::new(StringArray::from(texts)),
                Arc::new(StringArray::from(sources)),
                Arc::new(UInt64Array::from(char_starts)),
                Arc::new(UInt64Array::from(char_ends)),
                Arc::new(vector_array) as Arc<dyn Array>,
            ],
        )
        .context("Failed to create RecordBatch")?;

        let reader = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(Box::new(reader))
            .execute()
            .await
            .context("Failed to insert chunks")?;

        tracing::debug!(
            collection_id = %collection_id,
            count = chunks.len(),
            "Upserted chunks into vector store"
        );
        Ok(())
    }

    pub async fn delete_by_document(&self, collection_id: &str, document_id: &str) -> Result<usize> {
        if !self.collection_exists(collection_id).await? {
            return Ok(0);
        }
        let table = self.db.open_table(collection_id).execute().await?;
        let count_before = table.count_rows(None).await.unwrap_or(0);
        let predicate = format!("document_id = '{}'", document_id.replace('\'', "''"));
        table.delete(&predicate).await?;
        let count_after = table.count_rows(None).await.unwrap_or(0);
        Ok(count_before.saturating_sub(count_after))
    }

    /// Cosine-similarity search, best first. Returns `None` when the
    /// partition is missing so the caller can raise the index_missing signal.
    pub async fn search(
        &self,
        collection_id: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Option<Vec<StoredChunk>>> {
        if !self.collection_exists(collection_id).await? {
            return Ok(None);
        }

        let table = self.db.open_table(collection_id).execute().await?;
        let query_builder = table
            .query()
            .nearest_to(query)?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(k);

        let results = query_builder
            .execute()
            .await
            .context("LanceDB vector search failed")?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        Ok(Some(extract_hits_from_batches(&batches)))
    }

    /// List a document's chunks in reading order (no vector search).
    pub async fn list_by_document(
        &self,
        collection_id: &str,
        document_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredChunk>> {
        if !self.collection_exists(collection_id).await? {
            return Ok(Vec::new());
        }
        let table = self.db.open_table(collection_id).execute().await?;
        let predicate = format!("document_id = '{}'", document_id.replace('\'', "''"));
        let results = table
            .query()
            .only_if(predicate)
            .limit(limit)
            .execute()
            .await
            .context("LanceDB list query failed")?;

        let batches: Vec<RecordBatch> = futures::TryStreamExt::try_collect(results).await?;
        let mut hits = extract_hits_from_batches(&batches);
        hits.sort_by_key(|h| h.ordinal);
        Ok(hits)
    }

    pub async fn count(&self, collection_id: &str) -> Result<usize> {
        if !self.collection_exists(collection_id).await? {
            return Ok(0);
        }
        let table = self.db.open_table(collection_id).execute().await?;
        Ok(table.count_rows(None).await?)
    }
}

/// One chunk row as stored in a collection, with its similarity score.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: u32,
    pub text: String,
    pub source_filename: String,
    pub score: f32,
}

/// Extract StoredChunk records from Arrow RecordBatches. The `_distance`
/// column, when present, is converted to a similarity score.
fn extract_hits_from_batches(batches: &[RecordBatch]) -> Vec<StoredChunk> {
    let mut hits = Vec::new();
    for batch in batches {
        let chunk_ids = batch
            .column_by_name("chunk_id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let document_ids = batch
            .column_by_name("document_id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let ordinals = batch
            .column_by_name("ordinal")
            .and_then(|c| c.as_any().downcast_ref::<UInt32Array>());
        let texts = batch
            .column_by_name("text")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let sources = batch
            .column_by_name("source_filename")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let (Some(chunk_ids), Some(texts), Some(sources)) = (chunk_ids, texts, sources) else {
            continue;
        };

        for i in 0..batch.num_rows() {
            let score = distances
                .map(|d| (1.0 - d.value(i)).max(0.0))
                .unwrap_or(0.0);

            hits.push(StoredChunk {
                chunk_id: chunk_ids.value(i).to_string(),
                document_id: document_ids
                    .map(|d| d.value(i).to_string())
                    .unwrap_or_default(),
                ordinal: ordinals.map(|o| o.value(i)).unwrap_or(0),
                text: texts.value(i).to_string(),
                source_filename: sources.value(i).to_string(),
                score,
            });
        }
    }
    hits
}
