//! Corpus ingestion — parse, chunk, embed, and index uploaded documents
//! for a persona, with per-file failure isolation.

use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::embeddings::Embedder;
use crate::error::AnimaError;
use crate::index::VectorLexicalIndex;
use crate::persona::PersonaRegistry;
use crate::processing::{Chunker, DocumentInput, DocumentParser};
use crate::types::{ChunkRecord, DocumentRecord, DocumentStatus, FileOutcome, IngestReport};

/// Raw upload as delivered by the intake layer (bytes plus filename).
pub type UploadedFile = DocumentInput;

pub struct CorpusIngestor {
    parser: DocumentParser,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorLexicalIndex>,
    registry: Arc<PersonaRegistry>,
    /// Bounded worker count for files within one batch.
    max_parallel_files: usize,
    embed_batch_size: usize,
}

impl CorpusIngestor {
    pub fn new(
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorLexicalIndex>,
        registry: Arc<PersonaRegistry>,
        max_parallel_files: usize,
        embed_batch_size: usize,
    ) -> Self {
        Self {
            parser: DocumentParser::new(),
            chunker,
            embedder,
            index,
            registry,
            max_parallel_files: max_parallel_files.max(1),
            embed_batch_size: embed_batch_size.max(1),
        }
    }

    /// Ingest one upload batch for an owned persona. One file's failure is
    /// recorded in its outcome and does not abort the others.
    pub async fn ingest_batch(
        &self,
        owner_id: &str,
        persona_id: Uuid,
        files: Vec<UploadedFile>,
    ) -> Result<IngestReport, AnimaError> {
        let persona = self.registry.get(owner_id, persona_id)?;
        if files.is_empty() {
            return Err(AnimaError::ValidationError("no files in upload".into()));
        }

        self.index.create(&persona.collection_id).await?;

        let semaphore = Arc::new(Semaphore::new(self.max_parallel_files));
        let mut handles = Vec::with_capacity(files.len());

        for file in files {
            let semaphore = semaphore.clone();
            let collection_id = persona.collection_id.clone();
            let filename = file.filename.clone();
            let byte_length = file.bytes.len();

            // Files are processed in parallel up to the worker bound; the
            // outcome order is restored below.
            let fut = async move {
                let _permit = semaphore.acquire().await.ok();
                let result = self.ingest_file(persona_id, &collection_id, file).await;
                (filename, byte_length, result)
            };
            handles.push(fut);
        }

        let settled = futures::future::join_all(handles).await;

        let mut outcomes = Vec::with_capacity(settled.len());
        let mut documents = Vec::new();
        let mut chunks_indexed = 0usize;

        for (filename, byte_length, result) in settled {
            let now = chrono::Utc::now().to_rfc3339();
            match result {
                Ok((document_id, chunk_count)) => {
                    chunks_indexed += chunk_count;
                    documents.push(DocumentRecord {
                        document_id,
                        persona_id,
                        filename: filename.clone(),
                        byte_length,
                        status: DocumentStatus::Indexed,
                        failure_reason: None,
                        chunk_count,
                        created_at: now,
                    });
                    outcomes.push(FileOutcome {
                        filename,
                        document_id: Some(document_id),
                        status: DocumentStatus::Indexed,
                        chunk_count,
                        failure_reason: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(filename = %filename, error = %e, "File ingestion failed");
                    documents.push(DocumentRecord {
                        document_id: Uuid::new_v4(),
                        persona_id,
                        filename: filename.clone(),
                        byte_length,
                        status: DocumentStatus::Failed,
                        failure_reason: Some(e.to_string()),
                        chunk_count: 0,
                        created_at: now,
                    });
                    outcomes.push(FileOutcome {
                        filename,
                        document_id: None,
                        status: DocumentStatus::Failed,
                        chunk_count: 0,
                        failure_reason: Some(e.to_string()),
                    });
                }
            }
        }

        let report = IngestReport {
            batch_id: Uuid::new_v4(),
            persona_id,
            files: outcomes,
            chunks_indexed,
            completed_at: chrono::Utc::now().to_rfc3339(),
        };

        self.registry
            .record_ingest(persona_id, documents, report.clone())?;

        tracing::info!(
            persona_id = %persona_id,
            files = report.files.len(),
            chunks = chunks_indexed,
            "Ingestion batch complete"
        );
        Ok(report)
    }

    /// Parse, chunk, embed, and index a single file. Re-uploading a filename
    /// replaces its previous chunks rather than accumulating duplicates.
    async fn ingest_file(
        &self,
        persona_id: Uuid,
        collection_id: &str,
        file: UploadedFile,
    ) -> Result<(Uuid, usize), AnimaError> {
        let parsed = self.parser.parse(&file)?;

        if let Some(existing) = self
            .registry
            .find_document_by_filename(persona_id, &parsed.filename)
        {
            self.index
                .delete_document(collection_id, &existing.document_id.to_string())
                .await?;
            self.registry
                .remove_document(persona_id, existing.document_id)?;
        }

        let document_id = Uuid::new_v4();
        let spans: Vec<_> = self.chunker.chunk(&parsed.text).collect();
        if spans.is_empty() {
            return Err(AnimaError::ParseFailure(format!(
                "{}: document produced no chunks",
                parsed.filename
            )));
        }

        // Embed in bounded sub-batches; any sub-batch failure fails the file.
        let texts: Vec<String> = spans.iter().map(|s| s.text.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for window in texts.chunks(self.embed_batch_size) {
            vectors.extend(self.embedder.embed_batch(window).await?);
        }

        let records: Vec<ChunkRecord> = spans
            .into_iter()
            .zip(vectors)
            .map(|(span, vector)| ChunkRecord {
                chunk_id: ChunkRecord::chunk_id_for(document_id, span.ordinal),
                document_id,
                ordinal: span.ordinal,
                text: span.text,
                source_filename: parsed.filename.clone(),
                char_start: span.char_start,
                char_end: span.char_end,
                vector,
            })
            .collect();

        let chunk_count = records.len();
        self.index.upsert(collection_id, &records).await?;

        tracing::info!(
            filename = %parsed.filename,
            chunks = chunk_count,
            collection_id = %collection_id,
            "Indexed document"
        );
        Ok((document_id, chunk_count))
    }
}
