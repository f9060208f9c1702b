//! Engine facade wiring the registry, index, ingestor, and agent together.
//! The embedding and chat clients are process-wide, injected at
//! construction, and shared across requests.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::agent::prompt::AnalysisContext;
use crate::agent::tool_loop::{run_analysis, AgentLoopConfig, AnalysisRun};
use crate::agent::tools::{CiteTool, SearchCorpusTool, ToolRegistry};
use crate::chat::{run_chat, ChatRuntimeConfig, ChatTurn};
use crate::config::AnimaConfig;
use crate::embeddings::Embedder;
use crate::error::AnimaError;
use crate::frames::{AnalysisFrame, ChatFrame};
use crate::index::VectorLexicalIndex;
use crate::ingest::{CorpusIngestor, UploadedFile};
use crate::llm::{GenerationOptions, LlmClient};
use crate::persona::{PersonaPatch, PersonaRegistry};
use crate::processing::Chunker;
use crate::types::{
    DocumentRecord, FeedbackItem, IngestReport, ModelInfo, Persona,
};

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisRequest {
    pub content: String,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub criteria: Vec<String>,
    #[serde(default)]
    pub feedback_history: Vec<FeedbackItem>,
    #[serde(default)]
    pub max_feedback_items: Option<usize>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResponse {
    pub items: Vec<FeedbackItem>,
    pub processing_time_seconds: f64,
    pub total_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorpusStatus {
    pub status: String,
    pub documents: Vec<DocumentRecord>,
    pub chunk_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_batch: Option<IngestReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkPreview {
    pub text: String,
    pub ordinal: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentChunks {
    pub filename: String,
    pub chunk_count: usize,
    pub chunks: Vec<ChunkPreview>,
}

pub struct AnimaEngine {
    config: AnimaConfig,
    registry: Arc<PersonaRegistry>,
    index: Arc<VectorLexicalIndex>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmClient>,
    ingestor: CorpusIngestor,
}

impl AnimaEngine {
    pub async fn new(
        config: AnimaConfig,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self, AnimaError> {
        config
            .validate()
            .map_err(AnimaError::ValidationError)?;
        std::fs::create_dir_all(&config.data_dir).ok();

        let registry = Arc::new(PersonaRegistry::new(config.data_dir.join("meta")));
        let index = Arc::new(
            VectorLexicalIndex::open(
                &config.data_dir,
                config.embedding.dimension,
                config.search.candidate_multiplier,
            )
            .await?,
        );

        let ingestor = CorpusIngestor::new(
            Chunker::new(config.chunking.window_chars, config.chunking.overlap_chars),
            embedder.clone(),
            index.clone(),
            registry.clone(),
            4,
            config.embedding.max_batch_size,
        );

        Ok(Self {
            config,
            registry,
            index,
            embedder,
            llm,
            ingestor,
        })
    }

    pub fn registry(&self) -> &Arc<PersonaRegistry> {
        &self.registry
    }

    // ---- persona management ----

    pub fn create_persona(
        &self,
        owner_id: &str,
        name: &str,
        description: Option<String>,
        model_id: Option<String>,
    ) -> Result<Persona, AnimaError> {
        self.registry.create(owner_id, name, description, model_id)
    }

    pub fn list_personas(&self, owner_id: &str) -> Vec<Persona> {
        self.registry.list(owner_id)
    }

    pub fn get_persona(&self, owner_id: &str, persona_id: Uuid) -> Result<Persona, AnimaError> {
        self.registry.get(owner_id, persona_id)
    }

    pub fn update_persona(
        &self,
        owner_id: &str,
        persona_id: Uuid,
        patch: PersonaPatch,
    ) -> Result<Persona, AnimaError> {
        self.registry.update(owner_id, persona_id, patch)
    }

    /// Deletion removes the collection partition before forgetting metadata.
    pub async fn delete_persona(&self, owner_id: &str, persona_id: Uuid) -> Result<(), AnimaError> {
        let persona = self.registry.get(owner_id, persona_id)?;
        self.index.delete_collection(&persona.collection_id).await?;
        self.registry.delete(owner_id, persona_id)?;
        Ok(())
    }

    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.registry.list_models()
    }

    // ---- corpus ----

    pub async fn ingest(
        &self,
        owner_id: &str,
        persona_id: Uuid,
        files: Vec<UploadedFile>,
    ) -> Result<IngestReport, AnimaError> {
        self.ingestor.ingest_batch(owner_id, persona_id, files).await
    }

    pub fn corpus_status(
        &self,
        owner_id: &str,
        persona_id: Uuid,
    ) -> Result<CorpusStatus, AnimaError> {
        let persona = self.registry.get(owner_id, persona_id)?;
        let documents = self.registry.list_documents(owner_id, persona_id)?;
        let last_batch = self.registry.latest_report(owner_id, persona_id)?;
        let status = if !persona.corpus_available && persona.chunk_count > 0 {
            "unavailable"
        } else if persona.chunk_count > 0 {
            "ready"
        } else {
            "empty"
        };
        Ok(CorpusStatus {
            status: status.to_string(),
            documents,
            chunk_count: persona.chunk_count,
            last_batch,
        })
    }

    /// Grouped per-file chunk listing for display.
    pub async fn list_document_chunks(
        &self,
        owner_id: &str,
        persona_id: Uuid,
    ) -> Result<Vec<DocumentChunks>, AnimaError> {
        let persona = self.registry.get(owner_id, persona_id)?;
        let documents = self.registry.list_documents(owner_id, persona_id)?;

        let mut files = Vec::with_capacity(documents.len());
        for doc in documents {
            let chunks = if doc.status == crate::types::DocumentStatus::Indexed {
                self.index
                    .list_document_chunks(
                        &persona.collection_id,
                        &doc.document_id.to_string(),
                        1000,
                    )
                    .await?
            } else {
                Vec::new()
            };
            files.push(DocumentChunks {
                filename: doc.filename,
                chunk_count: doc.chunk_count,
                chunks: chunks
                    .into_iter()
                    .map(|(ordinal, text)| ChunkPreview { text, ordinal })
                    .collect(),
            });
        }
        Ok(files)
    }

    // ---- analysis ----

    fn generation_options(&self, persona: &Persona, model_override: Option<&str>) -> GenerationOptions {
        GenerationOptions {
            model: model_override
                .map(str::to_string)
                .unwrap_or_else(|| persona.model_id.clone()),
            max_tokens: self.config.llm.max_tokens,
            temperature: self.config.llm.temperature,
        }
    }

    fn build_tools(&self, persona: &Persona) -> ToolRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(SearchCorpusTool::new(
            self.index.clone(),
            self.embedder.clone(),
            self.registry.clone(),
            persona.persona_id,
            persona.collection_id.clone(),
            self.config.search.max_k,
        )));
        tools.register(Arc::new(CiteTool::new(
            self.index.clone(),
            persona.collection_id.clone(),
        )));
        tools
    }

    /// Stream one analysis run. Every outcome, including pre-flight
    /// failures, arrives as frames; the stream always ends with exactly
    /// one terminal frame.
    pub async fn analyze_stream(
        &self,
        owner_id: &str,
        persona_id: Uuid,
        request: AnalysisRequest,
        tx: mpsc::Sender<AnalysisFrame>,
    ) {
        let persona = match self.registry.get(owner_id, persona_id) {
            Ok(persona) => persona,
            Err(e) => {
                let _ = tx
                    .send(AnalysisFrame::Error {
                        message: e.to_string(),
                        kind: e.kind().to_string(),
                    })
                    .await;
                return;
            }
        };

        // A persona that claims chunks but lost its partition is an error;
        // a persona that never had a corpus still gets a toolless run.
        if persona.chunk_count > 0 && !self.index.collection_exists(&persona.collection_id).await {
            self.registry.mark_corpus_unavailable(persona_id);
            let e = AnimaError::IndexUnavailable(format!(
                "collection {} is missing",
                persona.collection_id
            ));
            let _ = tx
                .send(AnalysisFrame::Error {
                    message: e.to_string(),
                    kind: e.kind().to_string(),
                })
                .await;
            return;
        }

        let mut loop_config = AgentLoopConfig::from(&self.config.agent);
        if let Some(cap) = request.max_feedback_items {
            if cap > 0 {
                loop_config.max_feedback_items = cap;
            }
        }

        let options = self.generation_options(&persona, request.model.as_deref());
        let run = AnalysisRun {
            llm: self.llm.as_ref(),
            options,
            tools: self.build_tools(&persona),
            persona,
            draft: request.content,
            context: AnalysisContext {
                purpose: request.purpose,
                criteria: request.criteria,
                feedback_history: request.feedback_history,
            },
            config: loop_config,
        };

        run_analysis(run, tx).await;
    }

    /// Unary analysis: run the stream to completion and collect the items.
    pub async fn analyze(
        &self,
        owner_id: &str,
        persona_id: Uuid,
        request: AnalysisRequest,
    ) -> Result<AnalysisResponse, AnimaError> {
        let (tx, mut rx) = mpsc::channel(64);
        let run = self.analyze_stream(owner_id, persona_id, request, tx);

        let collector = async {
            let mut items = Vec::new();
            let mut terminal: Option<AnalysisFrame> = None;
            while let Some(frame) = rx.recv().await {
                match frame {
                    AnalysisFrame::Feedback { item } => items.push(item),
                    frame if frame.is_terminal() => terminal = Some(frame),
                    _ => {}
                }
            }
            (items, terminal)
        };

        let ((), (items, terminal)) = tokio::join!(run, collector);

        match terminal {
            Some(AnalysisFrame::Complete {
                total_items,
                processing_time_seconds,
                ..
            }) => Ok(AnalysisResponse {
                items,
                processing_time_seconds,
                total_items,
            }),
            Some(AnalysisFrame::Error { message, kind }) => Err(error_from_kind(&kind, message)),
            _ => Err(AnimaError::Internal(anyhow::anyhow!(
                "analysis stream ended without a terminal frame"
            ))),
        }
    }

    // ---- chat ----

    pub async fn chat_stream(
        &self,
        owner_id: &str,
        persona_id: Uuid,
        turn: ChatTurn,
        model_override: Option<String>,
        tx: mpsc::Sender<ChatFrame>,
    ) {
        let persona = match self.registry.get(owner_id, persona_id) {
            Ok(persona) => persona,
            Err(e) => {
                let _ = tx
                    .send(ChatFrame::Error {
                        message: e.to_string(),
                        kind: e.kind().to_string(),
                    })
                    .await;
                return;
            }
        };

        let options = self.generation_options(&persona, model_override.as_deref());
        let tools = self.build_tools(&persona);
        let config = ChatRuntimeConfig {
            iteration_cap: self.config.agent.iteration_cap,
            tool_timeout: Duration::from_secs(self.config.agent.tool_timeout_secs),
        };

        run_chat(
            self.llm.as_ref(),
            &options,
            &tools,
            &persona,
            turn,
            &config,
            tx,
        )
        .await;
    }
}

/// Rebuild an engine error from its wire kind.
fn error_from_kind(kind: &str, message: String) -> AnimaError {
    match kind {
        "not_authorized" => AnimaError::NotAuthorized(message),
        "not_found" => AnimaError::NotFound(message),
        "unsupported_format" => AnimaError::UnsupportedFormat(message),
        "parse_failure" => AnimaError::ParseFailure(message),
        "embedding_failure" => AnimaError::EmbeddingFailure(message),
        "index_unavailable" => AnimaError::IndexUnavailable(message),
        "tool_timeout" => AnimaError::ToolTimeout(message),
        "model_timeout" => AnimaError::ModelTimeout(message),
        "tool_exhaustion" => AnimaError::ToolExhaustion(message),
        "iteration_cap" => AnimaError::IterationCap(message),
        "validation_error" => AnimaError::ValidationError(message),
        "canceled" => AnimaError::Canceled,
        _ => AnimaError::Internal(anyhow::anyhow!(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::testing::HashEmbedder;
    use crate::llm::{ChatMessage, ChatResponse, ChatStreamEvent, ToolSchema};
    use async_trait::async_trait;

    const DIM: usize = 64;

    /// Scripted model: searches the corpus once, then emits one cited item.
    struct SearchingLlm;

    #[async_trait]
    impl LlmClient for SearchingLlm {
        async fn chat(
            &self,
            messages: &[ChatMessage],
            tools: &[ToolSchema],
            _options: &GenerationOptions,
        ) -> Result<ChatResponse, AnimaError> {
            let searched = messages
                .iter()
                .any(|m| m.role == crate::llm::ChatRole::Tool);
            if !searched && !tools.is_empty() {
                return Ok(ChatResponse::ToolCalls(vec![crate::llm::ToolCall {
                    id: "call_1".into(),
                    name: "search_corpus".into(),
                    arguments: serde_json::json!({"query": "cat", "k": 2}).to_string(),
                }]));
            }

            // Cite the first chunk_id seen in a tool result, if any.
            let chunk_id = messages
                .iter()
                .filter(|m| m.role == crate::llm::ChatRole::Tool)
                .filter_map(|m| m.content.as_deref())
                .filter_map(|c| serde_json::from_str::<serde_json::Value>(c).ok())
                .filter_map(|v| {
                    v["results"][0]["chunk_id"].as_str().map(str::to_string)
                })
                .next();

            let sources = match chunk_id {
                Some(id) => serde_json::json!([{"chunk_id": id, "text": "", "source_file": "", "relevance": 0.0}]),
                None => serde_json::json!([]),
            };
            Ok(ChatResponse::Content(
                serde_json::json!([{
                    "type": "issue",
                    "category": "voice",
                    "title": "Voice drifts from the corpus",
                    "content": "The draft's register is flatter than the indexed prose.",
                    "severity": "medium",
                    "confidence": 0.85,
                    "corpus_sources": sources,
                }])
                .to_string(),
            ))
        }

        async fn chat_stream(
            &self,
            messages: &[ChatMessage],
            tools: &[ToolSchema],
            options: &GenerationOptions,
        ) -> Result<mpsc::Receiver<ChatStreamEvent>, AnimaError> {
            let response = self.chat(messages, tools, options).await?;
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move {
                match response {
                    ChatResponse::Content(text) => {
                        let _ = tx.send(ChatStreamEvent::ContentDelta(text)).await;
                    }
                    ChatResponse::ToolCalls(calls) => {
                        for call in calls {
                            let _ = tx.send(ChatStreamEvent::ToolCallComplete(call)).await;
                        }
                    }
                }
                let _ = tx.send(ChatStreamEvent::Done).await;
            });
            Ok(rx)
        }
    }

    async fn engine(tmp: &std::path::Path) -> AnimaEngine {
        let mut config = AnimaConfig::default();
        config.data_dir = tmp.to_path_buf();
        config.embedding.dimension = DIM;
        AnimaEngine::new(
            config,
            Arc::new(HashEmbedder::new(DIM)),
            Arc::new(SearchingLlm),
        )
        .await
        .unwrap()
    }

    fn request(content: &str) -> AnalysisRequest {
        AnalysisRequest {
            content: content.into(),
            purpose: None,
            criteria: Vec::new(),
            feedback_history: Vec::new(),
            max_feedback_items: Some(5),
            model: None,
        }
    }

    fn upload(filename: &str, body: &str) -> UploadedFile {
        UploadedFile {
            bytes: body.as_bytes().to_vec(),
            filename: filename.into(),
            mime_hint: None,
        }
    }

    #[tokio::test]
    async fn end_to_end_analysis_with_grounded_citation() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path()).await;
        let persona = engine.create_persona("u1", "P", None, None).unwrap();

        engine
            .ingest(
                "u1",
                persona.persona_id,
                vec![
                    upload("a.txt", "the cat sat"),
                    upload("b.txt", "the dog ran"),
                ],
            )
            .await
            .unwrap();

        let response = engine
            .analyze("u1", persona.persona_id, request("A draft about cats."))
            .await
            .unwrap();

        assert_eq!(response.total_items, 1);
        let item = &response.items[0];
        // Citation was enriched from the run's hits: verbatim text + filename.
        let source = &item.corpus_sources[0];
        assert!(!source.text.is_empty());
        assert!(source.source_file.ends_with(".txt"));
    }

    #[tokio::test]
    async fn analysis_of_foreign_persona_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path()).await;
        let persona = engine.create_persona("u2", "P", None, None).unwrap();

        let err = engine
            .analyze("u1", persona.persona_id, request("draft"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_authorized");
    }

    #[tokio::test]
    async fn empty_draft_is_rejected_unary() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path()).await;
        let persona = engine.create_persona("u1", "P", None, None).unwrap();

        let err = engine
            .analyze("u1", persona.persona_id, request(""))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[tokio::test]
    async fn delete_persona_cascades_to_collection() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path()).await;
        let persona = engine.create_persona("u1", "P", None, None).unwrap();
        engine
            .ingest("u1", persona.persona_id, vec![upload("a.txt", "some corpus text")])
            .await
            .unwrap();

        engine.delete_persona("u1", persona.persona_id).await.unwrap();
        assert!(!engine.index.collection_exists(&persona.collection_id).await);
        assert!(engine.get_persona("u1", persona.persona_id).is_err());
    }

    #[tokio::test]
    async fn status_and_chunk_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path()).await;
        let persona = engine.create_persona("u1", "P", None, None).unwrap();

        let status = engine.corpus_status("u1", persona.persona_id).unwrap();
        assert_eq!(status.status, "empty");

        engine
            .ingest("u1", persona.persona_id, vec![upload("a.txt", "the cat sat")])
            .await
            .unwrap();

        let status = engine.corpus_status("u1", persona.persona_id).unwrap();
        assert_eq!(status.status, "ready");
        assert_eq!(status.chunk_count, 1);

        let files = engine
            .list_document_chunks("u1", persona.persona_id)
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, "a.txt");
        assert_eq!(files[0].chunks[0].text, "the cat sat");
        assert_eq!(files[0].chunks[0].ordinal, 0);
    }
}
