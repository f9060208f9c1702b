//! Agent-visible retrieval tools.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::embeddings::Embedder;
use crate::error::AnimaError;
use crate::index::VectorLexicalIndex;
use crate::llm::ToolSchema;
use crate::persona::PersonaRegistry;
use crate::types::RetrievalHit;

/// Dense query prefix used to steer style-focused retrieval.
pub const STYLE_QUERY_PREFIX: &str = "focus on stylistic features: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Content,
    Style,
    Hybrid,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "content" => Some(Self::Content),
            "style" => Some(Self::Style),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Style => "style",
            Self::Hybrid => "hybrid",
        }
    }
}

/// Result of one tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Human-readable one-liner for status frames.
    pub summary: String,
    /// JSON payload fed back to the model.
    pub payload: Value,
    /// Retrieval hits surfaced by this call, for citation enrichment.
    pub hits: Vec<RetrievalHit>,
}

/// A tool the agent may call zero or more times per turn.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, arguments: Value) -> Result<ToolOutcome, AnimaError>;
}

/// Registry of the tools offered to one run.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn AgentTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

/// `search_corpus(query, mode, k)` — hybrid retrieval over the persona's
/// collection, with a dense-only style variant.
pub struct SearchCorpusTool {
    index: Arc<VectorLexicalIndex>,
    embedder: Arc<dyn Embedder>,
    registry: Arc<PersonaRegistry>,
    persona_id: Uuid,
    collection_id: String,
    max_k: usize,
}

impl SearchCorpusTool {
    pub fn new(
        index: Arc<VectorLexicalIndex>,
        embedder: Arc<dyn Embedder>,
        registry: Arc<PersonaRegistry>,
        persona_id: Uuid,
        collection_id: String,
        max_k: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            registry,
            persona_id,
            collection_id,
            max_k,
        }
    }
}

#[async_trait]
impl AgentTool for SearchCorpusTool {
    fn name(&self) -> &str {
        "search_corpus"
    }

    fn description(&self) -> &str {
        "Search the persona's corpus for passages relevant to a query. \
         Use mode='content' to find what the author thinks about a topic, \
         mode='style' to find how the author writes (rhythm, diction, tone), \
         or the default mode='hybrid' for both. Call this before making \
         claims about the author's voice or views."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query, in the corpus author's vocabulary where possible"
                },
                "mode": {
                    "type": "string",
                    "enum": ["content", "style", "hybrid"],
                    "description": "Retrieval mode (default hybrid)"
                },
                "k": {
                    "type": "integer",
                    "description": format!("Number of passages to return (default 8, max {})", self.max_k)
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutcome, AnimaError> {
        let query = arguments["query"]
            .as_str()
            .ok_or_else(|| AnimaError::ValidationError("missing 'query' parameter".into()))?
            .to_string();
        let mode = arguments["mode"]
            .as_str()
            .and_then(SearchMode::parse)
            .unwrap_or(SearchMode::Hybrid);
        let k = arguments["k"]
            .as_u64()
            .map(|k| k as usize)
            .unwrap_or(8)
            .clamp(1, self.max_k);

        let outcome = match mode {
            SearchMode::Style => {
                let steered = format!("{}{}", STYLE_QUERY_PREFIX, query);
                let vector = self.embedder.embed_query(&steered).await?;
                self.index
                    .search_dense(&self.collection_id, &vector, k)
                    .await?
            }
            SearchMode::Content | SearchMode::Hybrid => {
                let vector = self.embedder.embed_query(&query).await?;
                self.index
                    .search_hybrid(&self.collection_id, &query, &vector, k)
                    .await?
            }
        };

        if outcome.index_missing {
            self.registry.mark_corpus_unavailable(self.persona_id);
        }

        let results: Vec<Value> = outcome
            .hits
            .iter()
            .map(|h| {
                json!({
                    "chunk_id": h.chunk_id,
                    "text": h.text,
                    "source_filename": h.source_filename,
                    "score": h.score,
                    "mode": mode.as_str(),
                })
            })
            .collect();

        let summary = format!(
            "search \"{}\" (mode={}, k={}) returned {}",
            query,
            mode.as_str(),
            k,
            results.len()
        );

        Ok(ToolOutcome {
            summary,
            payload: json!({
                "query": query,
                "mode": mode.as_str(),
                "k": k,
                "returned": results.len(),
                "results": results,
            }),
            hits: outcome.hits,
        })
    }
}

/// `cite(chunk_id)` — verbatim chunk text and source filename for embedding
/// in a feedback citation.
pub struct CiteTool {
    index: Arc<VectorLexicalIndex>,
    collection_id: String,
}

impl CiteTool {
    pub fn new(index: Arc<VectorLexicalIndex>, collection_id: String) -> Self {
        Self {
            index,
            collection_id,
        }
    }
}

#[async_trait]
impl AgentTool for CiteTool {
    fn name(&self) -> &str {
        "cite"
    }

    fn description(&self) -> &str {
        "Fetch the exact text and source filename of a chunk by its chunk_id, \
         for quoting in a feedback citation."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "chunk_id": {
                    "type": "string",
                    "description": "A chunk_id from an earlier search_corpus result"
                }
            },
            "required": ["chunk_id"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<ToolOutcome, AnimaError> {
        let chunk_id = arguments["chunk_id"]
            .as_str()
            .ok_or_else(|| AnimaError::ValidationError("missing 'chunk_id' parameter".into()))?;

        match self.index.get_chunk(&self.collection_id, chunk_id).await? {
            Some(hit) => Ok(ToolOutcome {
                summary: format!("cite {} from {}", chunk_id, hit.source_filename),
                payload: json!({
                    "found": true,
                    "chunk_id": hit.chunk_id,
                    "text": hit.text,
                    "source_file": hit.source_filename,
                }),
                hits: vec![hit],
            }),
            None => Ok(ToolOutcome {
                summary: format!("cite {}: unknown chunk", chunk_id),
                payload: json!({ "found": false, "chunk_id": chunk_id }),
                hits: Vec::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!(SearchMode::parse("style"), Some(SearchMode::Style));
        assert_eq!(SearchMode::parse("hybrid"), Some(SearchMode::Hybrid));
        assert_eq!(SearchMode::parse("bogus"), None);
    }

    #[test]
    fn schemas_are_sorted_and_complete() {
        struct Dummy(&'static str);
        #[async_trait]
        impl AgentTool for Dummy {
            fn name(&self) -> &str {
                self.0
            }
            fn description(&self) -> &str {
                "d"
            }
            fn parameters_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, _arguments: Value) -> Result<ToolOutcome, AnimaError> {
                Ok(ToolOutcome {
                    summary: String::new(),
                    payload: Value::Null,
                    hits: Vec::new(),
                })
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Dummy("zeta")));
        registry.register(Arc::new(Dummy("alpha")));
        let schemas = registry.schemas();
        assert_eq!(schemas.len(), 2);
        assert_eq!(schemas[0].name, "alpha");
        assert_eq!(schemas[1].name, "zeta");
    }
}
