use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A named, owner-scoped style+content profile backed by a corpus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub persona_id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub description: Option<String>,
    /// Chat model used for this persona's analysis and chat runs.
    pub model_id: String,
    /// Vector+lexical partition owned 1:1 by this persona.
    pub collection_id: String,
    pub created_at: String,
    pub document_count: usize,
    pub chunk_count: usize,
    /// False when the collection partition is missing its index.
    pub corpus_available: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Parsed,
    Indexed,
    Failed,
}

/// One uploaded corpus document. Never mutated after reaching `indexed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: Uuid,
    pub persona_id: Uuid,
    pub filename: String,
    pub byte_length: usize,
    pub status: DocumentStatus,
    pub failure_reason: Option<String>,
    pub chunk_count: usize,
    pub created_at: String,
}

/// Internal chunk record handed to the index for storage.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Stable within a document version: `{document_id}:{ordinal}`.
    pub chunk_id: String,
    pub document_id: Uuid,
    pub ordinal: u32,
    pub text: String,
    pub source_filename: String,
    /// Code-point offsets into the parsed document text.
    pub char_start: usize,
    pub char_end: usize,
    pub vector: Vec<f32>,
}

impl ChunkRecord {
    pub fn chunk_id_for(document_id: Uuid, ordinal: u32) -> String {
        format!("{}:{}", document_id, ordinal)
    }
}

/// One result row from any of the three search modes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub chunk_id: String,
    pub text: String,
    /// Filename exactly as indexed; never re-derived downstream.
    pub source_filename: String,
    /// Fused (or single-ranking) score, monotone in relevance.
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dense_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_rank: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackType {
    Issue,
    Suggestion,
    Praise,
    Question,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackCategory {
    Clarity,
    Style,
    Logic,
    Evidence,
    Structure,
    Voice,
    Craft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A corpus citation attached to a feedback item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub source_file: String,
    #[serde(default)]
    pub relevance: f32,
}

/// A span within the submitted draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// One atomic critique unit emitted by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackItem {
    #[serde(rename = "type")]
    pub feedback_type: FeedbackType,
    pub category: FeedbackCategory,
    pub title: String,
    pub content: String,
    pub severity: Severity,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_revision: Option<String>,
    #[serde(default)]
    pub corpus_sources: Vec<CorpusSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<Vec<DraftSpan>>,
}

/// Per-file outcome of one ingestion batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
    pub status: DocumentStatus,
    pub chunk_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// Status record for one upload batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestReport {
    pub batch_id: Uuid,
    pub persona_id: Uuid,
    pub files: Vec<FileOutcome>,
    pub chunks_indexed: usize,
    pub completed_at: String,
}

/// Entry in the supported-model catalogue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feedback_item_wire_shape() {
        let json = serde_json::json!({
            "type": "issue",
            "category": "voice",
            "title": "Hedging weakens the opening",
            "content": "The corpus author commits early; this draft hedges.",
            "severity": "medium",
            "confidence": 0.8
        });
        let item: FeedbackItem = serde_json::from_value(json).unwrap();
        assert_eq!(item.feedback_type, FeedbackType::Issue);
        assert_eq!(item.category, FeedbackCategory::Voice);
        assert!(item.corpus_sources.is_empty());
        assert!(item.positions.is_none());

        let back = serde_json::to_value(&item).unwrap();
        assert_eq!(back["type"], "issue");
        assert_eq!(back["severity"], "medium");
    }

    #[test]
    fn chunk_id_is_stable_per_document_version() {
        let doc = Uuid::new_v4();
        assert_eq!(
            ChunkRecord::chunk_id_for(doc, 3),
            ChunkRecord::chunk_id_for(doc, 3)
        );
        assert_ne!(
            ChunkRecord::chunk_id_for(doc, 3),
            ChunkRecord::chunk_id_for(doc, 4)
        );
    }
}
