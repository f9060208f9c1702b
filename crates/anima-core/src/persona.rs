//! Persona management — owner-scoped CRUD with JSON-based persistence.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::AnimaError;
use crate::types::{DocumentRecord, IngestReport, ModelInfo, Persona};

/// Maps `owner_id x persona_id` to an authorized persona (and thereby its
/// `collection_id`). The registry is the in-process implementation; the
/// seam exists so transports can substitute their own resolution.
pub trait IdentityStore: Send + Sync {
    fn resolve(&self, owner_id: &str, persona_id: Uuid) -> Result<Persona, AnimaError>;
}

/// Fields an owner may change after creation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersonaPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub model_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryState {
    personas: Vec<Persona>,
    documents: HashMap<Uuid, Vec<DocumentRecord>>,
    /// Latest ingestion batch per persona.
    batches: HashMap<Uuid, IngestReport>,
}

pub struct PersonaRegistry {
    state: Mutex<RegistryState>,
    data_dir: PathBuf,
}

impl PersonaRegistry {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let state = Self::load_state(&data_dir).unwrap_or_default();
        Self {
            state: Mutex::new(state),
            data_dir,
        }
    }

    fn state_file(data_dir: &PathBuf) -> PathBuf {
        data_dir.join("personas.json")
    }

    fn load_state(data_dir: &PathBuf) -> Option<RegistryState> {
        let data = fs::read_to_string(Self::state_file(data_dir)).ok()?;
        match serde_json::from_str(&data) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse persona registry, starting empty");
                None
            }
        }
    }

    fn save(&self, state: &RegistryState) -> Result<(), AnimaError> {
        fs::create_dir_all(&self.data_dir)
            .map_err(|e| AnimaError::Internal(anyhow::anyhow!("create data dir: {}", e)))?;
        let data = serde_json::to_string_pretty(state)
            .map_err(|e| AnimaError::Internal(anyhow::anyhow!("serialize registry: {}", e)))?;
        fs::write(Self::state_file(&self.data_dir), data)
            .map_err(|e| AnimaError::Internal(anyhow::anyhow!("write registry: {}", e)))?;
        Ok(())
    }

    pub fn create(
        &self,
        owner_id: &str,
        name: &str,
        description: Option<String>,
        model_id: Option<String>,
    ) -> Result<Persona, AnimaError> {
        if name.trim().is_empty() {
            return Err(AnimaError::ValidationError("persona name is empty".into()));
        }

        let mut state = self.state.lock();
        if state
            .personas
            .iter()
            .any(|p| p.owner_id == owner_id && p.name == name)
        {
            return Err(AnimaError::ValidationError(format!(
                "a persona named '{}' already exists",
                name
            )));
        }

        let persona_id = Uuid::new_v4();
        let persona = Persona {
            persona_id,
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            description,
            model_id: model_id.unwrap_or_else(|| default_model_id().to_string()),
            collection_id: format!("anima_{}", persona_id.simple()),
            created_at: chrono::Utc::now().to_rfc3339(),
            document_count: 0,
            chunk_count: 0,
            corpus_available: false,
        };

        state.personas.push(persona.clone());
        self.save(&state)?;
        tracing::info!(persona_id = %persona_id, owner_id = %owner_id, "Created persona");
        Ok(persona)
    }

    pub fn list(&self, owner_id: &str) -> Vec<Persona> {
        let state = self.state.lock();
        state
            .personas
            .iter()
            .filter(|p| p.owner_id == owner_id)
            .cloned()
            .collect()
    }

    /// Every operation rejects cross-owner access.
    pub fn get(&self, owner_id: &str, persona_id: Uuid) -> Result<Persona, AnimaError> {
        let state = self.state.lock();
        let persona = state
            .personas
            .iter()
            .find(|p| p.persona_id == persona_id)
            .ok_or_else(|| AnimaError::NotFound(format!("persona {}", persona_id)))?;
        if persona.owner_id != owner_id {
            return Err(AnimaError::NotAuthorized(format!(
                "user {} does not own persona {}",
                owner_id, persona_id
            )));
        }
        Ok(persona.clone())
    }

    pub fn update(
        &self,
        owner_id: &str,
        persona_id: Uuid,
        patch: PersonaPatch,
    ) -> Result<Persona, AnimaError> {
        let mut state = self.state.lock();
        let persona = find_owned_mut(&mut state.personas, owner_id, persona_id)?;

        if let Some(name) = patch.name {
            if name.trim().is_empty() {
                return Err(AnimaError::ValidationError("persona name is empty".into()));
            }
            persona.name = name;
        }
        if let Some(description) = patch.description {
            persona.description = Some(description);
        }
        if let Some(model_id) = patch.model_id {
            persona.model_id = model_id;
        }
        let updated = persona.clone();
        self.save(&state)?;
        Ok(updated)
    }

    /// Forget persona metadata. The caller must have deleted the collection
    /// partition first; the removed persona (carrying its collection_id) is
    /// returned for verification.
    pub fn delete(&self, owner_id: &str, persona_id: Uuid) -> Result<Persona, AnimaError> {
        let mut state = self.state.lock();
        // Authorization check before any mutation
        find_owned_mut(&mut state.personas, owner_id, persona_id)?;

        let index = state
            .personas
            .iter()
            .position(|p| p.persona_id == persona_id)
            .ok_or_else(|| AnimaError::NotFound(format!("persona {}", persona_id)))?;
        let removed = state.personas.remove(index);
        state.documents.remove(&persona_id);
        state.batches.remove(&persona_id);
        self.save(&state)?;
        tracing::info!(persona_id = %persona_id, "Deleted persona");
        Ok(removed)
    }

    pub fn list_documents(
        &self,
        owner_id: &str,
        persona_id: Uuid,
    ) -> Result<Vec<DocumentRecord>, AnimaError> {
        self.get(owner_id, persona_id)?;
        let state = self.state.lock();
        Ok(state
            .documents
            .get(&persona_id)
            .cloned()
            .unwrap_or_default())
    }

    pub fn find_document_by_filename(
        &self,
        persona_id: Uuid,
        filename: &str,
    ) -> Option<DocumentRecord> {
        let state = self.state.lock();
        state
            .documents
            .get(&persona_id)?
            .iter()
            .find(|d| d.filename == filename)
            .cloned()
    }

    /// Remove one document record and shrink the persona counters.
    pub fn remove_document(&self, persona_id: Uuid, document_id: Uuid) -> Result<(), AnimaError> {
        let mut state = self.state.lock();
        let mut removed_chunks = 0usize;
        let mut removed_docs = 0usize;
        if let Some(docs) = state.documents.get_mut(&persona_id) {
            if let Some(pos) = docs.iter().position(|d| d.document_id == document_id) {
                removed_chunks = docs[pos].chunk_count;
                docs.remove(pos);
                removed_docs = 1;
            }
        }
        if let Some(persona) = state.personas.iter_mut().find(|p| p.persona_id == persona_id) {
            persona.document_count = persona.document_count.saturating_sub(removed_docs);
            persona.chunk_count = persona.chunk_count.saturating_sub(removed_chunks);
        }
        self.save(&state)
    }

    /// Record one ingestion batch: append/replace document records, refresh
    /// counters, and remember the batch as the persona's latest status.
    pub fn record_ingest(
        &self,
        persona_id: Uuid,
        new_documents: Vec<DocumentRecord>,
        report: IngestReport,
    ) -> Result<(), AnimaError> {
        let mut state = self.state.lock();

        {
            let docs = state.documents.entry(persona_id).or_default();
            for doc in new_documents {
                docs.retain(|d| d.filename != doc.filename);
                docs.push(doc);
            }
        }

        let (document_count, chunk_count) = state
            .documents
            .get(&persona_id)
            .map(|docs| {
                let indexed = docs
                    .iter()
                    .filter(|d| d.status == crate::types::DocumentStatus::Indexed);
                (
                    indexed.clone().count(),
                    indexed.map(|d| d.chunk_count).sum::<usize>(),
                )
            })
            .unwrap_or((0, 0));

        if let Some(persona) = state.personas.iter_mut().find(|p| p.persona_id == persona_id) {
            persona.document_count = document_count;
            persona.chunk_count = chunk_count;
            persona.corpus_available = chunk_count > 0;
        }

        state.batches.insert(persona_id, report);
        self.save(&state)
    }

    pub fn latest_report(
        &self,
        owner_id: &str,
        persona_id: Uuid,
    ) -> Result<Option<IngestReport>, AnimaError> {
        self.get(owner_id, persona_id)?;
        let state = self.state.lock();
        Ok(state.batches.get(&persona_id).cloned())
    }

    /// Raised by searches that observe a missing partition.
    pub fn mark_corpus_unavailable(&self, persona_id: Uuid) {
        let mut state = self.state.lock();
        if let Some(persona) = state.personas.iter_mut().find(|p| p.persona_id == persona_id) {
            if persona.corpus_available {
                tracing::warn!(persona_id = %persona_id, "Marking persona corpus unavailable");
                persona.corpus_available = false;
            }
        }
        let _ = self.save(&state);
    }

    pub fn list_models(&self) -> Vec<ModelInfo> {
        model_catalogue()
    }
}

impl IdentityStore for PersonaRegistry {
    fn resolve(&self, owner_id: &str, persona_id: Uuid) -> Result<Persona, AnimaError> {
        self.get(owner_id, persona_id)
    }
}

fn find_owned_mut<'a>(
    personas: &'a mut [Persona],
    owner_id: &str,
    persona_id: Uuid,
) -> Result<&'a mut Persona, AnimaError> {
    let persona = personas
        .iter_mut()
        .find(|p| p.persona_id == persona_id)
        .ok_or_else(|| AnimaError::NotFound(format!("persona {}", persona_id)))?;
    if persona.owner_id != owner_id {
        return Err(AnimaError::NotAuthorized(format!(
            "user {} does not own persona {}",
            owner_id, persona_id
        )));
    }
    Ok(persona)
}

pub fn default_model_id() -> &'static str {
    "gpt-4o"
}

fn model_catalogue() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "gpt-4o".into(),
            name: "GPT-4o".into(),
            provider: "openai".into(),
            description: "Default analysis and chat model".into(),
        },
        ModelInfo {
            id: "gpt-4o-mini".into(),
            name: "GPT-4o mini".into(),
            provider: "openai".into(),
            description: "Faster, cheaper analysis for short drafts".into(),
        },
        ModelInfo {
            id: "claude-sonnet-4-20250514".into(),
            name: "Claude Sonnet 4".into(),
            provider: "anthropic".into(),
            description: "Alternative critique model via an OpenAI-compatible gateway".into(),
        },
    ]
}
