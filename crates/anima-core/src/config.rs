use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimaConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub search: SearchConfig,
    pub agent: AgentConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible embeddings endpoint.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimension: usize,
    /// Per-request text limit of the upstream model.
    pub max_batch_size: usize,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub window_chars: usize,
    pub overlap_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Upper bound on `k` the retrieval tools accept.
    pub max_k: usize,
    /// Sub-ranking depth multiplier for hybrid fusion (k_sub = multiplier * k).
    pub candidate_multiplier: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on model round-trips per analysis run.
    pub iteration_cap: usize,
    /// Soft cap on total tool calls per run.
    pub tool_call_cap: usize,
    pub tool_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub max_feedback_items: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub api_key: Option<String>,
    pub default_model: String,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl AnimaConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.embedding.max_batch_size == 0 {
            return Err("embedding.max_batch_size must be > 0".into());
        }
        if self.chunking.window_chars < 50 {
            return Err("chunking.window_chars must be >= 50".into());
        }
        if self.chunking.overlap_chars >= self.chunking.window_chars {
            return Err("chunking.overlap_chars must be < window_chars".into());
        }
        if self.search.max_k == 0 {
            return Err("search.max_k must be > 0".into());
        }
        if self.search.candidate_multiplier == 0 {
            return Err("search.candidate_multiplier must be > 0".into());
        }
        if self.agent.iteration_cap == 0 {
            return Err("agent.iteration_cap must be > 0".into());
        }
        if self.agent.max_feedback_items == 0 {
            return Err("agent.max_feedback_items must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for AnimaConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("anima");

        Self {
            data_dir,
            embedding: EmbeddingConfig {
                endpoint: "https://api.openai.com/v1/embeddings".to_string(),
                api_key: std::env::var("ANIMA_EMBEDDING_API_KEY").ok(),
                model: "text-embedding-3-small".to_string(),
                dimension: 1536,
                max_batch_size: 96,
                max_retries: 3,
            },
            chunking: ChunkingConfig {
                window_chars: 800,
                overlap_chars: 100,
            },
            search: SearchConfig {
                max_k: 80,
                candidate_multiplier: 2,
            },
            agent: AgentConfig {
                iteration_cap: 20,
                tool_call_cap: 10,
                tool_timeout_secs: 30,
                request_timeout_secs: 180,
                max_feedback_items: 10,
            },
            llm: LlmConfig {
                endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
                api_key: std::env::var("ANIMA_LLM_API_KEY").ok(),
                default_model: "gpt-4o".to_string(),
                max_tokens: 4096,
                temperature: 0.4,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(AnimaConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_overlap_not_smaller_than_window() {
        let mut config = AnimaConfig::default();
        config.chunking.overlap_chars = config.chunking.window_chars;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_dimension() {
        let mut config = AnimaConfig::default();
        config.embedding.dimension = 0;
        assert!(config.validate().is_err());
    }
}
