use thiserror::Error;

/// Engine-level error taxonomy. Every variant maps to a stable `kind`
/// string carried on the wire as `{kind, message, details?}`.
#[derive(Debug, Error)]
pub enum AnimaError {
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("embedding failure: {0}")]
    EmbeddingFailure(String),

    #[error("index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("tool timed out: {0}")]
    ToolTimeout(String),

    #[error("model timed out: {0}")]
    ModelTimeout(String),

    #[error("tool exhaustion: {0}")]
    ToolExhaustion(String),

    #[error("iteration cap reached: {0}")]
    IterationCap(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("request canceled")]
    Canceled,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AnimaError {
    /// Stable wire identifier for this error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotAuthorized(_) => "not_authorized",
            Self::NotFound(_) => "not_found",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::ParseFailure(_) => "parse_failure",
            Self::EmbeddingFailure(_) => "embedding_failure",
            Self::IndexUnavailable(_) => "index_unavailable",
            Self::ToolTimeout(_) => "tool_timeout",
            Self::ModelTimeout(_) => "model_timeout",
            Self::ToolExhaustion(_) => "tool_exhaustion",
            Self::IterationCap(_) => "iteration_cap",
            Self::ValidationError(_) => "validation_error",
            Self::Canceled => "canceled",
            Self::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, AnimaError>;
