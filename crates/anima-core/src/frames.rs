use serde::{Deserialize, Serialize};

use crate::types::FeedbackItem;

/// One discrete message on an analysis stream. A stream ends with
/// exactly one terminal frame (`complete` or `error`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisFrame {
    Status {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<String>,
    },
    Feedback {
        item: FeedbackItem,
    },
    Complete {
        total_items: usize,
        processing_time_seconds: f64,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        partial: bool,
    },
    Error {
        message: String,
        kind: String,
    },
}

impl AnalysisFrame {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
            tool: None,
            stage: None,
        }
    }

    pub fn tool_status(message: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
            tool: Some(tool.into()),
            stage: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// One discrete message on a chat stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    Status {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<String>,
    },
    Token {
        content: String,
    },
    Complete {
        response: String,
    },
    Error {
        message: String,
        kind: String,
    },
}

impl ChatFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}
