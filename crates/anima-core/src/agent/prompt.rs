//! System and user prompt assembly for analysis and chat runs.

use crate::types::{FeedbackItem, Persona};

const FEEDBACK_SCHEMA_BLOCK: &str = r#"Respond with a JSON array of feedback items. Each item:
{
  "type": "issue" | "suggestion" | "praise" | "question",
  "category": "clarity" | "style" | "logic" | "evidence" | "structure" | "voice" | "craft",
  "title": "<one sentence>",
  "content": "<detailed critique>",
  "severity": "low" | "medium" | "high",
  "confidence": <0.0-1.0>,
  "suggested_revision": "<optional rewrite>",
  "corpus_sources": [{"chunk_id": "<id from search_corpus>", "text": "<quote>", "source_file": "<filename>", "relevance": <0.0-1.0>}],
  "positions": [{"start": <char>, "end": <char>, "text": "<exact draft excerpt>"}]
}
When you finish, output ONLY the JSON array, no surrounding prose."#;

pub fn build_analysis_system_prompt(
    persona: &Persona,
    max_feedback_items: usize,
    corpus_available: bool,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are the author behind the persona \"{}\"{}. You have been asked \
         to critique a draft as that author would: with their sensibilities, \
         standards, and voice.\n\n",
        persona.name,
        persona
            .description
            .as_deref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default()
    ));

    if corpus_available {
        prompt.push_str(
            "Your corpus is indexed and searchable. Ground every substantive \
             claim about the author's voice or views in retrieved passages. \
             You decide when and how often to search; a common pattern is one \
             content-mode pass for the draft's subject and one style-mode pass \
             for its register, but search as the draft demands. Cite retrieved \
             passages in corpus_sources using their chunk_id.\n\n",
        );
    } else {
        prompt.push_str(
            "No corpus is indexed for this persona. Critique from the draft \
             alone, set confidence to at most 0.3 on every item, and leave \
             corpus_sources empty.\n\n",
        );
    }

    prompt.push_str(&format!(
        "Balance: roughly 60% of items critical (issue/question), 40% \
         affirming (praise/suggestion). Return at most {} items; prefer \
         fewer, sharper items over padding.\n\n",
        max_feedback_items
    ));

    prompt.push_str(FEEDBACK_SCHEMA_BLOCK);
    prompt
}

pub struct AnalysisContext {
    pub purpose: Option<String>,
    pub criteria: Vec<String>,
    pub feedback_history: Vec<FeedbackItem>,
}

pub fn build_analysis_user_message(draft: &str, context: &AnalysisContext) -> String {
    let mut message = String::new();

    if let Some(purpose) = &context.purpose {
        message.push_str(&format!("Purpose of this draft: {}\n\n", purpose));
    }
    if !context.criteria.is_empty() {
        message.push_str("Focus criteria:\n");
        for criterion in &context.criteria {
            message.push_str(&format!("- {}\n", criterion));
        }
        message.push('\n');
    }
    if !context.feedback_history.is_empty() {
        message.push_str("Feedback already given on earlier drafts (do not repeat):\n");
        for item in &context.feedback_history {
            message.push_str(&format!("- [{}] {}\n", item.category_label(), item.title));
        }
        message.push('\n');
    }

    message.push_str("Draft to critique:\n\n");
    message.push_str(draft);
    message
}

impl FeedbackItem {
    fn category_label(&self) -> &'static str {
        match self.category {
            crate::types::FeedbackCategory::Clarity => "clarity",
            crate::types::FeedbackCategory::Style => "style",
            crate::types::FeedbackCategory::Logic => "logic",
            crate::types::FeedbackCategory::Evidence => "evidence",
            crate::types::FeedbackCategory::Structure => "structure",
            crate::types::FeedbackCategory::Voice => "voice",
            crate::types::FeedbackCategory::Craft => "craft",
        }
    }
}

pub fn build_chat_system_prompt(persona: &Persona, corpus_available: bool) -> String {
    let mut prompt = format!(
        "You are \"{}\"{} — speak in the first person, in the voice of the \
         author whose writings form your corpus. Stay in character.\n\n",
        persona.name,
        persona
            .description
            .as_deref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default()
    );

    if corpus_available {
        prompt.push_str(
            "Search your corpus before answering questions about your views, \
             experiences, or writing. Quote yourself where it helps.",
        );
    } else {
        prompt.push_str(
            "No corpus is indexed yet; answer from the conversation alone and \
             say so when asked about specific writings.",
        );
    }

    prompt
}
