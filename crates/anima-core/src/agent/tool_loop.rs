//! Bounded tool-calling loop that drives one analysis run: it alternates
//! between model calls and tool dispatch, streams telemetry frames, and
//! converges on a validated feedback payload.

use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::output::extract_feedback_items;
use super::prompt::{build_analysis_system_prompt, build_analysis_user_message, AnalysisContext};
use super::tools::ToolRegistry;
use crate::config::AgentConfig;
use crate::error::AnimaError;
use crate::frames::AnalysisFrame;
use crate::llm::{ChatMessage, ChatResponse, GenerationOptions, LlmClient};
use crate::types::{FeedbackItem, Persona, RetrievalHit};

#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub iteration_cap: usize,
    pub tool_call_cap: usize,
    pub tool_timeout: Duration,
    pub request_timeout: Duration,
    pub max_feedback_items: usize,
}

impl From<&AgentConfig> for AgentLoopConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            iteration_cap: config.iteration_cap,
            tool_call_cap: config.tool_call_cap,
            tool_timeout: Duration::from_secs(config.tool_timeout_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            max_feedback_items: config.max_feedback_items,
        }
    }
}

pub struct AnalysisRun<'a> {
    pub llm: &'a dyn LlmClient,
    pub options: GenerationOptions,
    pub tools: ToolRegistry,
    pub persona: Persona,
    pub draft: String,
    pub context: AnalysisContext,
    pub config: AgentLoopConfig,
}

/// Send a frame; returns false when the client is gone, which is the
/// cancellation signal: stop issuing calls and emit nothing further.
async fn send(tx: &mpsc::Sender<AnalysisFrame>, frame: AnalysisFrame) -> bool {
    tx.send(frame).await.is_ok()
}

async fn send_error(tx: &mpsc::Sender<AnalysisFrame>, error: &AnimaError) -> bool {
    send(
        tx,
        AnalysisFrame::Error {
            message: error.to_string(),
            kind: error.kind().to_string(),
        },
    )
    .await
}

/// Drive one analysis run to exactly one terminal frame (unless canceled).
pub async fn run_analysis(run: AnalysisRun<'_>, tx: mpsc::Sender<AnalysisFrame>) {
    let started = Instant::now();
    let config = &run.config;

    if run.draft.trim().is_empty() {
        send_error(&tx, &AnimaError::ValidationError("empty draft".into())).await;
        return;
    }

    let corpus_available = run.persona.chunk_count > 0 && !run.tools.is_empty();
    if corpus_available {
        if !send(&tx, AnalysisFrame::status("analyzing draft against corpus")).await {
            return;
        }
    } else if !send(&tx, AnalysisFrame::status("no corpus indexed")).await {
        return;
    }

    let system = build_analysis_system_prompt(
        &run.persona,
        config.max_feedback_items,
        corpus_available,
    );
    let mut messages = vec![
        ChatMessage::system(system),
        ChatMessage::user(build_analysis_user_message(&run.draft, &run.context)),
    ];

    let mut run_hits: HashMap<String, RetrievalHit> = HashMap::new();
    let mut total_tool_calls = 0usize;
    let mut consecutive_failures = 0usize;

    for iteration in 1..=config.iteration_cap {
        let Some(remaining) = config.request_timeout.checked_sub(started.elapsed()) else {
            send_error(&tx, &AnimaError::ModelTimeout("analysis timed out".into())).await;
            return;
        };

        // The final permitted iteration withholds tools so the model must
        // produce text, giving partial salvage a chance.
        let forced_finalize = iteration == config.iteration_cap;
        let schemas = if corpus_available && !forced_finalize {
            run.tools.schemas()
        } else {
            Vec::new()
        };

        let response =
            match tokio::time::timeout(remaining, run.llm.chat(&messages, &schemas, &run.options))
                .await
            {
                Err(_) => {
                    send_error(&tx, &AnimaError::ModelTimeout("analysis timed out".into())).await;
                    return;
                }
                Ok(Err(e)) => {
                    send_error(&tx, &e).await;
                    return;
                }
                Ok(Ok(response)) => response,
            };

        match response {
            ChatResponse::Content(text) => {
                finalize(
                    &tx,
                    &text,
                    &run_hits,
                    corpus_available,
                    forced_finalize,
                    started,
                    config.max_feedback_items,
                )
                .await;
                return;
            }
            ChatResponse::ToolCalls(calls) => {
                tracing::debug!(
                    iteration = iteration,
                    count = calls.len(),
                    "Model requested tool calls"
                );
                messages.push(ChatMessage::assistant_tool_calls(calls.clone()));

                for call in &calls {
                    total_tool_calls += 1;

                    let result = if total_tool_calls > config.tool_call_cap {
                        if !send(
                            &tx,
                            AnalysisFrame::tool_status("tool budget exhausted", &call.name),
                        )
                        .await
                        {
                            return;
                        }
                        json!({
                            "error": "tool budget exhausted; respond with the final JSON feedback now"
                        })
                        .to_string()
                    } else {
                        let arguments: serde_json::Value =
                            serde_json::from_str(&call.arguments).unwrap_or(json!({}));

                        match dispatch_tool(&run.tools, &call.name, arguments, config.tool_timeout)
                            .await
                        {
                            Ok(outcome) => {
                                consecutive_failures = 0;
                                for hit in &outcome.hits {
                                    run_hits.insert(hit.chunk_id.clone(), hit.clone());
                                }
                                if !send(
                                    &tx,
                                    AnalysisFrame::tool_status(outcome.summary.clone(), &call.name),
                                )
                                .await
                                {
                                    return;
                                }
                                outcome.payload.to_string()
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                tracing::warn!(
                                    tool = %call.name,
                                    error = %e,
                                    consecutive = consecutive_failures,
                                    "Tool call failed"
                                );
                                if !send(
                                    &tx,
                                    AnalysisFrame::tool_status(
                                        format!("{} failed: {}", call.name, e),
                                        &call.name,
                                    ),
                                )
                                .await
                                {
                                    return;
                                }
                                if consecutive_failures >= 3 {
                                    send_error(
                                        &tx,
                                        &AnimaError::ToolExhaustion(
                                            "three consecutive tool failures".into(),
                                        ),
                                    )
                                    .await;
                                    return;
                                }
                                json!({ "error": format!("{}: {}", e.kind(), e) }).to_string()
                            }
                        }
                    };

                    messages.push(ChatMessage::tool_result(&call.id, &call.name, result));
                }
            }
        }
    }

    // The model consumed every iteration without producing text.
    send_error(
        &tx,
        &AnimaError::IterationCap(format!(
            "no final response within {} iterations",
            config.iteration_cap
        )),
    )
    .await;
}

async fn dispatch_tool(
    tools: &ToolRegistry,
    name: &str,
    arguments: serde_json::Value,
    timeout: Duration,
) -> Result<super::tools::ToolOutcome, AnimaError> {
    let tool = tools
        .get(name)
        .ok_or_else(|| AnimaError::ValidationError(format!("unknown tool: {}", name)))?;

    match tokio::time::timeout(timeout, tool.execute(arguments)).await {
        Ok(result) => result,
        Err(_) => Err(AnimaError::ToolTimeout(format!(
            "{} exceeded {}s",
            name,
            timeout.as_secs()
        ))),
    }
}

async fn finalize(
    tx: &mpsc::Sender<AnalysisFrame>,
    text: &str,
    run_hits: &HashMap<String, RetrievalHit>,
    corpus_available: bool,
    forced: bool,
    started: Instant,
    max_feedback_items: usize,
) {
    let (mut items, skipped) = extract_feedback_items(text, max_feedback_items);
    if !skipped.is_empty() {
        tracing::debug!(skipped = skipped.len(), "Some feedback items failed validation");
    }

    if items.is_empty() {
        let error = if forced {
            AnimaError::IterationCap("iteration cap reached with no salvageable items".into())
        } else {
            AnimaError::ValidationError("model output contained no valid feedback items".into())
        };
        send_error(tx, &error).await;
        return;
    }

    enrich_items(&mut items, run_hits, corpus_available);

    let total_items = items.len();
    for item in items {
        if !send(tx, AnalysisFrame::Feedback { item }).await {
            return;
        }
    }

    send(
        tx,
        AnalysisFrame::Complete {
            total_items,
            processing_time_seconds: started.elapsed().as_secs_f64(),
            partial: forced,
        },
    )
    .await;
}

/// Attach verbatim corpus text to citations whose chunk_id matches a hit
/// seen in this run; unknown ids fall back to the model-supplied text.
/// Without a corpus, confidence is clamped and citations dropped.
fn enrich_items(
    items: &mut [FeedbackItem],
    run_hits: &HashMap<String, RetrievalHit>,
    corpus_available: bool,
) {
    for item in items.iter_mut() {
        if !corpus_available {
            item.confidence = item.confidence.min(0.3);
            item.corpus_sources.clear();
            continue;
        }
        for source in &mut item.corpus_sources {
            match source.chunk_id.as_deref().and_then(|id| run_hits.get(id)) {
                Some(hit) => {
                    source.text = hit.text.clone();
                    source.source_file = hit.source_filename.clone();
                    if source.relevance == 0.0 {
                        source.relevance = hit.score;
                    }
                }
                None => {
                    source.chunk_id = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::{AgentTool, ToolOutcome};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    struct FnLlm<F>
    where
        F: Fn(usize, bool) -> Result<ChatResponse, AnimaError> + Send + Sync,
    {
        calls: AtomicUsize,
        f: F,
    }

    impl<F> FnLlm<F>
    where
        F: Fn(usize, bool) -> Result<ChatResponse, AnimaError> + Send + Sync,
    {
        fn new(f: F) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                f,
            }
        }
    }

    #[async_trait]
    impl<F> LlmClient for FnLlm<F>
    where
        F: Fn(usize, bool) -> Result<ChatResponse, AnimaError> + Send + Sync,
    {
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            tools: &[crate::llm::ToolSchema],
            _options: &GenerationOptions,
        ) -> Result<ChatResponse, AnimaError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.f)(index, tools.is_empty())
        }

        async fn chat_stream(
            &self,
            messages: &[ChatMessage],
            tools: &[crate::llm::ToolSchema],
            options: &GenerationOptions,
        ) -> Result<mpsc::Receiver<crate::llm::ChatStreamEvent>, AnimaError> {
            use crate::llm::ChatStreamEvent;
            let response = self.chat(messages, tools, options).await?;
            let (tx, rx) = mpsc::channel(64);
            tokio::spawn(async move {
                match response {
                    ChatResponse::Content(text) => {
                        for piece in text.split_inclusive(' ') {
                            if tx
                                .send(ChatStreamEvent::ContentDelta(piece.to_string()))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    ChatResponse::ToolCalls(calls) => {
                        for call in calls {
                            if tx
                                .send(ChatStreamEvent::ToolCallComplete(call))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                }
                let _ = tx.send(ChatStreamEvent::Done).await;
            });
            Ok(rx)
        }
    }

    enum TestToolBehavior {
        Hits(Vec<RetrievalHit>),
        Fail,
        SleepThenHits(Duration),
    }

    struct TestTool {
        behavior: Mutex<Vec<TestToolBehavior>>,
    }

    impl TestTool {
        fn new(behaviors: Vec<TestToolBehavior>) -> Self {
            Self {
                behavior: Mutex::new(behaviors),
            }
        }
    }

    #[async_trait]
    impl AgentTool for TestTool {
        fn name(&self) -> &str {
            "search_corpus"
        }
        fn description(&self) -> &str {
            "test search"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolOutcome, AnimaError> {
            let behavior = {
                let mut behaviors = self.behavior.lock();
                if behaviors.is_empty() {
                    TestToolBehavior::Hits(Vec::new())
                } else {
                    behaviors.remove(0)
                }
            };
            match behavior {
                TestToolBehavior::Fail => {
                    Err(AnimaError::IndexUnavailable("simulated failure".into()))
                }
                TestToolBehavior::SleepThenHits(duration) => {
                    tokio::time::sleep(duration).await;
                    Ok(ToolOutcome {
                        summary: "slow search".into(),
                        payload: json!({"results": []}),
                        hits: Vec::new(),
                    })
                }
                TestToolBehavior::Hits(hits) => Ok(ToolOutcome {
                    summary: format!("search returned {}", hits.len()),
                    payload: json!({"results": hits.len()}),
                    hits,
                }),
            }
        }
    }

    fn persona(chunk_count: usize) -> Persona {
        Persona {
            persona_id: Uuid::new_v4(),
            owner_id: "u1".into(),
            name: "Test".into(),
            description: None,
            model_id: "gpt-4o".into(),
            collection_id: "anima_test".into(),
            created_at: chrono::Utc::now().to_rfc3339(),
            document_count: if chunk_count > 0 { 1 } else { 0 },
            chunk_count,
            corpus_available: chunk_count > 0,
        }
    }

    fn options() -> GenerationOptions {
        GenerationOptions {
            model: "gpt-4o".into(),
            max_tokens: 1024,
            temperature: 0.2,
        }
    }

    fn config() -> AgentLoopConfig {
        AgentLoopConfig {
            iteration_cap: 5,
            tool_call_cap: 10,
            tool_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_secs(30),
            max_feedback_items: 10,
        }
    }

    fn hit(chunk_id: &str, text: &str, file: &str) -> RetrievalHit {
        RetrievalHit {
            chunk_id: chunk_id.into(),
            text: text.into(),
            source_filename: file.into(),
            score: 0.9,
            dense_rank: Some(1),
            lexical_rank: Some(1),
        }
    }

    fn tool_call() -> crate::llm::ToolCall {
        crate::llm::ToolCall {
            id: "call_1".into(),
            name: "search_corpus".into(),
            arguments: json!({"query": "voice"}).to_string(),
        }
    }

    fn items_json(confidence: f32, chunk_id: Option<&str>) -> String {
        let sources = match chunk_id {
            Some(id) => json!([{"chunk_id": id, "text": "model text", "source_file": "guess.txt", "relevance": 0.0}]),
            None => json!([]),
        };
        json!([{
            "type": "issue",
            "category": "voice",
            "title": "Opening hedges",
            "content": "The corpus author never hedges an opening.",
            "severity": "medium",
            "confidence": confidence,
            "corpus_sources": sources,
        }])
        .to_string()
    }

    async fn collect(
        run: AnalysisRun<'_>,
    ) -> Vec<AnalysisFrame> {
        let (tx, mut rx) = mpsc::channel(64);
        run_analysis(run, tx).await;
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn registry_with(tool: TestTool) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(tool));
        registry
    }

    fn assert_single_terminal(frames: &[AnalysisFrame]) {
        let terminal_count = frames.iter().filter(|f| f.is_terminal()).count();
        assert_eq!(terminal_count, 1, "exactly one terminal frame");
        assert!(frames.last().unwrap().is_terminal(), "terminal frame is last");
    }

    #[tokio::test]
    async fn empty_draft_errors_before_any_model_call() {
        let llm = FnLlm::new(|_, _| panic!("model must not be called"));
        let run = AnalysisRun {
            llm: &llm,
            options: options(),
            tools: ToolRegistry::new(),
            persona: persona(10),
            draft: "   ".into(),
            context: AnalysisContext {
                purpose: None,
                criteria: Vec::new(),
                feedback_history: Vec::new(),
            },
            config: config(),
        };
        let frames = collect(run).await;
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            AnalysisFrame::Error { kind, message } => {
                assert_eq!(kind, "validation_error");
                assert!(message.contains("empty draft"));
            }
            other => panic!("expected error frame, got {:?}", other),
        }
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_then_finalize_enriches_citations() {
        let llm = FnLlm::new(|index, _| {
            Ok(match index {
                0 => ChatResponse::ToolCalls(vec![tool_call()]),
                _ => ChatResponse::Content(items_json(0.8, Some("doc:0"))),
            })
        });
        let run = AnalysisRun {
            llm: &llm,
            options: options(),
            tools: registry_with(TestTool::new(vec![TestToolBehavior::Hits(vec![hit(
                "doc:0",
                "verbatim corpus passage",
                "essays.txt",
            )])])),
            persona: persona(10),
            draft: "A draft worth critiquing.".into(),
            context: AnalysisContext {
                purpose: None,
                criteria: Vec::new(),
                feedback_history: Vec::new(),
            },
            config: config(),
        };

        let frames = collect(run).await;
        assert_single_terminal(&frames);

        let feedback: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                AnalysisFrame::Feedback { item } => Some(item),
                _ => None,
            })
            .collect();
        assert_eq!(feedback.len(), 1);
        let source = &feedback[0].corpus_sources[0];
        assert_eq!(source.text, "verbatim corpus passage");
        assert_eq!(source.source_file, "essays.txt");
        assert!(source.relevance > 0.0);

        // Status frames precede feedback; complete is last and not partial.
        match frames.last().unwrap() {
            AnalysisFrame::Complete { total_items, partial, .. } => {
                assert_eq!(*total_items, 1);
                assert!(!partial);
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_citation_ids_are_normalized_to_plain_text() {
        let llm = FnLlm::new(|_, _| Ok(ChatResponse::Content(items_json(0.8, Some("ghost:9")))));
        let run = AnalysisRun {
            llm: &llm,
            options: options(),
            tools: registry_with(TestTool::new(vec![])),
            persona: persona(10),
            draft: "Draft.".into(),
            context: AnalysisContext {
                purpose: None,
                criteria: Vec::new(),
                feedback_history: Vec::new(),
            },
            config: config(),
        };
        let frames = collect(run).await;
        let item = frames
            .iter()
            .find_map(|f| match f {
                AnalysisFrame::Feedback { item } => Some(item),
                _ => None,
            })
            .unwrap();
        assert!(item.corpus_sources[0].chunk_id.is_none());
        assert_eq!(item.corpus_sources[0].text, "model text");
    }

    #[tokio::test]
    async fn persona_without_corpus_runs_toolless_with_clamped_confidence() {
        let llm = FnLlm::new(|_, tools_empty| {
            assert!(tools_empty, "no tools may be offered without a corpus");
            Ok(ChatResponse::Content(items_json(0.9, None)))
        });
        let run = AnalysisRun {
            llm: &llm,
            options: options(),
            tools: registry_with(TestTool::new(vec![])),
            persona: persona(0),
            draft: "Draft.".into(),
            context: AnalysisContext {
                purpose: None,
                criteria: Vec::new(),
                feedback_history: Vec::new(),
            },
            config: config(),
        };

        let frames = collect(run).await;
        match &frames[0] {
            AnalysisFrame::Status { message, .. } => assert!(message.contains("no corpus indexed")),
            other => panic!("expected status first, got {:?}", other),
        }
        let item = frames
            .iter()
            .find_map(|f| match f {
                AnalysisFrame::Feedback { item } => Some(item),
                _ => None,
            })
            .unwrap();
        assert!(item.confidence <= 0.3);
        assert!(item.corpus_sources.is_empty());
        assert_single_terminal(&frames);
    }

    #[tokio::test]
    async fn iteration_cap_with_salvage_completes_partial() {
        // The model keeps searching while tools are offered; once the final
        // iteration withholds tools it produces a valid payload.
        let llm = FnLlm::new(|_, tools_empty| {
            Ok(if tools_empty {
                ChatResponse::Content(items_json(0.8, None))
            } else {
                ChatResponse::ToolCalls(vec![tool_call()])
            })
        });
        let run = AnalysisRun {
            llm: &llm,
            options: options(),
            tools: registry_with(TestTool::new(vec![])),
            persona: persona(10),
            draft: "Draft.".into(),
            context: AnalysisContext {
                purpose: None,
                criteria: Vec::new(),
                feedback_history: Vec::new(),
            },
            config: config(),
        };

        let frames = collect(run).await;
        assert_single_terminal(&frames);
        match frames.last().unwrap() {
            AnalysisFrame::Complete { partial, total_items, .. } => {
                assert!(partial);
                assert!(*total_items >= 1);
            }
            other => panic!("expected partial complete, got {:?}", other),
        }
        assert_eq!(llm.calls.load(Ordering::SeqCst), config().iteration_cap);
    }

    #[tokio::test]
    async fn iteration_cap_without_salvage_errors() {
        let llm = FnLlm::new(|_, tools_empty| {
            Ok(if tools_empty {
                ChatResponse::Content("I need to keep searching.".into())
            } else {
                ChatResponse::ToolCalls(vec![tool_call()])
            })
        });
        let run = AnalysisRun {
            llm: &llm,
            options: options(),
            tools: registry_with(TestTool::new(vec![])),
            persona: persona(10),
            draft: "Draft.".into(),
            context: AnalysisContext {
                purpose: None,
                criteria: Vec::new(),
                feedback_history: Vec::new(),
            },
            config: config(),
        };

        let frames = collect(run).await;
        assert_single_terminal(&frames);
        match frames.last().unwrap() {
            AnalysisFrame::Error { kind, .. } => assert_eq!(kind, "iteration_cap"),
            other => panic!("expected iteration_cap error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn three_consecutive_tool_failures_abort() {
        let llm = FnLlm::new(|_, _| Ok(ChatResponse::ToolCalls(vec![tool_call()])));
        let run = AnalysisRun {
            llm: &llm,
            options: options(),
            tools: registry_with(TestTool::new(vec![
                TestToolBehavior::Fail,
                TestToolBehavior::Fail,
                TestToolBehavior::Fail,
            ])),
            persona: persona(10),
            draft: "Draft.".into(),
            context: AnalysisContext {
                purpose: None,
                criteria: Vec::new(),
                feedback_history: Vec::new(),
            },
            config: config(),
        };

        let frames = collect(run).await;
        assert_single_terminal(&frames);
        match frames.last().unwrap() {
            AnalysisFrame::Error { kind, .. } => assert_eq!(kind, "tool_exhaustion"),
            other => panic!("expected tool_exhaustion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn tool_timeout_recovers_and_completes() {
        let llm = FnLlm::new(|index, _| {
            Ok(match index {
                0 => ChatResponse::ToolCalls(vec![tool_call()]),
                _ => ChatResponse::Content(items_json(0.7, None)),
            })
        });
        let run = AnalysisRun {
            llm: &llm,
            options: options(),
            tools: registry_with(TestTool::new(vec![TestToolBehavior::SleepThenHits(
                Duration::from_secs(5),
            )])),
            persona: persona(10),
            draft: "Draft.".into(),
            context: AnalysisContext {
                purpose: None,
                criteria: Vec::new(),
                feedback_history: Vec::new(),
            },
            config: config(),
        };

        let frames = collect(run).await;
        assert_single_terminal(&frames);
        assert!(frames.iter().any(|f| matches!(
            f,
            AnalysisFrame::Status { message, .. } if message.contains("timed out") || message.contains("exceeded")
        )));
        assert!(matches!(
            frames.last().unwrap(),
            AnalysisFrame::Complete { .. }
        ));
    }

    #[tokio::test]
    async fn tool_budget_cap_feeds_synthetic_results() {
        // Model requests three calls per iteration against a budget of 2;
        // the third call gets the budget-exhausted synthetic result and the
        // run still completes on the next content response.
        let llm = FnLlm::new(|index, _| {
            Ok(match index {
                0 => ChatResponse::ToolCalls(vec![
                    crate::llm::ToolCall {
                        id: "c1".into(),
                        name: "search_corpus".into(),
                        arguments: "{\"query\":\"a\"}".into(),
                    },
                    crate::llm::ToolCall {
                        id: "c2".into(),
                        name: "search_corpus".into(),
                        arguments: "{\"query\":\"b\"}".into(),
                    },
                    crate::llm::ToolCall {
                        id: "c3".into(),
                        name: "search_corpus".into(),
                        arguments: "{\"query\":\"c\"}".into(),
                    },
                ]),
                _ => ChatResponse::Content(items_json(0.8, None)),
            })
        });
        let mut cfg = config();
        cfg.tool_call_cap = 2;
        let run = AnalysisRun {
            llm: &llm,
            options: options(),
            tools: registry_with(TestTool::new(vec![])),
            persona: persona(10),
            draft: "Draft.".into(),
            context: AnalysisContext {
                purpose: None,
                criteria: Vec::new(),
                feedback_history: Vec::new(),
            },
            config: cfg,
        };

        let frames = collect(run).await;
        assert_single_terminal(&frames);
        assert!(frames.iter().any(|f| matches!(
            f,
            AnalysisFrame::Status { message, .. } if message.contains("tool budget exhausted")
        )));
        assert!(matches!(frames.last().unwrap(), AnalysisFrame::Complete { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let llm = Arc::new(FnLlm::new(|_, _| {
            Ok(ChatResponse::ToolCalls(vec![tool_call()]))
        }));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let run = AnalysisRun {
            llm: llm.as_ref(),
            options: options(),
            tools: registry_with(TestTool::new(vec![])),
            persona: persona(10),
            draft: "Draft.".into(),
            context: AnalysisContext {
                purpose: None,
                criteria: Vec::new(),
                feedback_history: Vec::new(),
            },
            config: config(),
        };
        run_analysis(run, tx).await;
        // The first status send fails, so the model is never consulted.
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }
}
