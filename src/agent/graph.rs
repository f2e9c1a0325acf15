//! The query orchestrator: a bounded state machine over
//! `retrieve -> generate -> process_tools -> decide -> finalize`, wrapped
//! by the semantic query-cache fast path.
//!
//! Each working state mutates the running `QueryState` and yields a
//! `NodeOutcome`; `decide` then picks the next state by the first matching
//! rule. Errors are captured into the state and drained at finalize, so
//! callers always receive a structured response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};

use super::prompts::{
    build_prompts, classify_question, EMPTY_ANSWER_FALLBACK, MAX_ITERATIONS_FALLBACK,
};
use super::state::{
    AgentError, NodeOutcome, QueryResponse, QueryState, ResponseMetadata, RetrievedDoc,
};
use crate::cache::tiers::QuestionClassification;
use crate::cache::CacheManager;
use crate::conversation::files::FileContent;
use crate::db::sqlite::now_rfc3339;
use crate::kb::ingest::IngestError;
use crate::kb::KnowledgeBaseManager;
use crate::llm::{LLMClient, LLMClientCompletionRequest, LLMClientMessage, MessagePart};
use crate::rag::confidence::ConfidenceCalculator;

/// Ranking score granted to attached-file context before the fusion
/// weights apply.
const FILE_DOC_SCORE: f32 = 0.9;

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: usize,
    pub top_k: usize,
    pub max_iterations: u32,
    pub query_timeout: Duration,
    pub file_content_weight: f32,
    pub kb_content_weight: f32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            llm_model: "gpt-4o-mini".to_owned(),
            llm_temperature: 0.7,
            llm_max_tokens: 2000,
            top_k: 5,
            max_iterations: 10,
            query_timeout: Duration::from_secs(60),
            file_content_weight: 1.0,
            kb_content_weight: 1.0,
        }
    }
}

#[derive(Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub file_contents: HashMap<String, FileContent>,
    pub skip_cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Retrieve,
    Generate,
    ProcessTools,
    Finalize,
}

pub struct QueryOrchestrator {
    kb_manager: Arc<KnowledgeBaseManager>,
    llm: Arc<dyn LLMClient>,
    caches: Arc<CacheManager>,
    confidence: ConfidenceCalculator,
    settings: AgentSettings,
}

impl QueryOrchestrator {
    pub fn new(
        kb_manager: Arc<KnowledgeBaseManager>,
        llm: Arc<dyn LLMClient>,
        caches: Arc<CacheManager>,
        confidence: ConfidenceCalculator,
        settings: AgentSettings,
    ) -> Self {
        Self {
            kb_manager,
            llm,
            caches,
            confidence,
            settings,
        }
    }

    /// Run one query to completion. Never returns an error: failures are
    /// folded into the response's metadata.
    pub async fn execute_query(
        &self,
        kb_id: &str,
        question: &str,
        options: QueryOptions,
    ) -> QueryResponse {
        let started = Instant::now();

        if question.trim().is_empty() {
            debug!(kb_id, "empty question short-circuits");
            return QueryResponse {
                query_id: uuid::Uuid::new_v4().to_string(),
                kb_id: kb_id.to_owned(),
                question: question.to_owned(),
                response_time_ms: elapsed_ms(started),
                ..Default::default()
            };
        }

        // Fast path: the semantic cache maps lexical variants of the same
        // question onto one stored answer.
        if !options.skip_cache {
            if let Some(mut cached) = self.caches.query.get_result(kb_id, question) {
                cached.from_cache = true;
                cached.response_time_ms = elapsed_ms(started);
                info!(kb_id, query_id = %cached.query_id, "query served from cache");
                return cached;
            }
        }

        let mut state = QueryState::new(
            kb_id.to_owned(),
            question.to_owned(),
            options.file_contents,
            self.settings.max_iterations,
            self.settings.query_timeout,
        );
        let top_k = options.top_k.unwrap_or(self.settings.top_k);

        let mut step = Step::Retrieve;
        loop {
            let outcome = match step {
                Step::Retrieve => self.retrieve(&mut state, top_k).await,
                Step::Generate => self.generate(&mut state).await,
                Step::ProcessTools => self.process_tools(&mut state),
                Step::Finalize => break,
            };

            match outcome {
                NodeOutcome::Advance => {}
                NodeOutcome::Fail(error) => {
                    warn!(query_id = %state.query_id, error = %error, "node failed");
                    state.error = Some(error);
                }
                NodeOutcome::Done => break,
            }

            step = decide(&mut state);
        }

        let response = self.finalize(state, started);

        if !options.skip_cache && response_is_cacheable(&response) {
            self.caches
                .query
                .set_result(kb_id, question, response.clone());
        }

        info!(
            query_id = %response.query_id,
            confidence = response.confidence,
            time_ms = response.response_time_ms,
            "query finished"
        );
        response
    }

    async fn retrieve(&self, state: &mut QueryState, top_k: usize) -> NodeOutcome {
        let retrieval_started = Instant::now();

        let kb_docs = match self
            .kb_manager
            .search(&state.kb_id, &state.question, Some(top_k))
            .await
        {
            Ok(results) => results,
            Err(IngestError::Embedding(e)) => {
                // Degrade to a no-context answer rather than failing the
                // query outright; the marker rides in the metadata.
                warn!(query_id = %state.query_id, error = %e, "embedding unavailable, degrading");
                state.degraded_error = Some(format!("embedding unavailable: {}", e));
                state.retrieval_exhausted = true;
                state.add_step("retrieval degraded: embedding provider unavailable");
                return NodeOutcome::Advance;
            }
            Err(e) => return NodeOutcome::Fail(AgentError::Retrieval(e.to_string())),
        };

        let mut docs = kb_docs
            .into_iter()
            .map(|r| RetrievedDoc {
                id: r.id,
                content: r.content,
                score: r.combined_score * self.settings.kb_content_weight,
                distance: r.distance,
                metadata: r.metadata,
            })
            .collect::<Vec<_>>();

        // Fuse attached conversation files in as synthetic documents.
        // Images are not context text, they ride to the vision path.
        for (filename, content) in &state.file_contents {
            if let FileContent::Text(text) = content {
                if text.trim().is_empty() {
                    continue;
                }
                docs.push(RetrievedDoc {
                    id: format!("file_{}", filename),
                    content: text.clone(),
                    score: FILE_DOC_SCORE * self.settings.file_content_weight,
                    distance: (1.0 - FILE_DOC_SCORE) / FILE_DOC_SCORE,
                    metadata: json!({
                        "source": "uploaded_file",
                        "filename": filename,
                        "kb_id": state.kb_id,
                    }),
                });
            }
        }

        docs.sort_by(|a, b| b.score.total_cmp(&a.score));
        docs.truncate(top_k);

        for doc in &docs {
            if let Some(filename) = doc.metadata.get("filename").and_then(|v| v.as_str()) {
                state.add_source(filename.to_owned());
            }
        }

        state.add_step(format!(
            "retrieved {} documents in {:.0}ms",
            docs.len(),
            elapsed_ms(retrieval_started)
        ));
        state.retrieved_docs = docs;
        NodeOutcome::Advance
    }

    async fn generate(&self, state: &mut QueryState) -> NodeOutcome {
        let generate_started = Instant::now();

        let classification = match self.caches.classifier.get_classification(&state.question) {
            Some(cached) => cached,
            None => {
                let classification = QuestionClassification {
                    question_type: classify_question(&state.question).as_str().to_owned(),
                    classified_at: now_rfc3339(),
                };
                self.caches
                    .classifier
                    .set_classification(&state.question, classification.clone());
                classification
            }
        };
        state.question_type = Some(classification.question_type);

        let (system, user) = build_prompts(&state.question, &state.retrieved_docs);

        let images = state
            .file_contents
            .values()
            .filter_map(|content| match content {
                FileContent::Image(envelope) => Some(envelope),
                FileContent::Text(_) => None,
            })
            .collect::<Vec<_>>();

        let user_message = if images.is_empty() {
            LLMClientMessage::user(user)
        } else {
            let mut parts = vec![MessagePart::text(user)];
            for image in images {
                parts.push(MessagePart::image_data_url(&image.format, &image.base64));
            }
            LLMClientMessage::user_with_parts(parts)
        };

        let request = LLMClientCompletionRequest::new(
            self.settings.llm_model.clone(),
            vec![LLMClientMessage::system(system), user_message],
            self.settings.llm_temperature,
        )
        .set_max_tokens(self.settings.llm_max_tokens);

        let (sender, _receiver) = tokio::sync::mpsc::unbounded_channel();
        let answer = match self.llm.stream_completion(request, sender).await {
            Ok(answer) => answer,
            Err(e) => {
                state.answer = Some(EMPTY_ANSWER_FALLBACK.to_owned());
                state.confidence = 0.0;
                state.confidence_level = "low".to_owned();
                return NodeOutcome::Fail(AgentError::LLMUnavailable(e.to_string()));
            }
        };

        if answer.trim().is_empty() {
            warn!(query_id = %state.query_id, "provider streamed an empty answer");
            state.degraded_error = Some("LLM returned empty output".to_owned());
            state.answer = Some(EMPTY_ANSWER_FALLBACK.to_owned());
            state.confidence = 0.0;
            state.confidence_level = "low".to_owned();
            return NodeOutcome::Advance;
        }

        let report = self
            .confidence
            .calculate(&state.question, &answer, &state.retrieved_docs);
        state.confidence = report.overall;
        state.confidence_level = report.level.as_str().to_owned();
        state.confidence_breakdown = Some(report.breakdown);
        state.answer = Some(answer);

        state.add_step(format!(
            "generated answer in {:.0}ms, confidence {:.2}",
            elapsed_ms(generate_started),
            state.confidence
        ));
        NodeOutcome::Advance
    }

    /// Tool calling is referenced by the transition table but carries no
    /// implementation: pending calls are acknowledged and skipped.
    fn process_tools(&self, state: &mut QueryState) -> NodeOutcome {
        while state.tool_results.len() < state.tool_calls.len() {
            let call = state.tool_calls[state.tool_results.len()].clone();
            state.tool_results.push(json!({ "call": call, "result": null, "skipped": true }));
        }
        state.add_step("tool calls acknowledged");
        NodeOutcome::Advance
    }

    fn finalize(&self, state: QueryState, started: Instant) -> QueryResponse {
        let error = state
            .error
            .as_ref()
            .map(|e| e.to_string())
            .or(state.degraded_error);

        QueryResponse {
            query_id: state.query_id,
            kb_id: state.kb_id,
            question: state.question,
            answer: state.answer.unwrap_or_else(|| "无法生成答案".to_owned()),
            retrieved_docs: state.retrieved_docs,
            sources: state.sources,
            confidence: state.confidence,
            confidence_level: state.confidence_level,
            confidence_breakdown: state.confidence_breakdown,
            response_time_ms: elapsed_ms(started),
            from_cache: false,
            metadata: ResponseMetadata {
                iterations: state.iteration,
                error,
                question_type: state.question_type,
                intermediate_steps: state.intermediate_steps,
            },
        }
    }
}

/// Transition table, first matching rule wins.
fn decide(state: &mut QueryState) -> Step {
    if state.error.is_some() {
        return Step::Finalize;
    }

    if state.over_deadline() {
        warn!(query_id = %state.query_id, "query exceeded its budget");
        state.error = Some(AgentError::Timeout);
        return Step::Finalize;
    }

    if state.answer.is_some() && state.confidence > 0.5 {
        return Step::Finalize;
    }

    state.iteration += 1;
    if state.iteration >= state.max_iterations {
        debug!(query_id = %state.query_id, iterations = state.iteration, "iteration budget spent");
        if state.answer.is_none() {
            state.answer = Some(MAX_ITERATIONS_FALLBACK.to_owned());
            state.confidence = 0.0;
            state.confidence_level = "low".to_owned();
        }
        return Step::Finalize;
    }

    if state.retrieved_docs.is_empty() && !state.retrieval_exhausted {
        return Step::Retrieve;
    }

    if state.answer.is_none() {
        return Step::Generate;
    }

    if state.pending_tool_calls() {
        return Step::ProcessTools;
    }

    Step::Finalize
}

fn response_is_cacheable(response: &QueryResponse) -> bool {
    response.metadata.error.is_none()
        && !response.answer.is_empty()
        && response.answer != MAX_ITERATIONS_FALLBACK
        && response.answer != EMPTY_ANSWER_FALLBACK
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
