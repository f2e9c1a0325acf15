//! State carried through the query machine and the response shape handed
//! back to callers (and stored in the query cache).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conversation::files::FileContent;
use crate::rag::confidence::ConfidenceBreakdown;

#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("query exceeded its time budget")]
    Timeout,

    #[error("LLM provider unavailable: {0}")]
    LLMUnavailable(String),

    #[error("embedding provider unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// One retrieved context document. `score` is the ranking score (larger is
/// better) used for fusion ordering; `distance` is the raw vector distance
/// the confidence scorer works from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDoc {
    pub id: String,
    pub content: String,
    pub score: f32,
    pub distance: f32,
    pub metadata: serde_json::Value,
}

/// Outcome of a single node run. `Advance` merges its mutations into the
/// running state and hands control back to `decide`; `Fail` records the
/// error and forces finalisation; `Done` only ever comes out of finalize.
#[derive(Debug)]
pub enum NodeOutcome {
    Advance,
    Fail(AgentError),
    Done,
}

pub struct QueryState {
    pub query_id: String,
    pub kb_id: String,
    pub question: String,
    pub retrieved_docs: Vec<RetrievedDoc>,
    pub answer: Option<String>,
    pub confidence: f32,
    pub confidence_level: String,
    pub confidence_breakdown: Option<ConfidenceBreakdown>,
    pub question_type: Option<String>,
    pub tool_calls: Vec<serde_json::Value>,
    pub tool_results: Vec<serde_json::Value>,
    pub sources: Vec<String>,
    pub intermediate_steps: Vec<String>,
    pub file_contents: HashMap<String, FileContent>,
    pub error: Option<AgentError>,
    /// Degraded-path marker (embedding outage, empty LLM output): surfaced
    /// in response metadata without aborting the machine.
    pub degraded_error: Option<String>,
    /// Set when retrieval cannot be retried (provider outage); routes the
    /// machine to generation with a no-context prompt.
    pub retrieval_exhausted: bool,
    pub iteration: u32,
    pub max_iterations: u32,
    pub started: Instant,
    pub deadline: Duration,
}

impl QueryState {
    pub fn new(
        kb_id: String,
        question: String,
        file_contents: HashMap<String, FileContent>,
        max_iterations: u32,
        deadline: Duration,
    ) -> Self {
        Self {
            query_id: uuid::Uuid::new_v4().to_string(),
            kb_id,
            question,
            retrieved_docs: Vec::new(),
            answer: None,
            confidence: 0.0,
            confidence_level: "low".to_owned(),
            confidence_breakdown: None,
            question_type: None,
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            sources: Vec::new(),
            intermediate_steps: Vec::new(),
            file_contents,
            error: None,
            degraded_error: None,
            retrieval_exhausted: false,
            iteration: 0,
            max_iterations,
            started: Instant::now(),
            deadline,
        }
    }

    pub fn over_deadline(&self) -> bool {
        self.started.elapsed() > self.deadline
    }

    pub fn add_step(&mut self, step: impl Into<String>) {
        self.intermediate_steps.push(step.into());
    }

    pub fn add_source(&mut self, source: String) {
        if !self.sources.contains(&source) {
            self.sources.push(source);
        }
    }

    pub fn pending_tool_calls(&self) -> bool {
        self.tool_calls.len() > self.tool_results.len()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub iterations: u32,
    pub error: Option<String>,
    pub question_type: Option<String>,
    pub intermediate_steps: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query_id: String,
    pub kb_id: String,
    pub question: String,
    pub answer: String,
    pub retrieved_docs: Vec<RetrievedDoc>,
    pub sources: Vec<String>,
    pub confidence: f32,
    pub confidence_level: String,
    pub confidence_breakdown: Option<ConfidenceBreakdown>,
    pub response_time_ms: f64,
    pub from_cache: bool,
    pub metadata: ResponseMetadata,
}

impl Default for QueryResponse {
    fn default() -> Self {
        Self {
            query_id: String::new(),
            kb_id: String::new(),
            question: String::new(),
            answer: String::new(),
            retrieved_docs: Vec::new(),
            sources: Vec::new(),
            confidence: 0.0,
            confidence_level: "low".to_owned(),
            confidence_breakdown: None,
            response_time_ms: 0.0,
            from_cache: false,
            metadata: ResponseMetadata::default(),
        }
    }
}
