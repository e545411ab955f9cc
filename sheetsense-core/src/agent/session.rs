//! Per-query session state

use crate::index::IndexSnapshot;
use crate::reasoning::Intent;
use crate::records::{IndexedRecord, Provenance};
use crate::source::LiveValue;
use crate::tools::ToolCall;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where the orchestrator's state machine currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    IntentAnalysis,
    /// Suspended until the caller answers the question
    Clarification,
    ToolRouting,
    Refinement,
    Ranking,
    Done,
}

/// One tool call made during a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// 0 for intent-analysis probes, 1.. for refinement iterations
    pub iteration: usize,
    pub call: ToolCall,
    pub summary: String,
    /// Served from this turn's search cache instead of a fresh call
    #[serde(default)]
    pub cached: bool,
}

/// A ranked answer entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedResult {
    /// 1-based
    pub rank: usize,
    pub record: IndexedRecord,
    pub similarity: f32,
    /// Similarity plus contextual-fit boosts
    pub score: f32,
    pub verified_value: Option<LiveValue>,
    pub provenance: Provenance,
    pub rationale: String,
    /// Similarity reached the confidence threshold
    pub confident: bool,
}

/// Terminal result of one turn
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Answer { results: Vec<RankedResult> },
    Clarification { question: String },
    /// Best effort; no result reached the confidence threshold
    LowConfidence { results: Vec<RankedResult> },
}

impl Outcome {
    pub fn results(&self) -> &[RankedResult] {
        match self {
            Outcome::Answer { results } | Outcome::LowConfidence { results } => results,
            Outcome::Clarification { .. } => &[],
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Answer { .. } => "answer",
            Outcome::Clarification { .. } => "clarification",
            Outcome::LowConfidence { .. } => "low_confidence",
        }
    }
}

/// Everything one query accumulated, from intent analysis to its outcome.
///
/// The session keeps the index snapshot it started with; a clarification
/// answer resumes against that same snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySession {
    pub spreadsheet_id: String,
    /// Caller text, with clarification answers appended
    pub query: String,
    /// Text used for the latest search
    pub effective_query: String,
    pub intent: Option<Intent>,
    pub focus_terms: Vec<String>,
    pub state: SessionState,
    pub invocations: Vec<ToolInvocation>,
    /// Refinement iterations run in this turn
    pub iterations: usize,
    /// Questions asked so far
    pub clarifications: Vec<String>,
    /// Business terms the caller has already been asked about
    pub acknowledged_terms: Vec<String>,
    /// Generation of the pinned snapshot
    pub generation: u64,
    #[serde(skip)]
    pub(crate) snapshot: Option<Arc<IndexSnapshot>>,
}

impl QuerySession {
    pub(crate) fn start(spreadsheet_id: &str, query: &str, snapshot: Arc<IndexSnapshot>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.to_string(),
            query: query.trim().to_string(),
            effective_query: query.trim().to_string(),
            intent: None,
            focus_terms: Vec::new(),
            state: SessionState::IntentAnalysis,
            invocations: Vec::new(),
            iterations: 0,
            clarifications: Vec::new(),
            acknowledged_terms: Vec::new(),
            generation: snapshot.generation,
            snapshot: Some(snapshot),
        }
    }

    /// Fold the caller's answer into a suspended session and restart intent analysis
    pub(crate) fn resume(mut self, answer: &str) -> Self {
        let answer = answer.trim();
        if !answer.is_empty() {
            self.query = format!("{} {}", self.query, answer);
        }
        self.effective_query = self.query.clone();
        self.intent = None;
        self.focus_terms.clear();
        self.state = SessionState::IntentAnalysis;
        self.iterations = 0;
        self
    }

    pub fn snapshot(&self) -> Option<&Arc<IndexSnapshot>> {
        self.snapshot.as_ref()
    }

    pub(crate) fn record(&mut self, iteration: usize, call: ToolCall, summary: String) {
        self.invocations.push(ToolInvocation {
            iteration,
            call,
            summary,
            cached: false,
        });
    }

    pub(crate) fn record_cached(&mut self, iteration: usize, call: ToolCall, summary: String) {
        self.invocations.push(ToolInvocation {
            iteration,
            call,
            summary,
            cached: true,
        });
    }

    pub fn is_awaiting_clarification(&self) -> bool {
        self.state == SessionState::Clarification
    }
}
