//! Query orchestrator
//!
//! A bounded state machine per query: intent analysis, then either a
//! clarification or tool routing, at most three refinement iterations and a
//! final ranking with rationales. Each turn ends in exactly one [`Outcome`]
//! or an error.

pub mod intent;
pub mod ranking;
pub mod reformulate;
pub mod session;

pub use session::{Outcome, QuerySession, RankedResult, SessionState, ToolInvocation};

use crate::config::{MAX_REFINEMENT_ITERATIONS, SenseConfig};
use crate::embed::terms;
use crate::error::{SenseError, SenseResult};
use crate::index::{IndexSnapshot, SemanticIndexStore};
use crate::reasoning::{
    CandidateContext, Intent, ReasoningRequest, ReasoningResponse, ReasoningService,
    ReasoningStage, cue_intent,
};
use crate::records::{DataType, IndexKind, RetrievalResult};
use crate::reference::CellReference;
use crate::retry::{CancellationToken, RetryPolicy};
use crate::source::{LiveValue, SpreadsheetSource};
use crate::tools::{ToolCall, ToolOutput, Toolbox};
use intent::Mention;
use ranking::Candidate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// A caller question, optionally continuing a suspended session
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub text: String,
    pub spreadsheet_id: String,
    pub prior: Option<QuerySession>,
}

impl QueryRequest {
    pub fn new(spreadsheet_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            spreadsheet_id: spreadsheet_id.into(),
            prior: None,
        }
    }

    pub fn with_prior(mut self, session: QuerySession) -> Self {
        self.prior = Some(session);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub session: QuerySession,
    pub outcome: Outcome,
}

type SearchCache = HashMap<(IndexKind, String), Vec<RetrievalResult>>;

/// Drives one query turn against the index store and the collaborators
pub struct QueryOrchestrator<'a> {
    config: &'a SenseConfig,
    store: &'a SemanticIndexStore,
    reasoner: &'a dyn ReasoningService,
    retry: RetryPolicy,
}

impl<'a> QueryOrchestrator<'a> {
    pub fn new(
        config: &'a SenseConfig,
        store: &'a SemanticIndexStore,
        reasoner: &'a dyn ReasoningService,
    ) -> Self {
        Self {
            config,
            store,
            reasoner,
            retry: config.retry_policy(),
        }
    }

    /// Answer one turn of a query
    pub fn answer(
        &self,
        request: QueryRequest,
        source: &dyn SpreadsheetSource,
        cancel: &CancellationToken,
    ) -> SenseResult<QueryResponse> {
        cancel.checkpoint()?;

        let mut session = match request.prior {
            Some(prior)
                if prior.is_awaiting_clarification()
                    && prior.spreadsheet_id == request.spreadsheet_id =>
            {
                prior.resume(&request.text)
            }
            _ => QuerySession::start(
                &request.spreadsheet_id,
                &request.text,
                self.store.snapshot(&request.spreadsheet_id)?,
            ),
        };
        let snapshot = self.pin_snapshot(&mut session)?;
        let embedder = self.store.embedder();
        let tools = Toolbox::new(
            Arc::clone(&snapshot),
            embedder.as_ref(),
            source,
            self.retry.clone(),
        );
        let mut cache = SearchCache::new();

        // Intent analysis
        let (intent, focus_terms) = match self.analyse(&tools, &mut session, &mut cache)? {
            Ok(analysis) => analysis,
            Err(question) => {
                session.clarifications.push(question.clone());
                session.state = SessionState::Clarification;
                info!(spreadsheet_id = %session.spreadsheet_id, "clarification requested");
                return Ok(QueryResponse {
                    session,
                    outcome: Outcome::Clarification { question },
                });
            }
        };
        session.intent = Some(intent);
        session.focus_terms = focus_terms;

        // Routing and refinement
        let (pool, adequate) = self.refine(&tools, &mut session, &mut cache, intent, cancel)?;

        // Ranking and explanation
        cancel.checkpoint()?;
        session.state = SessionState::Ranking;
        let results = self.rank(&session, pool)?;
        session.state = SessionState::Done;

        let outcome = if adequate {
            Outcome::Answer { results }
        } else {
            Outcome::LowConfidence { results }
        };
        info!(
            spreadsheet_id = %session.spreadsheet_id,
            intent = %intent,
            iterations = session.iterations,
            outcome = outcome.label(),
            results = outcome.results().len(),
            "query answered"
        );
        Ok(QueryResponse { session, outcome })
    }

    fn pin_snapshot(&self, session: &mut QuerySession) -> SenseResult<Arc<IndexSnapshot>> {
        if let Some(snapshot) = session.snapshot() {
            return Ok(Arc::clone(snapshot));
        }
        let snapshot = self.store.snapshot(&session.spreadsheet_id)?;
        session.generation = snapshot.generation;
        session.snapshot = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn reason(&self, request: &ReasoningRequest) -> SenseResult<ReasoningResponse> {
        let service = format!("reasoning ({})", self.reasoner.name());
        self.retry.run(&service, || self.reasoner.reason(request))
    }

    fn unexpected_reply(&self, stage: ReasoningStage) -> SenseError {
        SenseError::ExternalService {
            service: format!("reasoning ({})", self.reasoner.name()),
            attempts: 1,
            message: format!("reply of the wrong kind for stage {:?}", stage),
        }
    }

    /// Classify the query; `Err(question)` when the caller must clarify
    fn analyse(
        &self,
        tools: &Toolbox<'_>,
        session: &mut QuerySession,
        cache: &mut SearchCache,
    ) -> SenseResult<Result<(Intent, Vec<String>), String>> {
        session.state = SessionState::IntentAnalysis;
        let query = session.query.clone();
        let k = self.config.retrieval.top_k;

        let mut probe: Vec<Candidate> = Vec::new();
        for kind in [IndexKind::Structural, IndexKind::Computational] {
            let results = self.search(tools, session, cache, 0, kind, &query, k)?;
            merge(&mut probe, results);
        }
        probe.truncate(k);

        let acknowledged: HashSet<String> = session
            .acknowledged_terms
            .iter()
            .map(|t| t.to_lowercase())
            .collect();
        let unknown: Vec<String> = intent::unknown_terms(&query, &tools.snapshot().vocabulary())
            .into_iter()
            .filter(|t| !acknowledged.contains(&t.to_lowercase()))
            .collect();

        let scored: Vec<(Candidate, f32)> = probe
            .into_iter()
            .map(|c| {
                let score = c.similarity;
                (c, score)
            })
            .collect();
        let request = ReasoningRequest {
            stage: ReasoningStage::Intent,
            query: query.clone(),
            candidates: contexts(&scored),
            unknown_terms: unknown.clone(),
            tool_results: tool_results(session),
        };

        match self.reason(&request)? {
            ReasoningResponse::Intent {
                intent,
                focus_terms,
            } => Ok(Ok((intent, focus_terms))),
            ReasoningResponse::Clarification { question } => {
                if session.clarifications.len() >= self.config.retrieval.max_clarifications {
                    debug!(question = %question, "clarification limit reached, proceeding");
                    let intent = cue_intent(&query).unwrap_or(Intent::Mixed);
                    return Ok(Ok((intent, terms(&query))));
                }
                session.acknowledged_terms.extend(unknown);
                Ok(Err(question))
            }
            ReasoningResponse::Rationale { .. } => Err(self.unexpected_reply(ReasoningStage::Intent)),
        }
    }

    /// Run up to `max_iterations` retrieval rounds; returns the candidate pool
    /// and whether it became adequate
    fn refine(
        &self,
        tools: &Toolbox<'_>,
        session: &mut QuerySession,
        cache: &mut SearchCache,
        intent: Intent,
        cancel: &CancellationToken,
    ) -> SenseResult<(Vec<Candidate>, bool)> {
        let retrieval = &self.config.retrieval;
        let max_iterations = retrieval.max_iterations.clamp(1, MAX_REFINEMENT_ITERATIONS);
        let mentions = intent::mentions(&session.query);
        let kinds: &[IndexKind] = match intent {
            Intent::Structural => &[IndexKind::Structural],
            Intent::Computational => &[IndexKind::Computational],
            Intent::Factual | Intent::Mixed => &[IndexKind::Structural, IndexKind::Computational],
        };

        let mut pool: Vec<Candidate> = Vec::new();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut live_attempted = false;
        let mut adequate = false;

        for iteration in 1..=max_iterations {
            cancel.checkpoint()?;
            session.iterations = iteration;
            session.state = if iteration == 1 {
                SessionState::ToolRouting
            } else {
                SessionState::Refinement
            };

            let query = reformulate::reformulate(
                iteration,
                &session.query,
                &session.focus_terms,
                pool.iter().take(3).map(|c| c.record.as_ref()),
            );
            debug!(iteration, intent = %intent, query = %query, "retrieval iteration");
            session.effective_query = query.clone();

            for kind in kinds {
                let results =
                    self.search(tools, session, cache, iteration, *kind, &query, retrieval.top_k)?;
                merge(&mut pool, results);
            }

            if iteration == 1 {
                for mention in &mentions {
                    let call = match mention {
                        Mention::Cell { sheet, address } => ToolCall::GetCellValue {
                            sheet: sheet.clone(),
                            address: address.clone(),
                        },
                        Mention::Row { sheet, row } => ToolCall::GetRowValues {
                            sheet: sheet.clone(),
                            row: *row,
                        },
                    };
                    for value in self.read(tools, session, iteration, call)? {
                        attach(&mut pool, value);
                    }
                    live_attempted = true;
                }
            }

            if intent == Intent::Factual {
                let targets: Vec<(String, String, String)> = pool
                    .iter()
                    .filter(|c| c.verified.is_none() && !attempted.contains(&c.record.key()))
                    .filter_map(|c| {
                        verification_target(c).map(|(sheet, address)| (c.record.key(), sheet, address))
                    })
                    .take(retrieval.max_live_reads)
                    .collect();
                for (key, sheet, address) in targets {
                    attempted.insert(key.clone());
                    live_attempted = true;
                    let values =
                        self.read(tools, session, iteration, ToolCall::GetCellValue { sheet, address })?;
                    if let Some(candidate) = pool.iter_mut().find(|c| c.record.key() == key) {
                        candidate.verified = values.into_iter().find(|v| !v.value.is_empty());
                    }
                }
            }

            let confident = pool
                .iter()
                .any(|c| c.similarity >= retrieval.similarity_threshold);
            adequate = confident && (intent != Intent::Factual || live_attempted);
            debug!(iteration, confident, live_attempted, adequate, "iteration assessed");
            if adequate {
                break;
            }
        }

        Ok((pool, adequate))
    }

    fn rank(&self, session: &QuerySession, pool: Vec<Candidate>) -> SenseResult<Vec<RankedResult>> {
        let ranked = ranking::rank(
            &session.query,
            pool,
            &self.config.ranking,
            self.config.retrieval.max_results,
        );
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let request = ReasoningRequest {
            stage: ReasoningStage::Rationale,
            query: session.query.clone(),
            candidates: contexts(&ranked),
            unknown_terms: Vec::new(),
            tool_results: tool_results(session),
        };
        let rationales: HashMap<String, String> = match self.reason(&request)? {
            ReasoningResponse::Rationale { rationales } => {
                rationales.into_iter().map(|r| (r.key, r.text)).collect()
            }
            _ => return Err(self.unexpected_reply(ReasoningStage::Rationale)),
        };

        let threshold = self.config.retrieval.similarity_threshold;
        Ok(ranked
            .into_iter()
            .enumerate()
            .map(|(i, (candidate, score))| {
                let provenance = candidate.record.provenance();
                let rationale = rationales
                    .get(&candidate.record.key())
                    .cloned()
                    .unwrap_or_else(|| format!("Retrieved from {}.", provenance));
                RankedResult {
                    rank: i + 1,
                    record: candidate.record.as_ref().clone(),
                    similarity: candidate.similarity,
                    score,
                    verified_value: candidate.verified,
                    provenance,
                    rationale,
                    confident: candidate.similarity >= threshold,
                }
            })
            .collect())
    }

    #[allow(clippy::too_many_arguments)]
    fn search(
        &self,
        tools: &Toolbox<'_>,
        session: &mut QuerySession,
        cache: &mut SearchCache,
        iteration: usize,
        kind: IndexKind,
        query: &str,
        k: usize,
    ) -> SenseResult<Vec<RetrievalResult>> {
        let key = (kind, query.to_string());
        let call = match kind {
            IndexKind::Structural => ToolCall::SearchSpec {
                query: query.to_string(),
                k,
            },
            IndexKind::Computational => ToolCall::SearchMeasures {
                query: query.to_string(),
                k,
            },
        };
        if let Some(hit) = cache.get(&key) {
            let summary = ToolOutput::Matches(hit.clone()).summary();
            session.record_cached(iteration, call, summary);
            return Ok(hit.clone());
        }
        let output = tools.execute(&call)?;
        session.record(iteration, call, output.summary());
        let results = match output {
            ToolOutput::Matches(results) => results,
            _ => Vec::new(),
        };
        cache.insert(key, results.clone());
        Ok(results)
    }

    /// Live read; a missing sheet is logged and yields no values
    fn read(
        &self,
        tools: &Toolbox<'_>,
        session: &mut QuerySession,
        iteration: usize,
        call: ToolCall,
    ) -> SenseResult<Vec<LiveValue>> {
        let output = match tools.execute(&call) {
            Ok(output) => output,
            Err(SenseError::NotFound(what)) => {
                debug!(tool = call.name(), %what, "live read target missing");
                session.record(iteration, call, format!("not found: {}", what));
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        session.record(iteration, call, output.summary());
        Ok(match output {
            ToolOutput::Cell(value) => vec![value],
            ToolOutput::Row(values) => values,
            ToolOutput::Matches(_) => Vec::new(),
        })
    }
}

/// Add results to the pool keeping each record's best similarity
fn merge(pool: &mut Vec<Candidate>, results: Vec<RetrievalResult>) {
    for result in results {
        let key = result.record.key();
        match pool.iter_mut().find(|c| c.record.key() == key) {
            Some(existing) => existing.similarity = existing.similarity.max(result.score),
            None => pool.push(Candidate::new(result.record, result.score)),
        }
    }
    pool.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.record.key().cmp(&b.record.key()))
    });
}

fn parse_range(address: &str) -> Option<(CellReference, CellReference)> {
    let mut parts = address.split(':');
    let start = CellReference::parse_a1(parts.next()?)?;
    let end = match parts.next() {
        Some(end) => CellReference::parse_a1(end)?,
        None => start,
    };
    Some((start, end))
}

/// Cell read to verify a candidate: the last cell of its range
fn verification_target(candidate: &Candidate) -> Option<(String, String)> {
    let record = candidate.record.as_ref();
    if record
        .as_structural()
        .is_some_and(|s| s.data_type == DataType::Empty)
    {
        return None;
    }
    let (_, end) = parse_range(&record.provenance().address)?;
    Some((record.sheet().to_string(), end.to_excel_ref()))
}

/// Mark the candidate whose range covers a live value as verified
fn attach(pool: &mut [Candidate], value: LiveValue) {
    if value.value.is_empty() {
        return;
    }
    let Some(cell) = CellReference::parse_a1(&value.address) else {
        return;
    };
    let covering = pool.iter_mut().find(|c| {
        c.verified.is_none()
            && c.record.sheet().eq_ignore_ascii_case(&value.sheet)
            && parse_range(&c.record.provenance().address).is_some_and(|(start, end)| {
                (start.row..=end.row).contains(&cell.row) && (start.col..=end.col).contains(&cell.col)
            })
    });
    if let Some(candidate) = covering {
        candidate.verified = Some(value);
    }
}

fn tool_results(session: &QuerySession) -> Vec<String> {
    session
        .invocations
        .iter()
        .map(|inv| format!("{}: {}", inv.call.name(), inv.summary))
        .collect()
}

fn contexts(scored: &[(Candidate, f32)]) -> Vec<CandidateContext> {
    scored
        .iter()
        .map(|(candidate, score)| {
            let record = candidate.record.as_ref();
            let linked = scored
                .iter()
                .filter(|(other, _)| other.record.key() != record.key())
                .filter(|(other, _)| record.is_linked_to(&other.record))
                .map(|(other, _)| other.record.key())
                .collect();
            CandidateContext {
                key: record.key(),
                kind: record.kind(),
                sheet: record.sheet().to_string(),
                label: record.label().to_string(),
                score: *score,
                provenance: record.provenance(),
                semantic_formula: record.as_measure().map(|m| m.semantic_formula.clone()),
                data_type: record.as_structural().map(|s| s.data_type.to_string()),
                linked,
                verified_value: candidate.verified.as_ref().map(|v| v.value.to_string()),
            }
        })
        .collect()
}
