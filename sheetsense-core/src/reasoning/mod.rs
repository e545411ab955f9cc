//! Reasoning service: intent classification, clarification and rationales
//!
//! Responses follow a fixed schema so the orchestrator can drive its state
//! machine without interpreting free text.

#[cfg(feature = "remote-services")]
pub mod llm;

use crate::config::SenseConfig;
use crate::embed::terms;
use crate::error::ServiceError;
use crate::records::{IndexKind, Provenance};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, LazyLock};

/// What kind of answer the query asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    /// Layout questions: which columns, where data lives, types
    Structural,
    /// How a value is calculated
    Computational,
    /// What a value currently is
    Factual,
    /// Spans structure and computation
    Mixed,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Structural => "structural",
            Intent::Computational => "computational",
            Intent::Factual => "factual",
            Intent::Mixed => "mixed",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningStage {
    Intent,
    Rationale,
}

/// One retrieved record as shown to the reasoning service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateContext {
    pub key: String,
    pub kind: IndexKind,
    pub sheet: String,
    pub label: String,
    pub score: f32,
    pub provenance: Provenance,
    pub semantic_formula: Option<String>,
    pub data_type: Option<String>,
    /// Keys of other candidates this one reads from or feeds
    #[serde(default)]
    pub linked: Vec<String>,
    pub verified_value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub stage: ReasoningStage,
    pub query: String,
    /// Best candidates first
    pub candidates: Vec<CandidateContext>,
    /// Business terms absent from the index vocabulary
    pub unknown_terms: Vec<String>,
    /// Short summaries of tool calls made so far
    pub tool_results: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rationale {
    pub key: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReasoningResponse {
    Intent {
        intent: Intent,
        #[serde(default)]
        focus_terms: Vec<String>,
    },
    Clarification {
        question: String,
    },
    Rationale {
        rationales: Vec<Rationale>,
    },
}

/// Single request/response capability of the reasoning collaborator
pub trait ReasoningService: Send + Sync {
    fn name(&self) -> &str;

    fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, ServiceError>;
}

/// Build the reasoning service selected in the configuration
pub fn build_reasoner(config: &SenseConfig) -> Result<Arc<dyn ReasoningService>> {
    let reasoning = &config.reasoning;
    match reasoning.provider.as_str() {
        "heuristic" => Ok(Arc::new(HeuristicReasoner::new(
            config.retrieval.ambiguity_margin,
        ))),
        #[cfg(feature = "remote-services")]
        "openai" => {
            let api_key = std::env::var(&reasoning.api_key_env).map_err(|_| {
                anyhow::anyhow!(
                    "reasoning provider 'openai' needs the {} environment variable",
                    reasoning.api_key_env
                )
            })?;
            Ok(Arc::new(llm::LlmReasoner::new(
                &api_key,
                &reasoning.base_url,
                &reasoning.model,
                reasoning.temperature,
                config.services.timeout(),
            )?))
        }
        other => anyhow::bail!("Unknown reasoning provider: {}", other),
    }
}

static STRUCTURAL_CUES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "column", "columns", "sheet", "sheets", "header", "headers", "field", "fields",
        "structure", "layout", "stored", "contain", "contains", "type", "types", "tab", "tabs",
        "list",
    ]
    .into_iter()
    .collect()
});

static COMPUTATIONAL_CUES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "calculated", "calculate", "calculation", "computed", "compute", "formula", "formulas",
        "derived", "derive", "feed", "feeds", "depend", "depends", "logic", "driven",
    ]
    .into_iter()
    .collect()
});

static FACTUAL_CUES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "current", "currently", "latest", "actual", "now", "verify", "check", "equal", "equals",
        "much", "many", "value", "values",
    ]
    .into_iter()
    .collect()
});

fn lowercase_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Classify a query from cue words alone; `None` when no cue is present
pub fn cue_intent(query: &str) -> Option<Intent> {
    let words = lowercase_words(query);
    let hit = |cues: &HashSet<&'static str>| words.iter().any(|w| cues.contains(w.as_str()));
    let (structural, computational, factual) =
        (hit(&STRUCTURAL_CUES), hit(&COMPUTATIONAL_CUES), hit(&FACTUAL_CUES));

    match (structural, computational, factual) {
        (_, _, true) => Some(Intent::Factual),
        (true, true, false) => Some(Intent::Mixed),
        (false, true, false) => Some(Intent::Computational),
        (true, false, false) => Some(Intent::Structural),
        (false, false, false) => None,
    }
}

/// Deterministic local reasoner: cue words for intent, templates for rationales
#[derive(Debug, Clone)]
pub struct HeuristicReasoner {
    ambiguity_margin: f32,
}

impl HeuristicReasoner {
    pub fn new(ambiguity_margin: f32) -> Self {
        Self { ambiguity_margin }
    }

    fn classify(&self, request: &ReasoningRequest) -> ReasoningResponse {
        if let Some(term) = request.unknown_terms.first() {
            return ReasoningResponse::Clarification {
                question: format!(
                    "What does \"{}\" refer to? It does not appear in this spreadsheet; \
                     please name the column, measure or sheet you mean.",
                    term
                ),
            };
        }

        let cue = cue_intent(&request.query);
        if cue.is_none() {
            if let [first, second, ..] = request.candidates.as_slice() {
                let comparable = (first.score - second.score).abs() <= self.ambiguity_margin;
                let unrelated = first.sheet != second.sheet
                    && !first.linked.contains(&second.key)
                    && !second.linked.contains(&first.key);
                if comparable && unrelated {
                    return ReasoningResponse::Clarification {
                        question: format!(
                            "Did you mean {} on sheet {} or {} on sheet {}?",
                            first.label, first.sheet, second.label, second.sheet
                        ),
                    };
                }
            }
        }

        let cue_words: Vec<String> = lowercase_words(&request.query)
            .into_iter()
            .filter(|w| {
                STRUCTURAL_CUES.contains(w.as_str())
                    || COMPUTATIONAL_CUES.contains(w.as_str())
                    || FACTUAL_CUES.contains(w.as_str())
            })
            .collect();
        let focus_terms = terms(&request.query)
            .into_iter()
            .filter(|t| !cue_words.contains(t))
            .collect();

        ReasoningResponse::Intent {
            intent: cue.unwrap_or(Intent::Mixed),
            focus_terms,
        }
    }

    fn explain(&self, request: &ReasoningRequest) -> ReasoningResponse {
        let rationales = request
            .candidates
            .iter()
            .map(|c| {
                let mut text = match (&c.semantic_formula, &c.provenance.formula) {
                    (Some(semantic), Some(raw)) => format!(
                        "{} is computed as {} (formula {} at {}!{}).",
                        c.label, semantic, raw, c.provenance.sheet, c.provenance.address
                    ),
                    _ => format!(
                        "Column {} on sheet {} holds {} data at {}.",
                        c.label,
                        c.sheet,
                        c.data_type.as_deref().unwrap_or("mixed"),
                        c.provenance.address
                    ),
                };
                if let Some(value) = &c.verified_value {
                    text.push_str(&format!(" Current value: {}.", value));
                }
                Rationale {
                    key: c.key.clone(),
                    text,
                }
            })
            .collect();
        ReasoningResponse::Rationale { rationales }
    }
}

impl ReasoningService for HeuristicReasoner {
    fn name(&self) -> &str {
        "heuristic"
    }

    fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, ServiceError> {
        Ok(match request.stage {
            ReasoningStage::Intent => self.classify(request),
            ReasoningStage::Rationale => self.explain(request),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, sheet: &str, score: f32) -> CandidateContext {
        CandidateContext {
            key: key.into(),
            kind: IndexKind::Structural,
            sheet: sheet.into(),
            label: key.into(),
            score,
            provenance: Provenance {
                sheet: sheet.into(),
                address: "B2:B9".into(),
                formula: None,
            },
            semantic_formula: None,
            data_type: Some("numeric".into()),
            linked: Vec::new(),
            verified_value: None,
        }
    }

    fn request(query: &str, candidates: Vec<CandidateContext>) -> ReasoningRequest {
        ReasoningRequest {
            stage: ReasoningStage::Intent,
            query: query.into(),
            candidates,
            unknown_terms: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    #[test]
    fn test_cue_intents() {
        assert_eq!(cue_intent("How is gross margin calculated?"), Some(Intent::Computational));
        assert_eq!(cue_intent("Which columns are in the Sales sheet?"), Some(Intent::Structural));
        assert_eq!(cue_intent("What is the current revenue?"), Some(Intent::Factual));
        assert_eq!(
            cue_intent("What columns feed into gross margin and what are their current values?"),
            Some(Intent::Factual)
        );
        assert_eq!(cue_intent("Which columns feed gross margin?"), Some(Intent::Mixed));
        assert_eq!(cue_intent("revenue"), None);
    }

    #[test]
    fn test_comparable_unrelated_candidates_need_clarification() {
        let reasoner = HeuristicReasoner::new(0.05);
        let response = reasoner
            .reason(&request(
                "total",
                vec![candidate("Total", "Sales", 0.61), candidate("Total", "Costs", 0.6)],
            ))
            .unwrap();
        assert!(matches!(response, ReasoningResponse::Clarification { .. }));

        // Linked candidates are not ambiguous
        let mut first = candidate("Total", "Sales", 0.61);
        first.linked.push("Total2".into());
        let response = reasoner
            .reason(&request("total", vec![first, candidate("Total2", "Costs", 0.6)]))
            .unwrap();
        assert!(matches!(response, ReasoningResponse::Intent { intent: Intent::Mixed, .. }));
    }

    #[test]
    fn test_unknown_term_needs_clarification() {
        let reasoner = HeuristicReasoner::new(0.05);
        let mut req = request("How is EBITDA calculated?", Vec::new());
        req.unknown_terms.push("EBITDA".into());
        match reasoner.reason(&req).unwrap() {
            ReasoningResponse::Clarification { question } => assert!(question.contains("EBITDA")),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_focus_terms_drop_cues() {
        let reasoner = HeuristicReasoner::new(0.05);
        match reasoner.reason(&request("How is gross margin calculated?", Vec::new())).unwrap() {
            ReasoningResponse::Intent { intent, focus_terms } => {
                assert_eq!(intent, Intent::Computational);
                assert_eq!(focus_terms, vec!["gross", "margin"]);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_rationale_cites_provenance() {
        let reasoner = HeuristicReasoner::new(0.05);
        let mut measure = candidate("income.gross_margin", "Income", 0.8);
        measure.kind = IndexKind::Computational;
        measure.label = "Gross Margin".into();
        measure.semantic_formula = Some("(revenue - cost_of_goods) / revenue".into());
        measure.provenance.formula = Some("=(B2-C2)/B2".into());
        measure.verified_value = Some("0.4".into());

        let mut req = request("How is gross margin calculated?", vec![measure]);
        req.stage = ReasoningStage::Rationale;
        match reasoner.reason(&req).unwrap() {
            ReasoningResponse::Rationale { rationales } => {
                assert_eq!(rationales.len(), 1);
                assert!(rationales[0].text.contains("(revenue - cost_of_goods) / revenue"));
                assert!(rationales[0].text.contains("Income!B2:B9"));
                assert!(rationales[0].text.contains("Current value: 0.4"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_response_schema() {
        let json = r#"{"type":"intent","intent":"computational","focus_terms":["margin"]}"#;
        let parsed: ReasoningResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            ReasoningResponse::Intent {
                intent: Intent::Computational,
                focus_terms: vec!["margin".into()]
            }
        );
        assert!(serde_json::from_str::<ReasoningResponse>(r#"{"type":"poem"}"#).is_err());
    }
}
