//! Chat-completions backed reasoning service

use super::{ReasoningRequest, ReasoningResponse, ReasoningService, ReasoningStage};
use crate::embed::openai::{classify_status, classify_transport};
use crate::error::ServiceError;
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SYSTEM_PROMPT: &str = r#"You help answer questions about a spreadsheet using retrieved records.
Reply with a single JSON object and nothing else. Allowed shapes:
{"type":"intent","intent":"structural|computational|factual|mixed","focus_terms":["..."]}
{"type":"clarification","question":"..."}
{"type":"rationale","rationales":[{"key":"<candidate key>","text":"..."}]}
For stage "intent": return "clarification" when the query maps to two unrelated candidates with
comparable scores or uses a term listed in unknown_terms; otherwise return "intent".
For stage "rationale": return one rationale per candidate, citing its sheet, address and formula."#;

/// Reasoner backed by an OpenAI-compatible `/chat/completions` endpoint
pub struct LlmReasoner {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl LlmReasoner {
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        temperature: f32,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing reasoning API key");
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key.trim()))
                .context("invalid reasoning API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build reasoning HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.to_string(),
            temperature,
        })
    }
}

/// Strip an optional markdown code fence around a JSON reply
pub fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();
    if let Some(start) = trimmed.find("```") {
        let after_start = &trimmed[start + 3..];
        let json_start = if after_start.starts_with("json") {
            after_start.find('\n').map(|i| i + 1).unwrap_or(0)
        } else if after_start.starts_with('\n') {
            1
        } else {
            0
        };
        let content = &after_start[json_start..];
        if let Some(end) = content.find("```") {
            return content[..end].trim();
        }
    }
    trimmed
}

/// Parse a reply and check it fits the requested stage
pub fn parse_response(
    stage: ReasoningStage,
    content: &str,
) -> Result<ReasoningResponse, ServiceError> {
    let response: ReasoningResponse = serde_json::from_str(extract_json(content))
        .map_err(|e| ServiceError::Permanent(format!("reply does not match the schema: {}", e)))?;
    let fits = matches!(
        (stage, &response),
        (ReasoningStage::Intent, ReasoningResponse::Intent { .. })
            | (ReasoningStage::Intent, ReasoningResponse::Clarification { .. })
            | (ReasoningStage::Rationale, ReasoningResponse::Rationale { .. })
    );
    if fits {
        Ok(response)
    } else {
        Err(ServiceError::Permanent(format!(
            "reply of the wrong kind for stage {:?}",
            stage
        )))
    }
}

impl ReasoningService for LlmReasoner {
    fn name(&self) -> &str {
        "llm"
    }

    fn reason(&self, request: &ReasoningRequest) -> Result<ReasoningResponse, ServiceError> {
        let user = serde_json::to_string(request)
            .map_err(|e| ServiceError::Permanent(format!("cannot encode request: {}", e)))?;
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(classify_transport)?;
        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, text));
        }

        let parsed: ChatResponse = response
            .json()
            .map_err(|e| ServiceError::Permanent(format!("malformed chat response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::Permanent("chat response had no choices".to_string()))?;
        parse_response(request.stage, &content)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reasoning::Intent;

    #[test]
    fn test_extract_json_from_fence() {
        let reply = "Sure:\n```json\n{\"type\":\"clarification\",\"question\":\"Which sheet?\"}\n```";
        assert_eq!(
            extract_json(reply),
            "{\"type\":\"clarification\",\"question\":\"Which sheet?\"}"
        );
        assert_eq!(extract_json("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn test_parse_checks_stage() {
        let intent = r#"{"type":"intent","intent":"factual"}"#;
        assert_eq!(
            parse_response(ReasoningStage::Intent, intent).unwrap(),
            ReasoningResponse::Intent {
                intent: Intent::Factual,
                focus_terms: Vec::new()
            }
        );
        let err = parse_response(ReasoningStage::Rationale, intent).unwrap_err();
        assert!(!err.is_transient());
        assert!(parse_response(ReasoningStage::Intent, "not json").is_err());
    }
}
