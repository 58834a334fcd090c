//! Language-model collaborator
//!
//! `LanguageModel` is the narrow seam used by the generation paths. `LlmClient`
//! talks to any OpenAI-compatible chat completions endpoint. The extraction
//! helpers turn free-form responses into SQL, JSON, or a stated confidence.

use crate::config::LlmSettings;
use crate::confidence::ExtractionQuality;
use crate::error::{EngineError, Result, ServiceFailureKind};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

lazy_static! {
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```([A-Za-z]*)[ \t]*\r?\n?(.*?)```").unwrap();
    static ref STATEMENT_START: Regex = Regex::new(
        r"(?i)^\s*(?:SELECT|WITH|INSERT|UPDATE|DELETE|DROP|CREATE|ALTER|TRUNCATE|MERGE|GRANT|REVOKE|REPLACE)\b"
    )
    .unwrap();
    static ref QUERY_KEYWORD: Regex = Regex::new(r"(?i)\b(?:SELECT|WITH)\b").unwrap();
    static ref SELECT_WORD: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref STATED_CONFIDENCE: Regex =
        Regex::new(r#"(?i)"?confidence"?\s*[:=]\s*(\d+(?:\.\d+)?)\s*(%)?"#).unwrap();
}

/// A (question, SQL) pair shown to the model before the real question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FewShotExample {
    pub question: String,
    pub sql: String,
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub few_shot: Vec<FewShotExample>,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            few_shot: Vec::new(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_few_shot(mut self, examples: Vec<FewShotExample>) -> Self {
        self.few_shot = examples;
        self
    }

    /// Chat messages: system, few-shot turns, then the prompt.
    pub fn messages(&self) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(2 + self.few_shot.len() * 2);
        if let Some(ref system) = self.system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        for example in &self.few_shot {
            messages.push(serde_json::json!({"role": "user", "content": example.question}));
            messages.push(serde_json::json!({"role": "assistant", "content": format!("```sql\n{}\n```", example.sql)}));
        }
        messages.push(serde_json::json!({"role": "user", "content": self.prompt}));
        messages
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Free-form completion for the request. Failures are typed as
    /// `EngineError::ExternalService` with the language model as the service.
    async fn complete(&self, request: &LlmRequest) -> Result<String>;
}

/// OpenAI-compatible chat completions client.
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_settings(settings: &LlmSettings, timeout: Duration) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| EngineError::Configuration("OPENAI_API_KEY is not set".to_string()))?;
        Self::new(api_key, settings.model.clone(), settings.base_url.clone(), timeout)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, request: &LlmRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": request.messages(),
            "temperature": 0.1,
        });
        // Reasoning models spend part of the budget before answering.
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = serde_json::json!(2000);
        } else {
            body["max_tokens"] = serde_json::json!(800);
        }
        body
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<String> {
        let body = self.request_body(request);
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                let kind = if e.is_timeout() {
                    ServiceFailureKind::Timeout
                } else {
                    ServiceFailureKind::Network
                };
                EngineError::llm(kind, format!("LLM API call failed: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EngineError::llm(
                status_failure_kind(status.as_u16(), &error_text),
                format!("LLM API error ({}): {}", status, error_text),
            ));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::llm(ServiceFailureKind::InvalidResponse, format!("Failed to parse LLM response: {}", e)))?;

        parse_completion(&response_json)
    }
}

fn status_failure_kind(status: u16, body: &str) -> ServiceFailureKind {
    match status {
        429 => ServiceFailureKind::Quota,
        402 | 403 if body.contains("quota") => ServiceFailureKind::Quota,
        408 | 504 => ServiceFailureKind::Timeout,
        500..=599 => ServiceFailureKind::Network,
        _ => ServiceFailureKind::InvalidResponse,
    }
}

/// Pull the assistant message out of a chat completions payload.
fn parse_completion(response_json: &serde_json::Value) -> Result<String> {
    if let Some(error) = response_json.get("error") {
        let text = error.to_string();
        let kind = if text.contains("insufficient_quota") || text.contains("rate_limit") {
            ServiceFailureKind::Quota
        } else {
            ServiceFailureKind::InvalidResponse
        };
        return Err(EngineError::llm(kind, format!("LLM API error: {}", text)));
    }

    let choice = response_json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| EngineError::llm(ServiceFailureKind::InvalidResponse, "No choices in LLM response"))?;

    match choice.get("finish_reason").and_then(|r| r.as_str()) {
        Some("length") => warn!("LLM response was truncated due to length limit"),
        Some("content_filter") => {
            return Err(EngineError::llm(
                ServiceFailureKind::InvalidResponse,
                "LLM response was filtered by content policy",
            ))
        }
        _ => {}
    }

    let content = choice["message"]["content"].as_str().unwrap_or_default();
    if content.trim().is_empty() {
        return Err(EngineError::llm(ServiceFailureKind::InvalidResponse, "Empty content in LLM response"));
    }
    debug!(chars = content.len(), "LLM response received");
    Ok(content.to_string())
}

/// Locate a SQL statement in a model response.
///
/// A fenced code block or a response that is itself a statement counts as a
/// clean extraction; a statement found by scanning prose for SELECT/WITH is
/// heuristic. Non-SELECT statements are returned as-is so validation can
/// reject them explicitly.
pub fn extract_sql(response: &str) -> Option<(String, ExtractionQuality)> {
    for caps in FENCED_BLOCK.captures_iter(response) {
        let lang = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        if (lang.is_empty() || lang == "sql") && STATEMENT_START.is_match(body) {
            return Some((tidy_statement(body), ExtractionQuality::Clean));
        }
    }

    if STATEMENT_START.is_match(response) {
        let statement = first_paragraph(response);
        return Some((tidy_statement(statement), ExtractionQuality::Clean));
    }

    let start = QUERY_KEYWORD.find(response)?.start();
    let rest = &response[start..];
    let end = rest.find(';').map(|i| i + 1).unwrap_or(rest.len());
    let statement = first_paragraph(&rest[..end]);
    let statement = tidy_statement(statement);
    if !SELECT_WORD.is_match(&statement) {
        return None;
    }
    Some((statement, ExtractionQuality::Heuristic))
}

fn first_paragraph(text: &str) -> &str {
    let text = text.trim_start();
    match text.find("\n\n") {
        Some(i) => &text[..i],
        None => text,
    }
}

fn tidy_statement(text: &str) -> String {
    text.trim().trim_end_matches(';').trim().to_string()
}

/// Extract a JSON object or array from a response (handles markdown code blocks).
pub fn extract_json(response: &str) -> String {
    for caps in FENCED_BLOCK.captures_iter(response) {
        let lang = caps.get(1).map(|m| m.as_str().to_lowercase()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        if lang == "json" || body.starts_with('{') || body.starts_with('[') {
            return body.to_string();
        }
    }

    let start = match (response.find('{'), response.find('[')) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    let end = match (response.rfind('}'), response.rfind(']')) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    match (start, end) {
        (Some(start), Some(end)) if end > start => response[start..=end].to_string(),
        _ => response.trim().to_string(),
    }
}

/// Confidence stated by the model (`confidence: 0.8`, `"confidence": 80%`).
pub fn stated_confidence(response: &str) -> Option<f64> {
    let caps = STATED_CONFIDENCE.captures(response)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let value = if caps.get(2).is_some() || value > 1.0 { value / 100.0 } else { value };
    if (0.0..=1.0).contains(&value) {
        Some(value)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sql_from_fenced_block() {
        let response = "Here is the query:\n```sql\nSELECT COUNT(*) FROM loans WHERE status = 'active';\n```\nIt counts active loans.";
        let (sql, quality) = extract_sql(response).unwrap();
        assert_eq!(sql, "SELECT COUNT(*) FROM loans WHERE status = 'active'");
        assert_eq!(quality, ExtractionQuality::Clean);
    }

    #[test]
    fn test_extract_sql_bare_statement() {
        let (sql, quality) = extract_sql("  select loan_id from loans limit 5;  ").unwrap();
        assert_eq!(sql, "select loan_id from loans limit 5");
        assert_eq!(quality, ExtractionQuality::Clean);
    }

    #[test]
    fn test_extract_sql_from_prose_is_heuristic() {
        let response = "You could run SELECT city FROM customers; to list cities.";
        let (sql, quality) = extract_sql(response).unwrap();
        assert_eq!(sql, "SELECT city FROM customers");
        assert_eq!(quality, ExtractionQuality::Heuristic);
    }

    #[test]
    fn test_extract_sql_keeps_disallowed_statements() {
        let (sql, _) = extract_sql("DROP TABLE customers").unwrap();
        assert_eq!(sql, "DROP TABLE customers");
    }

    #[test]
    fn test_extract_sql_none_without_statement() {
        assert!(extract_sql("I cannot answer that question.").is_none());
        assert!(extract_sql("").is_none());
    }

    #[test]
    fn test_extract_json_prefers_fenced_block() {
        let response = "Plan below [draft]\n```json\n{\"tables\": [\"loans\"]}\n```";
        assert_eq!(extract_json(response), "{\"tables\": [\"loans\"]}");
    }

    #[test]
    fn test_extract_json_object_containing_array() {
        let response = "Sure: {\"tables\": [\"loans\"], \"limit\": 5} done";
        assert_eq!(extract_json(response), "{\"tables\": [\"loans\"], \"limit\": 5}");
    }

    #[test]
    fn test_stated_confidence_forms() {
        assert_eq!(stated_confidence("confidence: 0.85"), Some(0.85));
        assert_eq!(stated_confidence("{\"confidence\": 90%}"), Some(0.9));
        assert_eq!(stated_confidence("Confidence = 75"), Some(0.75));
        assert_eq!(stated_confidence("no score here"), None);
        assert_eq!(stated_confidence("confidence: 250"), None);
    }

    #[test]
    fn test_messages_interleave_few_shot() {
        let request = LlmRequest::new("How many customers?")
            .with_system("Return SQL only.")
            .with_few_shot(vec![FewShotExample {
                question: "How many loans?".to_string(),
                sql: "SELECT COUNT(*) FROM loans".to_string(),
            }]);
        let messages = request.messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "How many customers?");
    }

    #[test]
    fn test_parse_completion_errors_are_typed() {
        let quota = serde_json::json!({"error": {"code": "insufficient_quota"}});
        assert!(matches!(
            parse_completion(&quota),
            Err(EngineError::ExternalService { kind: ServiceFailureKind::Quota, .. })
        ));

        let filtered = serde_json::json!({"choices": [{"finish_reason": "content_filter", "message": {"content": "x"}}]});
        assert!(parse_completion(&filtered).is_err());

        let ok = serde_json::json!({"choices": [{"finish_reason": "stop", "message": {"content": "SELECT 1"}}]});
        assert_eq!(parse_completion(&ok).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_failure_kind(429, ""), ServiceFailureKind::Quota);
        assert_eq!(status_failure_kind(503, ""), ServiceFailureKind::Network);
        assert_eq!(status_failure_kind(400, "bad"), ServiceFailureKind::InvalidResponse);
    }

    #[test]
    fn test_from_settings_requires_key() {
        let settings = LlmSettings::default();
        assert!(LlmClient::from_settings(&settings, Duration::from_secs(1)).is_err());
    }
}
