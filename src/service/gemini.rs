//! HTTP backend for a Gemini-style `generateContent` endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{GenerationRequest, GenerationService};
use crate::error::{TranslateError, TranslateResult};
use crate::textutil::preview;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const API_VERSION: &str = "v1beta";

pub struct GeminiService {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiService {
    pub fn new(
        base_url: Option<&str>,
        api_key: &str,
        timeout: Option<Duration>,
    ) -> TranslateResult<Self> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(TranslateError::Config(
                "missing credential for the generation service".to_string(),
            ));
        }
        let mut builder = reqwest::Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        let base_url = base_url
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            http: builder.build()?,
            base_url,
            api_key: api_key.to_string(),
        })
    }

    pub fn endpoint(&self, model: &str) -> String {
        let model = model.trim().trim_start_matches("models/");
        format!("{}/{API_VERSION}/models/{model}:generateContent", self.base_url)
    }
}

/// Request body: every turn is a user turn; JSON output constrained by the schema.
pub fn request_body(request: &GenerationRequest) -> Value {
    let contents: Vec<Value> = request
        .turns
        .iter()
        .map(|t| json!({ "role": "user", "parts": [{ "text": t.text }] }))
        .collect();
    json!({
        "contents": contents,
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": to_gemini_schema(&request.response_schema),
        }
    })
}

/// Gemini spells schema types in upper case (`OBJECT`, `ARRAY`, `STRING`).
fn to_gemini_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                let v = match (k.as_str(), v) {
                    ("type", Value::String(t)) => Value::String(t.to_ascii_uppercase()),
                    _ => to_gemini_schema(v),
                };
                out.insert(k.clone(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(to_gemini_schema).collect()),
        other => other.clone(),
    }
}

/// Concatenated text parts of the first candidate.
pub fn extract_candidate_text(response: &Value) -> TranslateResult<String> {
    let candidate = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| {
            let reason = response
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .unwrap_or("none");
            TranslateError::contract(format!("response has no candidates (blockReason={reason})"))
        })?;
    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            let reason = candidate
                .get("finishReason")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            TranslateError::contract(format!("candidate has no content (finishReason={reason})"))
        })?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.trim().is_empty() {
        return Err(TranslateError::contract("candidate text is empty"));
    }
    Ok(text)
}

#[async_trait]
impl GenerationService for GeminiService {
    async fn generate(&self, request: &GenerationRequest) -> TranslateResult<String> {
        let url = self.endpoint(&request.model);
        tracing::debug!(%url, turns = request.turns.len(), items = request.expected_items, "generateContent");
        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request_body(request))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(TranslateError::Service {
                status: status.as_u16(),
                body: preview(&body, 2000),
            });
        }
        let value: Value = serde_json::from_str(&body).map_err(|e| {
            TranslateError::contract(format!("service body is not JSON: {e}"))
        })?;
        extract_candidate_text(&value)
    }
}
