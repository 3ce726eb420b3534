//! One-shot generative-model client, used by the Transcript Analyzer (C7,
//! structured JSON extraction) and the Notification Dispatcher (C9,
//! customer message copywriting).
//!
//! Distinct from [`crate::llm`]'s bidirectional streaming channel: this is
//! a plain request/response `reqwest` call against the same vendor's
//! non-streaming `generateContent` endpoint, grounded in the teacher's
//! REST-client shape (`agent::llm::OpenRouterClient` / one `reqwest::Client`
//! plus one request-builder method) rather than a WebSocket.

use reqwest::Client;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::AnalyzerError;
use crate::token::SingleCallUsage;

const GENERATE_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Clone)]
pub struct GenerativeClient {
    http: Client,
    api_key: String,
    model: String,
}

/// A generation result paired with the usage the vendor reported for it.
pub struct Generation {
    pub text: String,
    pub usage: SingleCallUsage,
}

impl GenerativeClient {
    pub fn new(api_key: String) -> Self {
        Self { http: Client::new(), api_key, model: "gemini-2.0-flash".to_string() }
    }

    /// Call the model with a plain text prompt, optionally constraining
    /// the response to JSON MIME (§4.4 stage 4 uses this; §4.6's customer
    /// message generation does not).
    pub async fn generate(&self, prompt: &str, json_mode: bool) -> Result<Generation, AnalyzerError> {
        let url = format!("{}/{}:generateContent?key={}", GENERATE_ENDPOINT, self.model, self.api_key);
        let mut generation_config = json!({});
        if json_mode {
            generation_config["responseMimeType"] = json!("application/json");
        }
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": generation_config,
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalyzerError::RequestFailed(e.to_string()))?;

        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .map_err(|e| AnalyzerError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            warn!(%status, body = %value, "generative model request failed");
            return Err(AnalyzerError::RequestFailed(format!("status {status}")));
        }

        let text = value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let usage = SingleCallUsage {
            total: value["usageMetadata"]["totalTokenCount"].as_u64().unwrap_or(0),
            prompt: value["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            candidates: value["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
            thoughts: value["usageMetadata"]["thoughtsTokenCount"].as_u64().unwrap_or(0),
        };

        Ok(Generation { text, usage })
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }
}
