//! Transcript Analyzer (C7).
//!
//! Schema-constrained structured extraction over a finalized transcript
//! (§4.4 stage 4). Builds an analyzer prompt from the tenant's analyzer
//! prompt template plus the transcript rendered as `role: text` lines,
//! calls the generative model with a JSON-MIME structured-output
//! contract, and validates the response.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::generative::GenerativeClient;
use crate::tenant::TenantConfig;
use crate::token::SingleCallUsage;

/// Validated analysis result (§4.4 stage 4, §3 Critical call details).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub call_type: String,
    pub summary: String,
    pub key_details: Map<String, Value>,
}

impl AnalysisResult {
    /// §7 Downstream validation fallback: call_type `Others`, a generic
    /// summary, and empty key details.
    fn fallback() -> Self {
        Self {
            call_type: "Others".to_string(),
            summary: "Failed to analyze call transcript.".to_string(),
            key_details: Map::new(),
        }
    }
}

pub struct TranscriptAnalyzer {
    client: GenerativeClient,
}

impl TranscriptAnalyzer {
    pub fn new(client: GenerativeClient) -> Self {
        Self { client }
    }

    /// Run analysis, returning the validated result alongside the usage
    /// the model call consumed (folded into the Token Accumulator by the
    /// caller, §4.4 stage 4/6).
    pub async fn analyze(
        &self,
        tenant: &TenantConfig,
        transcript_lines: &str,
    ) -> (AnalysisResult, SingleCallUsage, &str) {
        let prompt = format!(
            "{}\n\nTranscript:\n{}\n\nRespond with a JSON object with keys \"call_type\", \"summary\", \"key_details\".",
            tenant.analyzer_prompt, transcript_lines
        );

        match self.client.generate(&prompt, true).await {
            Ok(generation) => {
                let parsed = parse_and_validate(&generation.text, tenant);
                (parsed, generation.usage, self.client.model_name())
            }
            Err(e) => {
                warn!(error = %e, "transcript analysis request failed");
                (AnalysisResult::fallback(), SingleCallUsage::default(), self.client.model_name())
            }
        }
    }
}

/// Parse the model's response and validate required keys (§4.4 stage 4,
/// §7 Downstream validation). Missing/invalid data coerces to the
/// fallback rather than propagating an error.
fn parse_and_validate(raw: &str, tenant: &TenantConfig) -> AnalysisResult {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => match extract_json_object(raw) {
            Some(v) => v,
            None => return AnalysisResult::fallback(),
        },
    };

    let obj = match value.as_object() {
        Some(o) => o,
        None => return AnalysisResult::fallback(),
    };

    let call_type_raw = obj.get("call_type").and_then(Value::as_str);
    let summary = obj.get("summary").and_then(Value::as_str);
    let key_details = obj.get("key_details").and_then(Value::as_object).cloned();

    match (call_type_raw, summary) {
        (Some(ct), Some(s)) => AnalysisResult {
            call_type: tenant.coerce_call_type(ct),
            summary: s.to_string(),
            key_details: key_details.unwrap_or_default(),
        },
        _ => AnalysisResult::fallback(),
    }
}

/// Best-effort recovery of a JSON object embedded in noisier text (the
/// model sometimes wraps the object in prose or a code fence).
fn extract_json_object(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&raw[start..=end]).ok()
}

/// Render the persisted `critical_call_details` JSON blob (§3, §6).
pub fn to_critical_call_details(result: &AnalysisResult) -> Value {
    json!({
        "call_type": result.call_type,
        "summary": result.summary,
        "key_details": result.key_details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantConfig {
        TenantConfig::fallback("acme")
    }

    #[test]
    fn parses_well_formed_json() {
        let raw = r#"{"call_type": "Booking", "summary": "Wants a table", "key_details": {"party_size": "4"}}"#;
        let result = parse_and_validate(raw, &tenant());
        assert_eq!(result.call_type, "Booking");
        assert_eq!(result.summary, "Wants a table");
        assert_eq!(result.key_details.get("party_size").unwrap(), "4");
    }

    #[test]
    fn coerces_unknown_call_type_to_others() {
        let raw = r#"{"call_type": "Spam", "summary": "weird call", "key_details": {}}"#;
        let result = parse_and_validate(raw, &tenant());
        assert_eq!(result.call_type, "Others");
    }

    #[test]
    fn invalid_json_falls_back() {
        let result = parse_and_validate("not json at all", &tenant());
        assert_eq!(result.call_type, "Others");
        assert_eq!(result.summary, "Failed to analyze call transcript.");
        assert!(result.key_details.is_empty());
    }

    #[test]
    fn recovers_json_object_wrapped_in_prose() {
        let raw = "Sure, here you go:\n```json\n{\"call_type\": \"Informational\", \"summary\": \"asked hours\", \"key_details\": {}}\n```";
        let result = parse_and_validate(raw, &tenant());
        assert_eq!(result.call_type, "Informational");
    }

    #[test]
    fn missing_required_key_falls_back() {
        let raw = r#"{"summary": "no call type field"}"#;
        let result = parse_and_validate(raw, &tenant());
        assert_eq!(result.call_type, "Others");
    }
}
