//! Token Accumulator (C11).
//!
//! Sums token usage across three heterogeneous-shaped sources
//! (conversation streaming usage records, a single analysis-call usage
//! tuple, a single WhatsApp-generation usage tuple) and persists one
//! merged summary (§4.5). Per §9's resolved Open Question, conversation
//! usage is folded in exactly once, at end-of-call aggregation time (post-
//! call pipeline stage 3), not as a running sum during the call.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::llm::UsageRecord;
use crate::persistence::PersistenceClient;

/// Per-operation token totals (§3 Token Usage Summary).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationUsage {
    pub model: String,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modality_breakdown: Option<BTreeMap<String, u64>>,
}

/// One `{total, prompt, candidates, thoughts}` tuple, the shape both the
/// analysis and WhatsApp-generation calls report (§4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleCallUsage {
    pub total: u64,
    pub prompt: u64,
    pub candidates: u64,
    pub thoughts: u64,
}

/// Accumulates usage across the three named operations and computes the
/// grand total on [`Self::to_json`] / [`Self::save`] (§4.5).
#[derive(Debug, Clone, Default)]
pub struct TokenAccumulator {
    conversation: Option<OperationUsage>,
    transcript_analysis: Option<OperationUsage>,
    whatsapp_generation: Option<OperationUsage>,
}

impl TokenAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum a list of streaming usage records into the `conversation` key.
    /// Idempotent: a later call replaces, rather than adds to, the
    /// previous `conversation` entry (§4.5).
    pub fn add_conversation_tokens(&mut self, usage_list: &[UsageRecord], model: &str) {
        let mut total = 0u64;
        let mut input = 0u64;
        let mut output = 0u64;
        for record in usage_list {
            total += record.total_token_count;
            input += record.prompt_token_count;
            output += record.response_token_count;
        }
        self.conversation = Some(OperationUsage {
            model: model.to_string(),
            total_tokens: total,
            input_tokens: input,
            output_tokens: output,
            modality_breakdown: None,
        });
    }

    /// Record the `transcript_analysis` operation's usage. Idempotent:
    /// calling twice with the same record replaces, not doubles, the
    /// entry (§8).
    pub fn add_analysis_tokens(&mut self, usage: SingleCallUsage, model: &str) {
        self.transcript_analysis = Some(single_call_to_operation(usage, model));
    }

    /// Record the `whatsapp_generation` operation's usage.
    pub fn add_whatsapp_tokens(&mut self, usage: SingleCallUsage, model: &str) {
        self.whatsapp_generation = Some(single_call_to_operation(usage, model));
    }

    /// Grand total rule (§4.5): sum of each operation's `total_tokens`;
    /// missing operations contribute zero.
    pub fn grand_total(&self) -> u64 {
        [&self.conversation, &self.transcript_analysis, &self.whatsapp_generation]
            .iter()
            .filter_map(|op| op.as_ref().map(|o| o.total_tokens))
            .sum()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "conversation": self.conversation,
            "transcript_analysis": self.transcript_analysis,
            "whatsapp_generation": self.whatsapp_generation,
            "total_tokens_all_operations": self.grand_total(),
        })
    }

    /// Write the JSON summary under `ai_token_usage` for the call id
    /// (§4.5). Backed by a `call_details` column update.
    pub async fn save(&self, persistence: &PersistenceClient, call_id: &str) -> bool {
        let patch = json!({ "ai_token_usage": self.to_json() });
        persistence
            .update_call_detail_by_call_id(call_id, &patch)
            .await
            .is_ok()
    }
}

fn single_call_to_operation(usage: SingleCallUsage, model: &str) -> OperationUsage {
    let mut breakdown = BTreeMap::new();
    breakdown.insert("candidates".to_string(), usage.candidates);
    breakdown.insert("thoughts".to_string(), usage.thoughts);
    OperationUsage {
        model: model.to_string(),
        total_tokens: usage.total,
        input_tokens: usage.prompt,
        output_tokens: usage.candidates,
        modality_breakdown: Some(breakdown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grand_total_sums_present_operations_and_skips_missing() {
        let mut acc = TokenAccumulator::new();
        acc.add_conversation_tokens(
            &[
                UsageRecord { total_token_count: 100, prompt_token_count: 60, response_token_count: 40 },
                UsageRecord { total_token_count: 50, prompt_token_count: 20, response_token_count: 30 },
            ],
            "gemini-live",
        );
        acc.add_analysis_tokens(SingleCallUsage { total: 30, prompt: 20, candidates: 10, thoughts: 0 }, "gemini-flash");
        assert_eq!(acc.grand_total(), 180);
    }

    #[test]
    fn add_analysis_tokens_twice_replaces_not_doubles() {
        let mut acc = TokenAccumulator::new();
        let usage = SingleCallUsage { total: 30, prompt: 20, candidates: 10, thoughts: 0 };
        acc.add_analysis_tokens(usage, "gemini-flash");
        acc.add_analysis_tokens(usage, "gemini-flash");
        assert_eq!(acc.grand_total(), 30);
    }

    #[test]
    fn add_conversation_tokens_replaces_previous_call() {
        let mut acc = TokenAccumulator::new();
        acc.add_conversation_tokens(&[UsageRecord { total_token_count: 10, prompt_token_count: 5, response_token_count: 5 }], "m");
        acc.add_conversation_tokens(&[UsageRecord { total_token_count: 99, prompt_token_count: 50, response_token_count: 49 }], "m");
        assert_eq!(acc.grand_total(), 99);
    }
}
