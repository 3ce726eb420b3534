//! Notification Dispatcher (C9).
//!
//! Renders and sends two WhatsApp messages per qualifying call: one to the
//! caller, one to the tenant owner (§4.6). The messaging provider client
//! is grounded in the teacher's `messaging::telegram::TelegramClient`
//! shape (one `reqwest::Client`, auth header, one `send` method),
//! generalized to MSG91's bulk WhatsApp template endpoint matching
//! `examples/original_source/msg91_provider.py`.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::analyzer::AnalysisResult;
use crate::error::MessagingError;
use crate::generative::GenerativeClient;
use crate::persistence::PersistenceClient;
use crate::tenant::TenantConfig;
use crate::token::{SingleCallUsage, TokenAccumulator};

const MSG91_ENDPOINT: &str = "https://api.msg91.com/api/v5/whatsapp/whatsapp-outbound-message/bulk/";
const NAMESPACE: &str = "2e1d8662_869f_48e9_bb1f_5f995acb2c20";
const RETRY_BACKOFFS_SECS: [u64; 3] = [1, 2, 4];

/// Outcome of one dispatched message (§3 Notification Record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Success,
    PartialFailure,
    Error,
}

/// Recipient type (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientType {
    Customer,
    Owner,
}

#[derive(Debug, Clone)]
pub struct MessagingConfig {
    pub auth_key: String,
    pub integrated_number: String,
    pub default_owner_phone: String,
    pub default_country_code: String,
}

/// MSG91 bulk WhatsApp template client (§6 Messaging provider REST).
pub struct MessagingClient {
    http: Client,
    config: MessagingConfig,
}

impl MessagingClient {
    pub fn new(config: MessagingConfig) -> Self {
        Self { http: Client::new(), config }
    }

    /// Post one template send, retrying up to 3 times with exponential
    /// backoff on network or 5xx errors (§4.6 Template send).
    async fn send_template(&self, to_number: &str, template_name: &str, components: Value) -> Result<(), MessagingError> {
        if self.config.auth_key.is_empty() {
            return Err(MessagingError::NotConfigured("MSG91_AUTH_KEY".to_string()));
        }

        let payload = json!({
            "integrated_number": self.config.integrated_number,
            "content_type": "template",
            "payload": {
                "messaging_product": "whatsapp",
                "type": "template",
                "template": {
                    "name": template_name,
                    "language": {"code": "en", "policy": "deterministic"},
                    "namespace": NAMESPACE,
                    "to_and_components": [{"to": [to_number], "components": components}],
                }
            }
        });

        let mut last_err = None;
        for (attempt, delay) in std::iter::once(&0u64).chain(RETRY_BACKOFFS_SECS.iter()).enumerate() {
            if attempt > 0 {
                sleep(Duration::from_secs(*delay)).await;
            }
            match self
                .http
                .post(MSG91_ENDPOINT)
                .header("authkey", &self.config.auth_key)
                .json(&payload)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().is_server_error() => {
                    warn!(attempt, status = %resp.status(), "MSG91 send failed with 5xx, retrying");
                    last_err = Some(format!("status {}", resp.status()));
                }
                Ok(resp) => {
                    return Err(MessagingError::RequestFailed(format!("status {}", resp.status())));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "MSG91 send transport error, retrying");
                    last_err = Some(e.to_string());
                }
            }
        }
        Err(MessagingError::RequestFailed(last_err.unwrap_or_default()))
    }
}

/// Strip non-digits, strip a single leading zero, and prefix the country
/// code when the number is shorter than country-code+10 digits (§4.6
/// Phone normalization).
pub fn normalize_phone(raw: &str, default_country_code: &str) -> Result<String, MessagingError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = digits.strip_prefix('0').map(str::to_string).unwrap_or(digits);

    if digits.len() == 10 {
        return Ok(format!("{default_country_code}{digits}"));
    }
    if digits.starts_with(default_country_code) && digits.len() >= default_country_code.len() + 10 {
        return Ok(digits);
    }
    if digits.len() > 10 {
        return Ok(format!("{default_country_code}{}", &digits[digits.len() - 10..]));
    }
    Err(MessagingError::InvalidPhone)
}

/// Labeled four-part customer message body (§4.6 Customer message).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerMessageBody {
    #[serde(default)]
    pub body_1: String,
    #[serde(default)]
    pub body_2: String,
    #[serde(default)]
    pub body_3: String,
    #[serde(default)]
    pub body_4: String,
}

impl CustomerMessageBody {
    fn defaults_for_missing(mut self, analysis: &AnalysisResult) -> Self {
        if self.body_1.trim().is_empty() {
            self.body_1 = "there".to_string();
        }
        if self.body_2.trim().is_empty() {
            self.body_2 = "Thank you for your inquiry.".to_string();
        }
        if self.body_3.trim().is_empty() {
            self.body_3 = analysis.summary.clone();
        }
        if self.body_4.trim().is_empty() {
            self.body_4 = "We look forward to serving you soon!".to_string();
        }
        self
    }
}

/// Accept either a JSON object with the four keys, or labeled sections
/// like `body_1: ...` / `body_2: ...` (§4.6: "must accept both forms").
fn parse_customer_message(raw: &str, analysis: &AnalysisResult) -> CustomerMessageBody {
    if let Ok(parsed) = serde_json::from_str::<CustomerMessageBody>(raw) {
        return parsed.defaults_for_missing(analysis);
    }
    if let Some(start) = raw.find('{') {
        if let Some(end) = raw.rfind('}') {
            if end > start {
                if let Ok(parsed) = serde_json::from_str::<CustomerMessageBody>(&raw[start..=end]) {
                    return parsed.defaults_for_missing(analysis);
                }
            }
        }
    }

    let mut body = CustomerMessageBody::default();
    for line in raw.lines() {
        let line = line.trim();
        for (prefix, field) in [
            ("body_1", &mut body.body_1),
            ("body_2", &mut body.body_2),
            ("body_3", &mut body.body_3),
            ("body_4", &mut body.body_4),
        ] {
            if let Some(rest) = line.strip_prefix(prefix) {
                let value = rest.trim_start_matches(':').trim();
                if !value.is_empty() {
                    *field = value.to_string();
                }
            }
        }
    }
    body.defaults_for_missing(analysis)
}

fn components_from_body(body: &CustomerMessageBody) -> Value {
    json!({
        "body_1": {"type": "text", "value": body.body_1},
        "body_2": {"type": "text", "value": body.body_2},
        "body_3": {"type": "text", "value": body.body_3},
        "body_4": {"type": "text", "value": body.body_4},
    })
}

/// Pipe-joined `key: value` rendering of `critical_call_details` excluding
/// `summary` (§4.6 Owner message).
fn format_key_details(analysis: &AnalysisResult) -> String {
    analysis
        .key_details
        .iter()
        .filter(|(k, _)| *k != "summary")
        .map(|(k, v)| format!("{k}: {}", value_to_plain(v)))
        .collect::<Vec<_>>()
        .join(" | ")
}

fn value_to_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct NotificationDispatcher {
    messaging: MessagingClient,
    generative: GenerativeClient,
    persistence: PersistenceClient,
}

impl NotificationDispatcher {
    pub fn new(messaging: MessagingClient, generative: GenerativeClient, persistence: PersistenceClient) -> Self {
        Self { messaging, generative, persistence }
    }

    /// Dispatch both messages for a call (§4.4 stage 5, §4.6). Returns the
    /// overall status per recipient; a partial failure is acceptable as
    /// long as at least one send succeeded. The customer message's
    /// generation usage, if any, is folded into `accumulator` under the
    /// `whatsapp_generation` key before returning (§4.5).
    pub async fn dispatch(
        &self,
        call_id: &str,
        tenant: &TenantConfig,
        analysis: &AnalysisResult,
        caller_phone: Option<&str>,
        accumulator: &mut TokenAccumulator,
    ) -> Vec<(RecipientType, SendStatus)> {
        let mut outcomes = Vec::new();

        let caller_eligible = matches!(analysis.call_type.as_str(), "Booking" | "Informational");
        if caller_eligible {
            if let Some(phone) = caller_phone {
                let (status, usage) = self.dispatch_customer(call_id, tenant, analysis, phone).await;
                if let Some(usage) = usage {
                    accumulator.add_whatsapp_tokens(usage, self.generative.model_name());
                }
                outcomes.push((RecipientType::Customer, status));
            } else {
                info!(call_id, "caller phone unavailable; skipping customer notification");
            }
        } else {
            info!(call_id, call_type = %analysis.call_type, "call_type not in dispatch whitelist; skipping customer notification");
        }

        let owner_phone = tenant
            .branch_owner_phone
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.messaging.config.default_owner_phone.clone());
        let owner_status = self.dispatch_owner(call_id, &owner_phone, caller_phone, analysis).await;
        outcomes.push((RecipientType::Owner, owner_status));

        outcomes
    }

    async fn dispatch_customer(
        &self,
        call_id: &str,
        tenant: &TenantConfig,
        analysis: &AnalysisResult,
        raw_phone: &str,
    ) -> (SendStatus, Option<SingleCallUsage>) {
        let phone = match normalize_phone(raw_phone, &self.messaging.config.default_country_code) {
            Ok(p) => p,
            Err(_) => {
                warn!(call_id, "invalid caller phone number; skipping customer notification");
                self.record(call_id, RecipientType::Customer, SendStatus::Error, Value::Null).await;
                return (SendStatus::Error, None);
            }
        };

        let prompt = format!(
            "Write a WhatsApp follow-up message for a {} call to {}.\nSummary: {}\nDetails: {}\n\n\
             Respond as a JSON object with exactly these keys: body_1 (greeting/name), body_2 (context \
             acknowledgment), body_3 (full critical details), body_4 (closing line).",
            analysis.call_type, tenant.display_name, analysis.summary, format_key_details(analysis)
        );

        let (body, usage) = match self.generative.generate(&prompt, false).await {
            Ok(generation) => (parse_customer_message(&generation.text, analysis), Some(generation.usage)),
            Err(e) => {
                warn!(call_id, error = %e, "customer message generation failed; using defaults");
                (CustomerMessageBody::default().defaults_for_missing(analysis), None)
            }
        };

        let components = components_from_body(&body);
        let status = match self.messaging.send_template(&phone, "service_message", components.clone()).await {
            Ok(()) => {
                self.record(call_id, RecipientType::Customer, SendStatus::Success, components).await;
                SendStatus::Success
            }
            Err(e) => {
                warn!(call_id, error = %e, "customer WhatsApp send failed");
                self.record(call_id, RecipientType::Customer, SendStatus::Error, components).await;
                SendStatus::Error
            }
        };
        (status, usage)
    }

    async fn dispatch_owner(&self, call_id: &str, owner_phone: &str, caller_phone: Option<&str>, analysis: &AnalysisResult) -> SendStatus {
        let phone = match normalize_phone(owner_phone, &self.messaging.config.default_country_code) {
            Ok(p) => p,
            Err(_) => {
                warn!(call_id, "invalid owner phone number; skipping owner notification");
                self.record(call_id, RecipientType::Owner, SendStatus::Error, Value::Null).await;
                return SendStatus::Error;
            }
        };

        let components = json!({
            "body_1": {"type": "text", "value": caller_phone.unwrap_or("Unknown")},
            "body_2": {"type": "text", "value": analysis.call_type},
            "body_3": {"type": "text", "value": analysis.summary},
            "body_4": {"type": "text", "value": format_key_details(analysis)},
        });

        match self.messaging.send_template(&phone, "owner_message", components.clone()).await {
            Ok(()) => {
                self.record(call_id, RecipientType::Owner, SendStatus::Success, components).await;
                SendStatus::Success
            }
            Err(e) => {
                warn!(call_id, error = %e, "owner WhatsApp send failed");
                self.record(call_id, RecipientType::Owner, SendStatus::Error, components).await;
                SendStatus::Error
            }
        }
    }

    async fn record(&self, call_id: &str, recipient_type: RecipientType, status: SendStatus, payload: Value) {
        let row = json!({
            "call_id": call_id,
            "channel": "whatsapp",
            "recipient_type": recipient_type,
            "status": status,
            "payload": payload,
        });
        if let Err(e) = self.persistence.insert_notification(&row).await {
            warn!(call_id, error = %e, "failed to record notification outcome");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis() -> AnalysisResult {
        let mut key_details = serde_json::Map::new();
        key_details.insert("party_size".to_string(), json!("4"));
        key_details.insert("summary".to_string(), json!("should be excluded"));
        AnalysisResult { call_type: "Booking".to_string(), summary: "Table for 4".to_string(), key_details }
    }

    #[test]
    fn normalizes_ten_digit_number_with_country_code_prefix() {
        assert_eq!(normalize_phone("9876543210", "91").unwrap(), "919876543210");
    }

    #[test]
    fn strips_leading_zero_before_prefixing() {
        assert_eq!(normalize_phone("09876543210", "91").unwrap(), "919876543210");
    }

    #[test]
    fn passes_through_number_already_carrying_country_code() {
        assert_eq!(normalize_phone("+91 98765 43210", "91").unwrap(), "919876543210");
    }

    #[test]
    fn rejects_too_short_number() {
        assert!(normalize_phone("12345", "91").is_err());
    }

    #[test]
    fn parses_labeled_sections_form() {
        let raw = "body_1: Sandy\nbody_2: Thanks!\nbody_3: Order confirmed\nbody_4: See you soon";
        let parsed = parse_customer_message(raw, &analysis());
        assert_eq!(parsed.body_1, "Sandy");
        assert_eq!(parsed.body_3, "Order confirmed");
    }

    #[test]
    fn parses_json_object_form() {
        let raw = r#"{"body_1": "Sandy", "body_2": "Thanks", "body_3": "Confirmed", "body_4": "Bye"}"#;
        let parsed = parse_customer_message(raw, &analysis());
        assert_eq!(parsed.body_1, "Sandy");
    }

    #[test]
    fn missing_components_fall_back_to_defaults() {
        let parsed = parse_customer_message("garbage text", &analysis());
        assert_eq!(parsed.body_1, "there");
        assert_eq!(parsed.body_3, "Table for 4");
    }

    #[test]
    fn owner_details_exclude_summary_key() {
        let rendered = format_key_details(&analysis());
        assert!(rendered.contains("party_size: 4"));
        assert!(!rendered.contains("should be excluded"));
    }
}
