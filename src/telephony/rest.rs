//! Call-Detail Fetcher (C8).
//!
//! Retrieves the canonical call record from the telephony provider's REST
//! API after hangup (§4.4 stage 1, §6). On HTTP failure or a missing
//! `Call` envelope, logs and continues — this stage's failure must not
//! block the rest of the post-call pipeline.

use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct TelephonyRestConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub base_url: String,
}

impl TelephonyRestConfig {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        Self { account_sid, auth_token, base_url: "https://api.exotel.com".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallRecord {
    #[serde(default, rename = "From")]
    pub from: String,
    #[serde(default, rename = "To")]
    pub to: String,
    #[serde(default, rename = "Status")]
    pub status: String,
    #[serde(default, rename = "StartTime")]
    pub start_time: String,
    #[serde(default, rename = "EndTime")]
    pub end_time: String,
    #[serde(default, rename = "Duration")]
    pub duration: String,
    #[serde(default, rename = "Price")]
    pub price: String,
    #[serde(default, rename = "Direction")]
    pub direction: String,
    #[serde(default, rename = "RecordingUrl")]
    pub recording_url: String,
}

#[derive(Debug, Deserialize)]
struct CallEnvelope {
    #[serde(rename = "Call")]
    call: Option<CallRecord>,
}

pub struct CallDetailFetcher {
    http: Client,
    config: TelephonyRestConfig,
}

impl CallDetailFetcher {
    pub fn new(config: TelephonyRestConfig) -> Self {
        Self { http: Client::new(), config }
    }

    /// `GET /v1/Accounts/{account_sid}/Calls/{call_sid}.json` with basic
    /// auth (§6). Returns `None` on transport failure or a missing `Call`
    /// envelope rather than an error, matching §4.4 stage 1's "log and
    /// continue" policy.
    pub async fn fetch(&self, call_sid: &str) -> Option<CallRecord> {
        let url = format!(
            "{}/v1/Accounts/{}/Calls/{}.json",
            self.config.base_url, self.config.account_sid, call_sid
        );
        let resp = match self
            .http
            .get(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(call_sid, error = %e, "telephony REST fetch failed");
                return None;
            }
        };

        if !resp.status().is_success() {
            warn!(call_sid, status = %resp.status(), "telephony REST fetch returned non-success status");
            return None;
        }

        match resp.json::<CallEnvelope>().await {
            Ok(envelope) => match envelope.call {
                Some(call) => Some(call),
                None => {
                    warn!(call_sid, "telephony REST response missing Call envelope");
                    None
                }
            },
            Err(e) => {
                warn!(call_sid, error = %e, "telephony REST response decode failed");
                None
            }
        }
    }
}

impl CallRecord {
    /// Row shape for `exotel_call_details` insert (§4.4 stage 1, §6).
    pub fn to_exotel_row(&self, call_id: &str, stream_id: &str, tenant_id: &str) -> Value {
        json!({
            "call_id": call_id,
            "stream_id": stream_id,
            "tenant_id": tenant_id,
            "from_number": self.from,
            "to_number": self.to,
            "status": self.status,
            "start_time": self.start_time,
            "end_time": self.end_time,
            "duration": self.duration,
            "price": self.price,
            "direction": self.direction,
            "recording_url": self.recording_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_envelope_with_call_present() {
        let raw = r#"{"Call": {"From": "+911234567890", "To": "+919876543210", "Status": "completed", "StartTime": "t1", "EndTime": "t2", "Duration": "42", "Price": "-0.50", "Direction": "inbound", "RecordingUrl": "https://x"}}"#;
        let envelope: CallEnvelope = serde_json::from_str(raw).unwrap();
        let call = envelope.call.unwrap();
        assert_eq!(call.from, "+911234567890");
        assert_eq!(call.duration, "42");
    }

    #[test]
    fn missing_call_envelope_decodes_to_none() {
        let envelope: CallEnvelope = serde_json::from_str("{}").unwrap();
        assert!(envelope.call.is_none());
    }
}
