//! Telephony Adapter (C4).
//!
//! Parses and emits the telephony provider's JSON-over-WebSocket framing
//! (§6). Frames are internally tagged on the `event` field, matching the
//! provider's wire shape directly rather than probing for optional keys —
//! the same "decode once at the boundary, dispatch on the tag" idiom used
//! for the LLM stream (§9).

pub mod rest;

use serde::{Deserialize, Serialize};

/// A frame received from the telephony peer.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundFrame {
    Connected,
    Start { start: StartPayload },
    Media { media: MediaPayload },
    Dtmf { dtmf: DtmfPayload },
    Mark { mark: MarkPayload },
    Clear,
    Stop {
        #[serde(default)]
        stop: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartPayload {
    pub stream_sid: String,
    pub call_sid: String,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub custom_parameters: Option<CustomParameters>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CustomParameters {
    pub tenant: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
    #[serde(default)]
    pub rate: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DtmfPayload {
    pub digit: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkPayload {
    pub name: String,
}

/// A frame emitted to the telephony peer. Sequence numbers are strings,
/// monotonically increasing from 1 (§6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundFrame {
    Media {
        sequence_number: String,
        stream_sid: String,
        media: OutboundMediaPayload,
    },
    Mark {
        sequence_number: String,
        stream_sid: String,
        mark: OutboundMarkPayload,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMediaPayload {
    pub payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMarkPayload {
    pub name: String,
}

impl OutboundFrame {
    pub fn media(sequence_number: u64, stream_sid: &str, base64_payload: String) -> Self {
        OutboundFrame::Media {
            sequence_number: sequence_number.to_string(),
            stream_sid: stream_sid.to_string(),
            media: OutboundMediaPayload { payload: base64_payload },
        }
    }

    pub fn mark(sequence_number: u64, stream_sid: &str, name: String) -> Self {
        OutboundFrame::Mark {
            sequence_number: sequence_number.to_string(),
            stream_sid: stream_sid.to_string(),
            mark: OutboundMarkPayload { name },
        }
    }
}

/// Parse a single incoming telephony WebSocket text frame.
pub fn parse_inbound(text: &str) -> Result<InboundFrame, serde_json::Error> {
    serde_json::from_str(text)
}

/// Serialize an outbound telephony WebSocket text frame.
pub fn serialize_outbound(frame: &OutboundFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_start_frame_with_tenant_override() {
        let json = r#"{
            "event": "start",
            "start": {
                "stream_sid": "MZ123",
                "call_sid": "CA123",
                "account_sid": "AC123",
                "custom_parameters": {"tenant": "bakery"}
            }
        }"#;
        match parse_inbound(json).unwrap() {
            InboundFrame::Start { start } => {
                assert_eq!(start.stream_sid, "MZ123");
                assert_eq!(start.custom_parameters.unwrap().tenant.as_deref(), Some("bakery"));
            }
            other => panic!("expected Start, got {:?}", other),
        }
    }

    #[test]
    fn parses_media_frame_with_optional_rate() {
        let json = r#"{"event":"media","media":{"payload":"AAA=","rate":16000}}"#;
        match parse_inbound(json).unwrap() {
            InboundFrame::Media { media } => {
                assert_eq!(media.payload, "AAA=");
                assert_eq!(media.rate, Some(16000));
            }
            other => panic!("expected Media, got {:?}", other),
        }
    }

    #[test]
    fn parses_clear_and_stop_without_payload() {
        assert!(matches!(parse_inbound(r#"{"event":"clear"}"#).unwrap(), InboundFrame::Clear));
        assert!(matches!(parse_inbound(r#"{"event":"stop"}"#).unwrap(), InboundFrame::Stop { .. }));
    }

    #[test]
    fn emits_media_then_mark_with_matching_sequence_style() {
        let media = OutboundFrame::media(1, "MZ1", "AAA=".to_string());
        let mark = OutboundFrame::mark(2, "MZ1", "audio_chunk_1".to_string());
        let media_json = serialize_outbound(&media).unwrap();
        let mark_json = serialize_outbound(&mark).unwrap();
        assert!(media_json.contains("\"event\":\"media\""));
        assert!(media_json.contains("\"sequence_number\":\"1\""));
        assert!(mark_json.contains("\"event\":\"mark\""));
        assert!(mark_json.contains("\"name\":\"audio_chunk_1\""));
    }
}
