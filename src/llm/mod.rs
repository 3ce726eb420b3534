//! LLM Client (C3).
//!
//! Opens a streaming bidirectional WebSocket channel to the "Live"
//! multimodal model, sends audio/text turns, and decodes the vendor's
//! response stream once at the boundary into the tagged union described in
//! §9 ("Async iteration over a vendor stream whose frame schema is
//! discovered at runtime"). The Session then dispatches on the tag rather
//! than probing attribute presence.

use std::collections::VecDeque;
use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

const LLM_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";
const DEFAULT_VOICE: &str = "Zephyr";

/// One fully-decoded unit of vendor response, tagged once at the stream
/// boundary (§9).
#[derive(Debug, Clone)]
pub enum LlmFrame {
    AudioChunk(Vec<u8>),
    UserTranscript(String),
    AssistantTranscript(String),
    AssistantText(String),
    Usage(UsageRecord),
    EndOfTurn,
}

/// A single per-turn token-accounting datum (§3 Token Usage Summary, §4.5).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(default)]
    pub total_token_count: u64,
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub response_token_count: u64,
}

/// Settings the Session opens a channel with (§6, "Configuration sent at
/// connect time").
#[derive(Debug, Clone)]
pub struct LlmChannelConfig {
    pub api_key: String,
    pub system_prompt: String,
    pub voice_name: String,
    pub vad_sensitivity_high: bool,
    pub prefix_padding_ms: u32,
    pub silence_threshold_ms: u32,
}

impl LlmChannelConfig {
    pub fn new(api_key: String, system_prompt: String) -> Self {
        Self {
            api_key,
            system_prompt,
            voice_name: DEFAULT_VOICE.to_string(),
            vad_sensitivity_high: true,
            prefix_padding_ms: 20,
            silence_threshold_ms: 500,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = futures_util::stream::SplitSink<WsStream, Message>;
type WsSource = futures_util::stream::SplitStream<WsStream>;

/// A live bidirectional channel to the LLM, owned exclusively by one
/// Session (§5: single-writer discipline — only `inbound_pump` writes to
/// this side).
pub struct LlmChannel {
    socket: WsStream,
    pending: VecDeque<LlmFrame>,
}

/// The send half of a [`LlmChannel`], owned by `inbound_pump` after
/// [`LlmChannel::split`] (§5: single-writer discipline).
pub struct LlmSender {
    sink: WsSink,
}

/// The receive half, owned by `outbound_pump` after [`LlmChannel::split`].
pub struct LlmReceiver {
    source: WsSource,
    pending: VecDeque<LlmFrame>,
}

impl LlmSender {
    pub async fn send_audio(&mut self, pcm: &[u8]) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "realtimeInput": {
                "mediaChunks": [{
                    "mimeType": "audio/pcm",
                    "data": base64::engine::general_purpose::STANDARD.encode(pcm),
                }]
            }
        });
        self.sink.send(Message::Text(payload.to_string())).await?;
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "clientContent": {
                "turns": [{"role": "user", "parts": [{"text": text}]}],
                "turnComplete": true,
            }
        });
        self.sink.send(Message::Text(payload.to_string())).await?;
        Ok(())
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        self.sink.send(Message::Close(None)).await.ok();
        Ok(())
    }
}

impl LlmReceiver {
    /// Read the next decoded frame, retrying the underlying socket read up
    /// to 3 times with the §4.1 backoff envelope on transient error.
    ///
    /// A vendor message that decodes to zero frames (e.g. Gemini Live's
    /// opening `{"setupComplete": {}}`) must not be mistaken for end of
    /// stream — we keep reading until a message yields a frame or the
    /// socket itself ends/closes.
    pub async fn next_frame(&mut self, backoffs: &[u64]) -> anyhow::Result<Option<LlmFrame>> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }

        let mut last_err = None;
        for (attempt, delay_secs) in std::iter::once(&0u64).chain(backoffs.iter()).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(*delay_secs)).await;
            }
            loop {
                match self.source.next().await {
                    None => return Ok(None),
                    Some(Ok(Message::Text(text))) => {
                        decode_into(&text, &mut self.pending);
                        match self.pending.pop_front() {
                            Some(frame) => return Ok(Some(frame)),
                            None => continue,
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(text) = String::from_utf8(bytes) {
                            decode_into(&text, &mut self.pending);
                        }
                        match self.pending.pop_front() {
                            Some(frame) => return Ok(Some(frame)),
                            None => continue,
                        }
                    }
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    Some(Ok(_other)) => continue,
                    Some(Err(e)) => {
                        warn!(attempt, error = %e, "LLM stream read error");
                        last_err = Some(e);
                        break;
                    }
                }
            }
        }
        Err(anyhow::anyhow!("LLM stream read failed after retries: {:?}", last_err))
    }
}

fn decode_into(raw: &str, pending: &mut VecDeque<LlmFrame>) {
    match serde_json::from_str::<RawServerMessage>(raw) {
        Ok(msg) => pending.extend(msg.into_frames()),
        Err(e) => debug!(error = %e, raw_len = raw.len(), "unrecognized LLM frame shape, skipping"),
    }
}

impl LlmChannel {
    /// Open the channel, retrying up to `backoffs.len()` times with the
    /// given delays between attempts (§4.1: 1 s → 2 s → 4 s).
    pub async fn connect(config: &LlmChannelConfig, backoffs: &[u64]) -> anyhow::Result<Self> {
        let url = format!("{}?key={}", LLM_ENDPOINT, config.api_key);
        let mut last_err = None;
        for (attempt, delay_secs) in std::iter::once(&0u64).chain(backoffs.iter()).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(*delay_secs)).await;
            }
            match tokio_tungstenite::connect_async(&url).await {
                Ok((socket, _response)) => {
                    let mut channel = Self { socket, pending: VecDeque::new() };
                    channel.send_setup(config).await?;
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "LLM connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(anyhow::anyhow!(
            "LLM channel failed to open after {} attempts: {:?}",
            backoffs.len() + 1,
            last_err
        ))
    }

    async fn send_setup(&mut self, config: &LlmChannelConfig) -> anyhow::Result<()> {
        let setup = serde_json::json!({
            "setup": {
                "generationConfig": {
                    "responseModalities": ["AUDIO"],
                    "speechConfig": {
                        "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": config.voice_name}}
                    },
                },
                "systemInstruction": {
                    "parts": [{"text": config.system_prompt}]
                },
                "realtimeInputConfig": {
                    "automaticActivityDetection": {
                        "startOfSpeechSensitivity": if config.vad_sensitivity_high { "START_SENSITIVITY_HIGH" } else { "START_SENSITIVITY_LOW" },
                        "endOfSpeechSensitivity": if config.vad_sensitivity_high { "END_SENSITIVITY_HIGH" } else { "END_SENSITIVITY_LOW" },
                        "prefixPaddingMs": config.prefix_padding_ms,
                        "silenceDurationMs": config.silence_threshold_ms,
                    }
                }
            }
        });
        self.socket.send(Message::Text(setup.to_string())).await?;
        Ok(())
    }

    /// Split into independently-owned send/receive halves so `inbound_pump`
    /// can write while `outbound_pump` reads concurrently (§5).
    pub fn split(self) -> (LlmSender, LlmReceiver) {
        let (sink, source) = self.socket.split();
        (LlmSender { sink }, LlmReceiver { source, pending: self.pending })
    }
}

/// The vendor's wire shape: a single response object that may carry audio,
/// text, transcripts, and usage all at once, or none of them. Decoded once
/// here; everything downstream works with [`LlmFrame`].
#[derive(Debug, Deserialize, Default)]
struct RawServerMessage {
    #[serde(default, rename = "serverContent")]
    server_content: Option<RawServerContent>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<UsageRecord>,
}

#[derive(Debug, Deserialize, Default)]
struct RawServerContent {
    #[serde(default, rename = "modelTurn")]
    model_turn: Option<RawModelTurn>,
    #[serde(default, rename = "inputTranscription")]
    input_transcription: Option<RawTranscription>,
    #[serde(default, rename = "outputTranscription")]
    output_transcription: Option<RawTranscription>,
    #[serde(default, rename = "turnComplete")]
    turn_complete: bool,
}

#[derive(Debug, Deserialize, Default)]
struct RawModelTurn {
    #[serde(default)]
    parts: Vec<RawPart>,
}

#[derive(Debug, Deserialize, Default)]
struct RawPart {
    #[serde(default, rename = "inlineData")]
    inline_data: Option<RawInlineData>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawInlineData {
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawTranscription {
    #[serde(default)]
    text: String,
}

impl RawServerMessage {
    fn into_frames(self) -> Vec<LlmFrame> {
        let mut frames = Vec::new();
        if let Some(content) = self.server_content {
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(inline) = part.inline_data {
                        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&inline.data) {
                            frames.push(LlmFrame::AudioChunk(bytes));
                        }
                    }
                    if let Some(text) = part.text {
                        if !text.is_empty() {
                            frames.push(LlmFrame::AssistantText(text));
                        }
                    }
                }
            }
            if let Some(t) = content.input_transcription {
                if !t.text.is_empty() {
                    frames.push(LlmFrame::UserTranscript(t.text));
                }
            }
            if let Some(t) = content.output_transcription {
                if !t.text.is_empty() {
                    frames.push(LlmFrame::AssistantTranscript(t.text));
                }
            }
            if content.turn_complete {
                frames.push(LlmFrame::EndOfTurn);
            }
        }
        if let Some(usage) = self.usage_metadata {
            frames.push(LlmFrame::Usage(usage));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_audio_text_transcript_and_usage_from_one_message() {
        let raw = serde_json::json!({
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {"data": base64::engine::general_purpose::STANDARD.encode([1,2,3])}}, {"text": "hi"}]},
                "outputTranscription": {"text": "hello there"},
                "turnComplete": true
            },
            "usageMetadata": {"total_token_count": 42, "prompt_token_count": 10, "response_token_count": 32}
        });
        let msg: RawServerMessage = serde_json::from_value(raw).unwrap();
        let frames = msg.into_frames();
        assert!(matches!(frames[0], LlmFrame::AudioChunk(ref b) if b == &vec![1,2,3]));
        assert!(matches!(&frames[1], LlmFrame::AssistantText(t) if t == "hi"));
        assert!(matches!(&frames[2], LlmFrame::AssistantTranscript(t) if t == "hello there"));
        assert!(matches!(frames[3], LlmFrame::EndOfTurn));
        assert!(matches!(frames[4], LlmFrame::Usage(ref u) if u.total_token_count == 42));
    }

    #[test]
    fn empty_message_decodes_to_no_frames() {
        let msg: RawServerMessage = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(msg.into_frames().is_empty());
    }

    #[test]
    fn empty_text_parts_are_not_emitted_as_frames() {
        let raw = serde_json::json!({
            "serverContent": {"modelTurn": {"parts": [{"text": ""}]}}
        });
        let msg: RawServerMessage = serde_json::from_value(raw).unwrap();
        assert!(msg.into_frames().is_empty());
    }
}
