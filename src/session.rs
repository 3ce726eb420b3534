//! Session (C5).
//!
//! One call's lifecycle end to end: couples the telephony socket (C4) and
//! the LLM streaming channel (C3), resamples audio in both directions
//! (C1), buffers/flushes outbound audio, enforces liveness, tracks token
//! usage, and hands a completed transcript into the post-call pipeline
//! (§4.1-§4.4).
//!
//! The telephony socket is abstracted behind [`TelephonySink`] /
//! [`TelephonySource`] so the Session's state machine can be exercised in
//! tests without a real WebSocket; production wiring implements both
//! traits over `axum`'s split `WebSocket` (see [`crate::server`]).

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::analyzer::{to_critical_call_details, TranscriptAnalyzer};
use crate::audio::{self, ResamplerState};
use crate::config::Config;
use crate::generative::GenerativeClient;
use crate::llm::{LlmChannel, LlmChannelConfig, LlmFrame, LlmReceiver, LlmSender, UsageRecord};
use crate::notification::NotificationDispatcher;
use crate::persistence::PersistenceClient;
use crate::telephony::rest::CallDetailFetcher;
use crate::telephony::{self, InboundFrame, OutboundFrame};
use crate::tenant::{TenantCache, TenantConfig};
use crate::token::TokenAccumulator;
use crate::transcript::{Role, TranscriptManager};

/// Sends a single telephony text frame (§4.7, single writer per socket).
#[async_trait]
pub trait TelephonySink: Send {
    async fn send(&mut self, text: String) -> anyhow::Result<()>;
    async fn close(&mut self);
}

/// Reads telephony text frames one at a time.
#[async_trait]
pub trait TelephonySource: Send {
    async fn recv(&mut self) -> Option<anyhow::Result<String>>;
}

/// §4.1 connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Initializing = 0,
    AwaitingStart = 1,
    Active = 2,
    Degraded = 3,
    Closing = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Initializing,
            1 => ConnectionState::AwaitingStart,
            2 => ConnectionState::Active,
            3 => ConnectionState::Degraded,
            4 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// A `ConnectionState` shared across the Session's sub-tasks via a cheap
/// `Arc<AtomicU8>` clone, so `keep_alive` can flip Active/Degraded and the
/// Session can observe it (§4.1 state machine, testable scenario 6).
#[derive(Clone)]
struct ConnectionStateCell(Arc<AtomicU8>);

impl ConnectionStateCell {
    fn new(initial: ConnectionState) -> Self {
        Self(Arc::new(AtomicU8::new(initial as u8)))
    }

    fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Everything shared, read-or-written-without-owning-the-task, across the
/// Session's sub-tasks (§5): a mutex-protected outbound buffer + sequence
/// counter, an atomic last-activity timestamp, an atomic keep-alive
/// failure counter, the shared connection-state cell, and the call-
/// timeout guard's detected-language / tripped-reason cells.
struct Shared {
    telephony: AsyncMutex<Box<dyn TelephonySink>>,
    outbound: AsyncMutex<OutboundBuffer>,
    last_activity_millis: AtomicI64,
    keepalive_failures: AtomicU32,
    llm_output_rate_hz: AtomicI64,
    stream_id: String,
    connection_state: ConnectionStateCell,
    detected_language: StdMutex<String>,
    timeout_reason: StdMutex<Option<TimeoutReason>>,
}

struct OutboundBuffer {
    bytes: Vec<u8>,
    last_flush: Instant,
    sequence: u64,
    chunk: u64,
    resampler: ResamplerState,
}

/// Clients and tuning shared read-only across every Session, built once at
/// startup (§5 "Global clients").
pub struct SessionClients {
    pub config: Arc<Config>,
    pub tenant_cache: Arc<TenantCache>,
    pub persistence: PersistenceClient,
    pub call_detail_fetcher: Arc<CallDetailFetcher>,
    pub notifications: Arc<NotificationDispatcher>,
    pub analyzer: Arc<TranscriptAnalyzer>,
    pub generative: GenerativeClient,
    pub llm_api_key: String,
}

/// One call's identity, captured once the `start` frame arrives (§3).
#[derive(Debug, Clone, Default)]
struct Identity {
    session_id: String,
    stream_id: String,
    call_id: String,
    account_id: String,
}

pub struct Session {
    clients: Arc<SessionClients>,
    identity: Identity,
    tenant: Arc<TenantConfig>,
    state: ConnectionStateCell,
}

const TELEPHONY_RATE_HZ: i64 = 8000;
const FALLBACK_GREETING: &str = "Hello, thank you for calling. How can I help you today?";

impl Session {
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn new(clients: Arc<SessionClients>, default_tenant: Arc<TenantConfig>) -> Self {
        Self {
            clients,
            identity: Identity { session_id: Uuid::new_v4().to_string(), ..Default::default() },
            tenant: default_tenant,
            state: ConnectionStateCell::new(ConnectionState::Initializing),
        }
    }

    /// Blocks until the call ends. On any unrecoverable error it still
    /// drives the post-call pipeline to completion (best effort) before
    /// returning (§4.1).
    pub async fn run(
        mut self,
        mut source: Box<dyn TelephonySource>,
        sink: Box<dyn TelephonySink>,
        tenant_override_hint: Option<String>,
    ) -> anyhow::Result<()> {
        self.state.set(ConnectionState::AwaitingStart);

        let start = match await_start_frame(&mut source, self.clients.config.timeouts.start_frame_deadline_secs).await {
            Some(start) => start,
            None => {
                self.state.set(ConnectionState::Closed);
                warn!(session_id = %self.identity.session_id, "no start frame within deadline; closing without a call record");
                return Ok(());
            }
        };

        self.identity.stream_id = start.stream_sid.clone();
        self.identity.call_id = start.call_sid.clone();
        self.identity.account_id = start.account_sid.clone();

        let override_tenant_id = tenant_override_hint.or_else(|| start.custom_parameters.as_ref().and_then(|c| c.tenant.clone()));
        if let Some(candidate) = override_tenant_id {
            if let Some(resolved) = self.clients.tenant_cache.get(&candidate).await {
                if resolved.is_active {
                    self.tenant = resolved;
                }
            }
        }

        self.state.set(ConnectionState::Active);

        let llm_config = LlmChannelConfig::new(self.clients.llm_api_key.clone(), self.tenant.assistant_prompt.clone());
        let channel = match LlmChannel::connect(&llm_config, &self.clients.config.timeouts.llm_connect_backoff_secs).await {
            Ok(c) => c,
            Err(e) => {
                warn!(session_id = %self.identity.session_id, error = %e, "LLM channel failed to open after retries");
                sink_close_best_effort(sink).await;
                self.run_post_call_pipeline(TranscriptManager::new(), Vec::new()).await;
                return Ok(());
            }
        };
        let (mut llm_sender, llm_receiver) = channel.split();

        let greeting = synthesize_greeting(&self.tenant);
        if let Err(e) = llm_sender.send_text(&greeting).await {
            warn!(session_id = %self.identity.session_id, error = %e, "failed to send greeting to LLM");
        }

        let shared = Arc::new(Shared {
            telephony: AsyncMutex::new(sink),
            outbound: AsyncMutex::new(OutboundBuffer {
                bytes: Vec::new(),
                last_flush: Instant::now(),
                sequence: 0,
                chunk: 0,
                resampler: ResamplerState::new(),
            }),
            last_activity_millis: AtomicI64::new(now_millis()),
            keepalive_failures: AtomicU32::new(0),
            llm_output_rate_hz: AtomicI64::new(self.clients.config.audio.llm_output_rate_hz as i64),
            stream_id: self.identity.stream_id.clone(),
            connection_state: self.state.clone(),
            detected_language: StdMutex::new(initial_language_name(&self.tenant)),
            timeout_reason: StdMutex::new(None),
        });

        let stop_signal = Arc::new(tokio::sync::Notify::new());
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let inbound_handle = tokio::spawn(inbound_pump(
            source,
            llm_sender,
            shared.clone(),
            stopped.clone(),
            self.clients.config.clone(),
        ));

        let outbound_handle = tokio::spawn(outbound_pump(
            llm_receiver,
            shared.clone(),
            stopped.clone(),
            self.clients.config.clone(),
        ));

        let keepalive_handle = tokio::spawn(keep_alive(
            shared.clone(),
            stopped.clone(),
            self.clients.config.timeouts.keepalive_failures_before_degraded,
        ));

        let timeout_handle = tokio::spawn(timeout_guard(
            shared.clone(),
            stopped.clone(),
            stop_signal.clone(),
            self.clients.config.timeouts.inactivity_threshold_secs,
            self.clients.config.timeouts.max_call_duration_secs,
            self.clients.config.timeouts.inactivity_check_interval_secs,
            self.clients.config.timeouts.duration_check_interval_secs,
        ));

        // Wait for inbound to finish (peer close / stop frame) or for the
        // timeout guard to request a shutdown.
        tokio::select! {
            _ = inbound_handle => {}
            _ = stop_signal.notified() => {}
        }
        stopped.store(true, Ordering::SeqCst);
        keepalive_handle.abort();
        timeout_handle.abort();

        let drain_cap = Duration::from_secs(self.clients.config.timeouts.outbound_drain_cap_secs);
        let (mut transcript, usage_records) = match tokio::time::timeout(drain_cap, outbound_handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(session_id = %self.identity.session_id, error = %e, "outbound pump task panicked");
                (TranscriptManager::new(), Vec::new())
            }
            Err(_) => {
                warn!(session_id = %self.identity.session_id, "outbound drain exceeded cap; hard-cancelling");
                (TranscriptManager::new(), Vec::new())
            }
        };

        if let Some(reason) = *shared.timeout_reason.lock().unwrap() {
            let language = shared.detected_language.lock().unwrap().clone();
            let exit_line = timeout_exit_statement(&language, reason);
            transcript.add_turn(Role::Assistant, exit_line);
            info!(session_id = %self.identity.session_id, ?reason, language, "appended call-timeout exit line to transcript");
        }

        shared.telephony.lock().await.close().await;

        self.state.set(ConnectionState::Closing);
        self.run_post_call_pipeline(transcript, usage_records).await;
        self.state.set(ConnectionState::Closed);
        Ok(())
    }

    /// §4.4 post-call pipeline. Runs outside the cancellation scope of the
    /// caller's socket (§5); each stage's failure is isolated.
    async fn run_post_call_pipeline(&self, mut transcript: TranscriptManager, usage_records: Vec<UsageRecord>) {
        if transcript.is_empty() && self.identity.call_id.is_empty() {
            return;
        }

        // Stage 1: fetch telephony record.
        if !self.identity.call_id.is_empty() {
            if let Some(record) = self.clients.call_detail_fetcher.fetch(&self.identity.call_id).await {
                let row = record.to_exotel_row(&self.identity.call_id, &self.identity.stream_id, &self.tenant.tenant_id);
                if let Err(e) = self.clients.persistence.insert_exotel_call_detail(&row).await {
                    warn!(call_id = %self.identity.call_id, error = %e, "failed to persist telephony call detail");
                }
            }
        }

        if transcript.is_empty() {
            return;
        }

        // Stage 2: finalize transcript.
        let finalize_result = transcript
            .finalize(&self.clients.persistence, &self.identity.session_id, &self.tenant.tenant_id, &self.identity.call_id)
            .await;
        if let Err(e) = &finalize_result {
            warn!(call_id = %self.identity.call_id, error = %e, "transcript finalize failed");
        }

        // Stage 3: aggregate conversation tokens.
        let mut accumulator = TokenAccumulator::new();
        accumulator.add_conversation_tokens(&usage_records, "gemini-live");

        // Stage 4: analyze transcript.
        let (analysis, analysis_usage, analysis_model) = self.clients.analyzer.analyze(&self.tenant, &transcript.render_as_lines()).await;
        accumulator.add_analysis_tokens(analysis_usage, analysis_model);

        let critical_details = to_critical_call_details(&analysis);
        let patch = json!({ "call_type": analysis.call_type, "critical_call_details": critical_details });
        if let Err(e) = self.clients.persistence.update_call_detail_by_call_id(&self.identity.call_id, &patch).await {
            warn!(call_id = %self.identity.call_id, error = %e, "failed to persist call analysis");
        }

        // Stage 5: dispatch notifications. The caller's number lives on
        // the telephony record fetched in stage 1, not in the transcript.
        let merged = self.clients.persistence.fetch_merged_call_detail(&self.identity.call_id).await.ok();
        let caller_phone = merged
            .as_ref()
            .and_then(|v| v.get("from_number"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let outcomes = self
            .clients
            .notifications
            .dispatch(&self.identity.call_id, &self.tenant, &analysis, caller_phone.as_deref(), &mut accumulator)
            .await;
        info!(call_id = %self.identity.call_id, ?outcomes, "notification dispatch complete");

        // Stage 6: persist token summary.
        accumulator.save(&self.clients.persistence, &self.identity.call_id).await;
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn sink_close_best_effort(mut sink: Box<dyn TelephonySink>) {
    sink.close().await;
}

struct StartFrameOutcome {
    stream_sid: String,
    call_sid: String,
    account_sid: String,
    custom_parameters: Option<telephony::CustomParameters>,
}

async fn await_start_frame(source: &mut Box<dyn TelephonySource>, deadline_secs: u64) -> Option<StartFrameOutcome> {
    let deadline = Duration::from_secs(deadline_secs);
    let result = tokio::time::timeout(deadline, async {
        loop {
            match source.recv().await? {
                Ok(text) => match telephony::parse_inbound(&text) {
                    Ok(InboundFrame::Start { start }) => {
                        return Some(StartFrameOutcome {
                            stream_sid: start.stream_sid,
                            call_sid: start.call_sid,
                            account_sid: start.account_sid,
                            custom_parameters: start.custom_parameters,
                        })
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "malformed telephony frame while awaiting start");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "telephony socket error while awaiting start");
                    return None;
                }
            }
        }
    })
    .await;
    result.unwrap_or(None)
}

/// Try the tenant prompt's quoted opening line, then the explicit
/// `welcome_message`, then a hardcoded fallback (§4.1 step 4). Patterns
/// are tried in order: a quoted string beginning with "Namaste", then any
/// quoted string near the words "greeting"/"welcome".
fn synthesize_greeting(tenant: &TenantConfig) -> String {
    if let Some(explicit) = &tenant.welcome_message {
        if !explicit.trim().is_empty() {
            return explicit.clone();
        }
    }

    if let Some(found) = extract_quoted_opening(&tenant.assistant_prompt) {
        return found;
    }

    FALLBACK_GREETING.to_string()
}

/// Seed the call-timeout guard's "detected spoken language" state from the
/// tenant's configured greeting language (e.g. `"hi-IN"` → `"hindi"`),
/// before any user transcript has been observed (§3 Call Timeout State).
fn initial_language_name(tenant: &TenantConfig) -> String {
    match tenant.greeting_language.split('-').next().unwrap_or("").to_lowercase().as_str() {
        "hi" => "hindi".to_string(),
        "te" => "telugu".to_string(),
        _ => "english".to_string(),
    }
}

/// Classify a user transcript's spoken language from its script, so the
/// call-timeout guard can speak a language-matched exit line. Devanagari
/// and Telugu Unicode blocks are distinctive enough to tell apart without
/// a real language detector; anything else is left as English.
fn detect_language(text: &str) -> Option<&'static str> {
    for ch in text.chars() {
        let code = ch as u32;
        if (0x0900..=0x097F).contains(&code) {
            return Some("hindi");
        }
        if (0x0C00..=0x0C7F).contains(&code) {
            return Some("telugu");
        }
    }
    None
}

fn extract_quoted_opening(prompt: &str) -> Option<String> {
    let namaste_re = regex::Regex::new(r#""(Namaste[^"]*)""#).ok()?;
    if let Some(caps) = namaste_re.captures(prompt) {
        return Some(caps[1].to_string());
    }

    let context_re = regex::Regex::new(r#"(?i)(greeting|welcome)[^"]{0,80}"([^"]+)""#).ok()?;
    if let Some(caps) = context_re.captures(prompt) {
        return Some(caps[2].to_string());
    }

    None
}

/// `inbound_pump`: caller audio/control → LLM (§4.2 inbound path).
async fn inbound_pump(
    mut source: Box<dyn TelephonySource>,
    mut llm_sender: LlmSender,
    shared: Arc<Shared>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    config: Arc<Config>,
) -> Box<dyn TelephonySource> {
    let mut resampler = ResamplerState::new();
    let llm_input_rate = config.audio.llm_input_rate_hz as i64;

    loop {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        let frame = match source.recv().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                warn!(error = %e, "telephony inbound socket error");
                break;
            }
            None => break,
        };

        shared.last_activity_millis.store(now_millis(), Ordering::Relaxed);

        let parsed = match telephony::parse_inbound(&frame) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "malformed inbound telephony frame; skipping");
                continue;
            }
        };

        match parsed {
            InboundFrame::Media { media } => {
                let rate = media.rate.unwrap_or(llm_input_rate);
                let decoded = match base64::engine::general_purpose::STANDARD.decode(&media.payload) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "failed to decode media payload");
                        continue;
                    }
                };
                let (resampled, new_state) = audio::resample(&decoded, rate, llm_input_rate, resampler);
                resampler = new_state;
                if let Err(e) = llm_sender.send_audio(&resampled).await {
                    warn!(error = %e, "failed to forward audio to LLM");
                }
            }
            InboundFrame::Dtmf { dtmf } => {
                // §9 resolved Open Question: forward as a non-terminal
                // user-role text turn, never cancelling the current turn.
                if let Err(e) = llm_sender.send_text(&format!("DTMF: {}", dtmf.digit)).await {
                    warn!(error = %e, "failed to forward DTMF to LLM");
                }
            }
            InboundFrame::Clear => {
                let mut outbound = shared.outbound.lock().await;
                outbound.bytes.clear();
                outbound.last_flush = Instant::now();
            }
            InboundFrame::Stop { .. } => break,
            InboundFrame::Connected | InboundFrame::Mark { .. } | InboundFrame::Start { .. } => continue,
        }
    }

    llm_sender.close().await.ok();
    source
}

/// `outbound_pump`: LLM → caller, including buffering/flush (§4.2
/// outbound path). Sole writer of the transcript and usage record list,
/// since it is the only task reading the LLM's response stream.
async fn outbound_pump(
    mut llm_receiver: LlmReceiver,
    shared: Arc<Shared>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    config: Arc<Config>,
) -> (TranscriptManager, Vec<UsageRecord>) {
    let mut transcript = TranscriptManager::new();
    let mut usage_records = Vec::new();
    let backoffs = &config.timeouts.llm_connect_backoff_secs;
    let flush_interval = Duration::from_millis(config.audio.flush_interval_ms);
    let mut ticker = tokio::time::interval(flush_interval);

    loop {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            frame = llm_receiver.next_frame(backoffs) => {
                match frame {
                    Ok(Some(LlmFrame::AudioChunk(bytes))) => {
                        append_outbound(&shared, &config, bytes).await;
                        maybe_flush(&shared, &config, false).await;
                    }
                    Ok(Some(LlmFrame::UserTranscript(text))) => {
                        if let Some(language) = detect_language(&text) {
                            *shared.detected_language.lock().unwrap() = language.to_string();
                        }
                        transcript.add_turn(Role::User, &text);
                    }
                    Ok(Some(LlmFrame::AssistantTranscript(text))) => transcript.add_turn(Role::Assistant, &text),
                    Ok(Some(LlmFrame::AssistantText(text))) => transcript.push_pending_assistant_text(&text),
                    Ok(Some(LlmFrame::Usage(usage))) => usage_records.push(usage),
                    Ok(Some(LlmFrame::EndOfTurn)) => {
                        maybe_flush(&shared, &config, true).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "LLM stream read failed after retries; ending outbound pump");
                        maybe_flush(&shared, &config, true).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                maybe_flush(&shared, &config, false).await;
            }
        }
    }

    maybe_flush(&shared, &config, true).await;
    (transcript, usage_records)
}

async fn append_outbound(shared: &Arc<Shared>, _config: &Config, bytes: Vec<u8>) {
    let mut outbound = shared.outbound.lock().await;
    outbound.bytes.extend_from_slice(&bytes);
}

/// Flush the outbound buffer when size/time thresholds are met, or always
/// when `force` (end of turn / shutdown drain) is set (§4.2).
async fn maybe_flush(shared: &Arc<Shared>, config: &Config, force: bool) {
    let mut outbound = shared.outbound.lock().await;
    if outbound.bytes.is_empty() {
        return;
    }

    let size_triggered = outbound.bytes.len() >= config.audio.flush_size_bytes;
    let time_triggered = outbound.last_flush.elapsed() >= Duration::from_millis(config.audio.flush_interval_ms);
    if !(size_triggered || time_triggered || force) {
        return;
    }

    let mut payload = std::mem::take(&mut outbound.bytes);
    outbound.last_flush = Instant::now();

    if payload.len() < config.audio.min_chunk_size {
        payload.resize(config.audio.min_chunk_size, 0);
    }

    let llm_rate = shared.llm_output_rate_hz.load(Ordering::Relaxed);
    let (downsampled, new_resampler) = audio::resample(&payload, llm_rate, TELEPHONY_RATE_HZ, outbound.resampler);
    outbound.resampler = new_resampler;

    outbound.sequence += 1;
    let media_seq = outbound.sequence;
    outbound.sequence += 1;
    let mark_seq = outbound.sequence;
    outbound.chunk += 1;
    let chunk_no = outbound.chunk;
    let stream_id = shared.stream_id.clone();
    drop(outbound);

    let encoded = base64::engine::general_purpose::STANDARD.encode(&downsampled);
    let media_frame = OutboundFrame::media(media_seq, &stream_id, encoded);
    let mark_frame = OutboundFrame::mark(mark_seq, &stream_id, format!("audio_chunk_{chunk_no}"));

    let mut telephony = shared.telephony.lock().await;
    if let Ok(text) = telephony::serialize_outbound(&media_frame) {
        if let Err(e) = telephony.send(text).await {
            warn!(error = %e, "failed to send media frame; dropping");
        }
    }
    if let Ok(text) = telephony::serialize_outbound(&mark_frame) {
        if let Err(e) = telephony.send(text).await {
            warn!(error = %e, "failed to send mark frame; dropping");
        }
    }
}

/// `keep_alive`: periodic empty-mark emission on the telephony socket
/// every 30 s (§4.2 GLOSSARY, §5). N consecutive send failures transition
/// the session to degraded without tearing down the call (§4.1).
async fn keep_alive(shared: Arc<Shared>, stopped: Arc<std::sync::atomic::AtomicBool>, failures_before_degraded: u32) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        if stopped.load(Ordering::SeqCst) {
            break;
        }

        let seq = {
            let mut outbound = shared.outbound.lock().await;
            outbound.sequence += 1;
            outbound.sequence
        };
        let frame = OutboundFrame::mark(seq, &shared.stream_id, "keepalive".to_string());
        let send_result = match telephony::serialize_outbound(&frame) {
            Ok(text) => shared.telephony.lock().await.send(text).await,
            Err(e) => Err(e.into()),
        };

        match send_result {
            Ok(()) => {
                shared.keepalive_failures.store(0, Ordering::SeqCst);
                if shared.connection_state.get() == ConnectionState::Degraded {
                    shared.connection_state.set(ConnectionState::Active);
                    info!("session recovered from degraded state after a successful keep-alive send");
                }
            }
            Err(e) => {
                let failures = shared.keepalive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %e, failures, "keep-alive send failed");
                if failures >= failures_before_degraded {
                    shared.connection_state.set(ConnectionState::Degraded);
                    warn!("session degraded after consecutive keep-alive failures");
                }
            }
        }
    }
}

/// `timeout_guard` (C12): inactivity/max-duration watchdog. Only ever
/// reads the shared last-activity timestamp and writes the shared
/// timeout-reason cell; it never touches either socket directly (§5).
/// The two checks run on independent tickers, since an operator may want
/// to poll for inactivity far more often than for the overall call cap.
/// On trip it records which threshold fired (so the Session can speak a
/// language-matched exit line, §4.1 C12) and notifies the stop signal
/// exactly once.
async fn timeout_guard(
    shared: Arc<Shared>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
    stop_signal: Arc<tokio::sync::Notify>,
    inactivity_threshold_secs: u64,
    max_call_duration_secs: u64,
    inactivity_check_interval_secs: u64,
    duration_check_interval_secs: u64,
) {
    let started_at = Instant::now();
    let mut inactivity_ticker = tokio::time::interval(Duration::from_secs(inactivity_check_interval_secs.max(1)));
    let mut duration_ticker = tokio::time::interval(Duration::from_secs(duration_check_interval_secs.max(1)));
    loop {
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = inactivity_ticker.tick() => {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let last_activity = shared.last_activity_millis.load(Ordering::Relaxed);
                let idle_ms = now_millis().saturating_sub(last_activity);
                if idle_ms >= (inactivity_threshold_secs as i64) * 1000 {
                    trip(&shared, &stop_signal, TimeoutReason::Inactivity);
                    break;
                }
            }
            _ = duration_ticker.tick() => {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                if started_at.elapsed() >= Duration::from_secs(max_call_duration_secs) {
                    trip(&shared, &stop_signal, TimeoutReason::MaxDuration);
                    break;
                }
            }
        }
    }
}

fn trip(shared: &Arc<Shared>, stop_signal: &Arc<tokio::sync::Notify>, reason: TimeoutReason) {
    info!(?reason, "call-timeout guard tripped");
    *shared.timeout_reason.lock().unwrap() = Some(reason);
    stop_signal.notify_one();
}

/// Language-matched exit statement for the call-timeout guard (C12),
/// grounded in `original_source/call_timeout_manager.py`'s termination
/// message table.
pub fn timeout_exit_statement(language: &str, reason: TimeoutReason) -> &'static str {
    match (language.to_lowercase().as_str(), reason) {
        ("hindi", TimeoutReason::Inactivity) => "कॉल पर दो मिनट से अधिक समय से कोई गतिविधि नहीं हुई है। अब कॉल को डिस्कनेक्ट कर दिया जाएगा। कॉल करने के लिए धन्यवाद।",
        ("telugu", TimeoutReason::Inactivity) => "రెండు నిమిషాలకు పైగా కాల్‌లో ఎలాంటి స్పందన లేదు. కాల్ ఇప్పుడు డిస్‌కనెక్ట్ అవుతుంది. కాల్ చేసినందుకు ధన్యవాదాలు.",
        ("hindi", TimeoutReason::MaxDuration) => "क्षमा करें, अधिकतम कॉल अवधि 10 मिनट पूरी हो गई है, कॉल काटनी होगी। आपके समय के लिए धन्यवाद।",
        ("telugu", TimeoutReason::MaxDuration) => "క్షమించండి, గరిష్ట కాల్ వ్యవధి 10 నిమిషాలు మించిపోయింది, కాల్‌ను కట్ చేయాల్సి వస్తోంది. మీ సమయానికి ధన్యవాదాలు.",
        (_, TimeoutReason::Inactivity) => "We haven't detected any activity on the call for over two minutes. The call will now be disconnected. Thank you for calling.",
        (_, TimeoutReason::MaxDuration) => "Sorry, maximum call duration exceeded, will need to cut the call. Thank you for your time.",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    Inactivity,
    MaxDuration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    fn tenant_with_prompt(prompt: &str) -> TenantConfig {
        let mut t = TenantConfig::fallback("acme");
        t.assistant_prompt = prompt.to_string();
        t.welcome_message = None;
        t
    }

    #[test]
    fn explicit_welcome_message_takes_priority() {
        let mut t = tenant_with_prompt("Say \"Namaste, welcome\" at the start.");
        t.welcome_message = Some("Custom greeting".to_string());
        assert_eq!(synthesize_greeting(&t), "Custom greeting");
    }

    #[test]
    fn extracts_namaste_quoted_opening_when_no_welcome_message() {
        let t = tenant_with_prompt(r#"You are a receptionist. Start every call with "Namaste! How can I help you today?" and be polite."#);
        assert_eq!(synthesize_greeting(&t), "Namaste! How can I help you today?");
    }

    #[test]
    fn extracts_greeting_keyword_quoted_string() {
        let t = tenant_with_prompt(r#"Use this greeting: "Hi there, thanks for calling!" every time."#);
        assert_eq!(synthesize_greeting(&t), "Hi there, thanks for calling!");
    }

    #[test]
    fn falls_back_to_hardcoded_greeting() {
        let t = tenant_with_prompt("You are a helpful assistant with no quoted lines.");
        assert_eq!(synthesize_greeting(&t), FALLBACK_GREETING);
    }

    #[test]
    fn timeout_exit_statement_matches_language() {
        assert!(timeout_exit_statement("hindi", TimeoutReason::Inactivity).contains("डिस्कनेक्ट"));
        assert!(timeout_exit_statement("english", TimeoutReason::MaxDuration).contains("maximum call duration"));
        assert!(timeout_exit_statement("unknown", TimeoutReason::Inactivity).contains("activity"));
    }

    #[test]
    fn initial_language_name_maps_greeting_language_prefix() {
        let mut t = TenantConfig::fallback("acme");
        t.greeting_language = "hi-IN".to_string();
        assert_eq!(initial_language_name(&t), "hindi");
        t.greeting_language = "te-IN".to_string();
        assert_eq!(initial_language_name(&t), "telugu");
        t.greeting_language = "en-IN".to_string();
        assert_eq!(initial_language_name(&t), "english");
    }

    #[test]
    fn detect_language_classifies_by_script() {
        assert_eq!(detect_language("नमस्ते, मैं ठीक हूँ"), Some("hindi"));
        assert_eq!(detect_language("నమస్కారం, నేను బాగున్నాను"), Some("telugu"));
        assert_eq!(detect_language("Hello, I am doing fine"), None);
    }

    #[test]
    fn connection_state_cell_round_trips_and_degrades() {
        let cell = ConnectionStateCell::new(ConnectionState::Active);
        assert_eq!(cell.get(), ConnectionState::Active);
        cell.set(ConnectionState::Degraded);
        assert_eq!(cell.get(), ConnectionState::Degraded);
        cell.set(ConnectionState::Active);
        assert_eq!(cell.get(), ConnectionState::Active);
    }

    struct FakeSource {
        frames: StdMutex<VecDeque<String>>,
    }

    #[async_trait]
    impl TelephonySource for FakeSource {
        async fn recv(&mut self) -> Option<anyhow::Result<String>> {
            self.frames.lock().unwrap().pop_front().map(Ok)
        }
    }

    #[tokio::test]
    async fn await_start_frame_extracts_identity_and_tenant_override() {
        let mut source: Box<dyn TelephonySource> = Box::new(FakeSource {
            frames: StdMutex::new(VecDeque::from(vec![
                r#"{"event":"connected"}"#.to_string(),
                r#"{"event":"start","start":{"stream_sid":"MZ1","call_sid":"CA1","account_sid":"AC1","custom_parameters":{"tenant":"bakery"}}}"#.to_string(),
            ])),
        });
        let outcome = await_start_frame(&mut source, 10).await.unwrap();
        assert_eq!(outcome.stream_sid, "MZ1");
        assert_eq!(outcome.call_sid, "CA1");
        assert_eq!(outcome.custom_parameters.unwrap().tenant.as_deref(), Some("bakery"));
    }

    #[tokio::test]
    async fn await_start_frame_times_out_when_socket_never_sends_start() {
        let mut source: Box<dyn TelephonySource> = Box::new(FakeSource { frames: StdMutex::new(VecDeque::new()) });
        let outcome = tokio::time::timeout(Duration::from_millis(200), await_start_frame(&mut source, 0)).await;
        assert!(outcome.is_ok());
        assert!(outcome.unwrap().is_none());
    }
}
