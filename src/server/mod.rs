//! Bridge Server (C10).
//!
//! Accepts the telephony provider's WebSocket connection, resolves the
//! calling tenant, and hands the socket off to a fresh [`Session`] (C5).
//! Tenant resolution order (§4.7): query parameter, then path segment,
//! then the `start` frame's `custom_parameters.tenant` (resolved inside
//! the Session once the start frame arrives), then the configured default
//! tenant.
//!
//! WebSocket listener policy (§4.7): periodic application-level ping with
//! a pong deadline, a bounded outbound queue, a maximum message size, and
//! a close deadline on shutdown drain.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Config, ServerConfig};
use crate::session::{Session, SessionClients, TelephonySink, TelephonySource};
use crate::tenant::TenantConfig;

#[derive(Clone)]
struct AppState {
    clients: Arc<SessionClients>,
    default_tenant: Arc<TenantConfig>,
    server_config: ServerConfig,
}

/// Bind and serve, optionally behind TLS if both `cert_path`/`key_path`
/// are given (mirrors the predecessor's `axum_server::tls_rustls` path).
pub async fn run(config: Arc<Config>, clients: Arc<SessionClients>, cert_path: Option<String>, key_path: Option<String>) -> Result<()> {
    let default_tenant = clients.tenant_cache.default_tenant().await;
    let state = AppState { clients, default_tenant, server_config: config.server.clone() };

    let base_path = config.server.ws_base_path.clone();
    let tenant_path = format!("{base_path}/{{tenant_id}}");

    let app = Router::new()
        .route(&base_path, get(ws_handler))
        .route(&tenant_path, get(ws_handler_with_tenant))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.bind_host, config.server.bind_port)
        .parse()
        .context("invalid bind address")?;

    match (cert_path, key_path) {
        (Some(cert), Some(key)) => {
            let cert_data = tokio::fs::read(&cert).await.context("failed to read TLS certificate")?;
            let key_data = tokio::fs::read(&key).await.context("failed to read TLS key")?;
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem(cert_data, key_data).await?;
            info!(%addr, "bridge server listening (tls)");
            axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
        }
        _ => {
            info!(%addr, "bridge server listening");
            let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind listener")?;
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, Query(params): Query<HashMap<String, String>>) -> Response {
    let tenant_hint = params.get("tenant").cloned();
    upgrade(ws, state, tenant_hint)
}

async fn ws_handler_with_tenant(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let tenant_hint = params.get("tenant").cloned().or(Some(tenant_id));
    upgrade(ws, state, tenant_hint)
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, tenant_hint: Option<String>) -> Response {
    let server_config = state.server_config.clone();
    ws.max_message_size(server_config.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state.clients, state.default_tenant, tenant_hint, server_config))
        .into_response()
}

/// What the writer task accepts, besides application text frames: control
/// frames driven by the ping loop.
enum RawOutbound {
    Text(String),
    Ping,
    Close,
}

/// [`TelephonySink`] that hands frames to the connection's single writer
/// task over a bounded channel, rather than touching the socket directly
/// — the ping loop shares the same funnel (§4.7 single writer per socket).
struct ChannelSink {
    tx: mpsc::Sender<RawOutbound>,
}

#[async_trait]
impl TelephonySink for ChannelSink {
    async fn send(&mut self, text: String) -> anyhow::Result<()> {
        self.tx
            .send(RawOutbound::Text(text))
            .await
            .map_err(|_| anyhow::anyhow!("outbound channel closed"))
    }

    async fn close(&mut self) {
        let _ = self.tx.send(RawOutbound::Close).await;
    }
}

/// [`TelephonySource`] that transparently swallows `Pong` frames, updating
/// the shared last-pong timestamp the ping loop watches (§4.7).
struct WsSource {
    stream: SplitStream<WebSocket>,
    last_pong_millis: Arc<AtomicI64>,
}

#[async_trait]
impl TelephonySource for WsSource {
    async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        loop {
            match self.stream.next().await {
                None => return None,
                Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
                Some(Ok(Message::Pong(_))) => {
                    self.last_pong_millis.store(now_millis(), Ordering::Relaxed);
                    continue;
                }
                Some(Ok(Message::Close(_))) => return None,
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(e.into())),
            }
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn handle_socket(
    socket: WebSocket,
    clients: Arc<SessionClients>,
    default_tenant: Arc<TenantConfig>,
    tenant_hint: Option<String>,
    server_config: ServerConfig,
) {
    let (raw_sink, raw_stream) = socket.split();
    let (tx, rx) = mpsc::channel::<RawOutbound>(server_config.max_queue);
    let last_pong_millis = Arc::new(AtomicI64::new(now_millis()));
    let stopped = Arc::new(AtomicBool::new(false));

    let writer_handle = tokio::spawn(writer_task(raw_sink, rx));
    let ping_handle = tokio::spawn(ping_task(
        tx.clone(),
        server_config.ping_interval_secs,
        last_pong_millis.clone(),
        server_config.pong_deadline_secs,
        stopped.clone(),
    ));

    let sink: Box<dyn TelephonySink> = Box::new(ChannelSink { tx });
    let source: Box<dyn TelephonySource> = Box::new(WsSource { stream: raw_stream, last_pong_millis });

    let session = Session::new(clients, default_tenant);
    if let Err(e) = session.run(source, sink, tenant_hint).await {
        warn!(error = %e, "session ended with an error");
    }

    stopped.store(true, Ordering::SeqCst);
    ping_handle.abort();
    if tokio::time::timeout(Duration::from_secs(server_config.close_deadline_secs), writer_handle).await.is_err() {
        warn!("writer task did not drain within the close deadline");
    }
}

async fn writer_task(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<RawOutbound>) {
    while let Some(item) = rx.recv().await {
        let result = match item {
            RawOutbound::Text(text) => sink.send(Message::Text(text.into())).await,
            RawOutbound::Ping => sink.send(Message::Ping(Vec::new().into())).await,
            RawOutbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "telephony socket write failed; ending writer task");
            break;
        }
    }
}

async fn ping_task(
    tx: mpsc::Sender<RawOutbound>,
    ping_interval_secs: u64,
    last_pong_millis: Arc<AtomicI64>,
    pong_deadline_secs: u64,
    stopped: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(ping_interval_secs.max(1)));
    loop {
        ticker.tick().await;
        if stopped.load(Ordering::SeqCst) {
            break;
        }
        if tx.send(RawOutbound::Ping).await.is_err() {
            break;
        }
        let idle_ms = now_millis().saturating_sub(last_pong_millis.load(Ordering::Relaxed));
        if idle_ms >= (pong_deadline_secs as i64) * 1000 {
            warn!(idle_ms, "pong deadline exceeded; closing telephony socket");
            let _ = tx.send(RawOutbound::Close).await;
            break;
        }
    }
}
