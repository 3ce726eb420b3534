//! Persistence Client (ADDED, §4.9).
//!
//! A typed async client over the four tables named in §6
//! (`tenant_configs`, `call_details`, `exotel_call_details`,
//! `notifications`), used by the tenant cache (C2), the transcript manager
//! (C6), the call-detail fetcher (C8) and the notification dispatcher
//! (C9). Grounded in the teacher's `reqwest`-based provider-client shape
//! (`messaging::telegram::TelegramClient`: one `reqwest::Client`, one
//! method per remote operation) generalized to a PostgREST-style backend
//! matching `examples/original_source/supabase_client.py`'s
//! `table(...).select(...).eq(...)` / `.insert(...)` / `.update(...)`
//! shape. One client is built at startup and cloned (cheap, `Arc`-backed)
//! into every Session, per §5's "Global clients" design note.

use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::PersistenceError;

#[derive(Clone)]
pub struct PersistenceClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Client,
    base_url: String,
    api_key: String,
}

impl PersistenceClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            inner: Arc::new(Inner {
                http: Client::new(),
                base_url: base_url.trim_end_matches('/').to_string(),
                api_key,
            }),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.inner.base_url, table)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("apikey", &self.inner.api_key)
            .header("Authorization", format!("Bearer {}", self.inner.api_key))
            .header("Content-Type", "application/json")
    }

    /// `tenant_configs` read, keyed by `tenant_id`. Returns `None` on a
    /// clean "no rows" result rather than an error (cache-miss path, C2).
    pub async fn fetch_tenant_config(&self, tenant_id: &str) -> Result<Option<Value>, PersistenceError> {
        let url = self.table_url("tenant_configs");
        let resp = self
            .authed(self.inner.http.get(&url))
            .query(&[("tenant_id", format!("eq.{tenant_id}")), ("select", "*".to_string())])
            .send()
            .await
            .map_err(|e| PersistenceError::Request(e.to_string()))?;
        let rows = decode_rows(resp).await?;
        Ok(rows.into_iter().next())
    }

    /// `call_details` insert (transcript finalization, C6). Returns the
    /// server-generated row id.
    pub async fn insert_call_detail(&self, row: &Value) -> Result<String, PersistenceError> {
        let id = self.insert_row("call_details", row).await?;
        Ok(id)
    }

    /// `call_details` update, keyed on `call_id` (post-call pipeline
    /// stages 1, 4, 6 — telephony metadata, analysis, token summary).
    pub async fn update_call_detail_by_call_id(&self, call_id: &str, patch: &Value) -> Result<(), PersistenceError> {
        let url = self.table_url("call_details");
        let resp = self
            .authed(self.inner.http.patch(&url))
            .query(&[("call_id", format!("eq.{call_id}"))])
            .json(patch)
            .send()
            .await
            .map_err(|e| PersistenceError::Request(e.to_string()))?;
        ensure_success(resp, call_id).await
    }

    /// `exotel_call_details` insert (telephony REST fetch, C8).
    pub async fn insert_exotel_call_detail(&self, row: &Value) -> Result<(), PersistenceError> {
        self.insert_row("exotel_call_details", row).await.map(|_| ())
    }

    /// Merge of `exotel_call_details` and `call_details` rows for a call
    /// id (§9 "two-table call-detail merge"): `exotel_call_details`
    /// fields take precedence for caller-identifying data so a later
    /// `call_details` write never blanks out a phone number.
    pub async fn fetch_merged_call_detail(&self, call_id: &str) -> Result<Value, PersistenceError> {
        let exotel = self.fetch_one("exotel_call_details", "call_id", call_id).await?;
        let call = self.fetch_one("call_details", "call_id", call_id).await?;
        let mut merged = serde_json::Map::new();
        if let Some(Value::Object(m)) = call {
            merged.extend(m);
        }
        if let Some(Value::Object(m)) = exotel {
            for (k, v) in m {
                merged.insert(k, v);
            }
        }
        Ok(Value::Object(merged))
    }

    async fn fetch_one(&self, table: &str, key: &str, value: &str) -> Result<Option<Value>, PersistenceError> {
        let url = self.table_url(table);
        let resp = self
            .authed(self.inner.http.get(&url))
            .query(&[(key, format!("eq.{value}")), ("select", "*".to_string())])
            .send()
            .await
            .map_err(|e| PersistenceError::Request(e.to_string()))?;
        let rows = decode_rows(resp).await?;
        Ok(rows.into_iter().next())
    }

    /// `notifications` insert, one row per dispatched message (C9).
    pub async fn insert_notification(&self, row: &Value) -> Result<(), PersistenceError> {
        self.insert_row("notifications", row).await.map(|_| ())
    }

    async fn insert_row(&self, table: &str, row: &Value) -> Result<String, PersistenceError> {
        let url = self.table_url(table);
        let resp = self
            .authed(self.inner.http.post(&url))
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await
            .map_err(|e| PersistenceError::Request(e.to_string()))?;
        let rows = decode_rows(resp).await?;
        let id = rows
            .first()
            .and_then(|r| r.get("id"))
            .map(|v| v.to_string())
            .unwrap_or_default();
        Ok(id)
    }
}

async fn decode_rows(resp: reqwest::Response) -> Result<Vec<Value>, PersistenceError> {
    let status = resp.status();
    let text = resp.text().await.map_err(|e| PersistenceError::Decode(e.to_string()))?;
    if !status.is_success() {
        warn!(%status, body = %text, "persistence request returned non-success status");
        return Err(PersistenceError::Request(format!("status {status}")));
    }
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(&text).map_err(|e| PersistenceError::Decode(e.to_string()))?;
    match value {
        Value::Array(items) => Ok(items),
        other => Ok(vec![other]),
    }
}

async fn ensure_success(resp: reqwest::Response, key: &str) -> Result<(), PersistenceError> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(PersistenceError::NoRowsAffected(key.to_string()));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        debug!(%status, body = %body, "persistence update failed");
        return Err(PersistenceError::Request(format!("status {status}")));
    }
    Ok(())
}
