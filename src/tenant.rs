//! Tenant Configuration Cache (C2).
//!
//! Keyed by tenant id. Loaded lazily: a cache miss performs a single
//! authoritative fetch against the persistence layer and memoizes the
//! result in a process-wide read-mostly map (§3, §9 "Tenant config
//! 'cache'"). Concurrent misses for the same tenant id coalesce into one
//! fetch via a singleflight-style in-flight map (§9 "Singleflight
//! tenant-cache coalescing"), the systems-language equivalent of Go's
//! `singleflight.Group`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{info, warn};

use crate::persistence::PersistenceClient;

/// Per-tenant attributes (§3 Data Model: Tenant Configuration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub branch_owner_phone: Option<String>,
    #[serde(default)]
    pub assistant_prompt: String,
    #[serde(default)]
    pub analyzer_prompt: String,
    #[serde(default)]
    pub allowed_call_types: Vec<String>,
    #[serde(default = "default_language")]
    pub greeting_language: String,
    #[serde(default)]
    pub welcome_message: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_language() -> String {
    "en-IN".to_string()
}

impl TenantConfig {
    /// A minimal, always-active default tenant used when no tenant-
    /// specific configuration has been provisioned yet, and as the
    /// fallback target of tenant resolution (§4.7).
    pub fn fallback(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            is_active: true,
            display_name: tenant_id.to_string(),
            branch_owner_phone: None,
            assistant_prompt: "You are a helpful phone assistant.".to_string(),
            analyzer_prompt: "Summarize this call transcript.".to_string(),
            allowed_call_types: vec!["Booking".to_string(), "Informational".to_string(), "Others".to_string()],
            greeting_language: default_language(),
            welcome_message: None,
        }
    }

    /// Invariant (§3): every active tenant has an assistant prompt and an
    /// allowed-call-types set of size >= 1.
    pub fn is_valid(&self) -> bool {
        !self.assistant_prompt.trim().is_empty() && !self.allowed_call_types.is_empty()
    }

    pub fn coerce_call_type(&self, candidate: &str) -> String {
        if self.allowed_call_types.iter().any(|t| t.eq_ignore_ascii_case(candidate)) {
            candidate.to_string()
        } else {
            "Others".to_string()
        }
    }
}

impl TryFrom<Value> for TenantConfig {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value)
    }
}

/// Process-wide read-mostly tenant cache (§9).
pub struct TenantCache {
    persistence: PersistenceClient,
    default_tenant_id: String,
    entries: RwLock<HashMap<String, Arc<TenantConfig>>>,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl TenantCache {
    pub fn new(persistence: PersistenceClient, default_tenant_id: String) -> Self {
        Self {
            persistence,
            default_tenant_id,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a tenant id to its configuration, populating the cache on
    /// miss. Returns `None` only when the tenant does not exist in
    /// persistence at all (distinct from "exists but inactive").
    pub async fn get(&self, tenant_id: &str) -> Option<Arc<TenantConfig>> {
        if let Some(existing) = self.entries.read().await.get(tenant_id).cloned() {
            return Some(existing);
        }
        self.fetch_coalesced(tenant_id).await
    }

    /// Whether `tenant_id` names a known, active tenant — used by the
    /// Bridge Server's tenant-resolution order (§4.7).
    pub async fn is_known_active(&self, tenant_id: &str) -> bool {
        matches!(self.get(tenant_id).await, Some(cfg) if cfg.is_active)
    }

    /// The configured default tenant, falling back to a synthesized
    /// minimal config if persistence has no row for it (§7: per-tenant
    /// configuration errors fall back rather than failing the process).
    pub async fn default_tenant(&self) -> Arc<TenantConfig> {
        self.get(&self.default_tenant_id)
            .await
            .unwrap_or_else(|| Arc::new(TenantConfig::fallback(&self.default_tenant_id)))
    }

    async fn fetch_coalesced(&self, tenant_id: &str) -> Option<Arc<TenantConfig>> {
        loop {
            let notify = {
                let mut in_flight = self.in_flight.lock().await;
                if let Some(existing) = in_flight.get(tenant_id) {
                    Some(existing.clone())
                } else {
                    in_flight.insert(tenant_id.to_string(), Arc::new(Notify::new()));
                    None
                }
            };

            match notify {
                Some(n) => {
                    n.notified().await;
                    if let Some(cached) = self.entries.read().await.get(tenant_id).cloned() {
                        return Some(cached);
                    }
                    // The winning fetch found nothing authoritative; loop
                    // once more in case of a race, otherwise give up.
                    continue;
                }
                None => return self.authoritative_fetch(tenant_id).await,
            }
        }
    }

    async fn authoritative_fetch(&self, tenant_id: &str) -> Option<Arc<TenantConfig>> {
        let result = self.persistence.fetch_tenant_config(tenant_id).await;
        let parsed = match result {
            Ok(Some(value)) => TenantConfig::try_from(value).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(tenant_id, error = %e, "tenant config fetch failed");
                None
            }
        };

        let resolved = parsed.map(Arc::new);
        if let Some(cfg) = &resolved {
            info!(tenant_id, "tenant config cached");
            self.entries.write().await.insert(tenant_id.to_string(), cfg.clone());
        }

        if let Some(notify) = self.in_flight.lock().await.remove(tenant_id) {
            notify.notify_waiters();
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_tenant_satisfies_invariant() {
        let cfg = TenantConfig::fallback("default");
        assert!(cfg.is_valid());
    }

    #[test]
    fn coerce_call_type_passes_through_allowed_values() {
        let cfg = TenantConfig::fallback("default");
        assert_eq!(cfg.coerce_call_type("Booking"), "Booking");
        assert_eq!(cfg.coerce_call_type("Spam"), "Others");
    }

    #[tokio::test]
    async fn concurrent_misses_for_same_tenant_see_one_authoritative_fetch() {
        // Without a live persistence server this exercises only the
        // coalescing control flow (both fall through to the same "no
        // rows" result), proving no deadlock on concurrent miss.
        let persistence = PersistenceClient::new("http://127.0.0.1:0".to_string(), "key".to_string());
        let cache = Arc::new(TenantCache::new(persistence, "default".to_string()));
        let a = cache.clone();
        let b = cache.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { a.get("acme").await }),
            tokio::spawn(async move { b.get("acme").await }),
        );
        assert!(r1.unwrap().is_none());
        assert!(r2.unwrap().is_none());
    }
}
