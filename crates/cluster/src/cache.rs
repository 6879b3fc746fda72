//! TTL cache in front of discovery.
//!
//! Entries expire on the injected clock; a lookup against an expired entry
//! triggers exactly one re-fetch. The fetch happens while the cache lock is
//! held, so concurrent misses for the same apiVersion coalesce into a
//! single in-flight discovery call.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::Mutex;
use tracing::debug;
use vigil_core::{Clock, ResourceMeta};

use crate::{CallError, DiscoveryClient};

pub const DEFAULT_TTL_MS: u64 = 3000;

struct CacheEntry {
    kinds: Vec<ResourceMeta>,
    inserted_ms: u64,
}

pub struct KindCache {
    discovery: Arc<dyn DiscoveryClient>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl KindCache {
    pub fn new(discovery: Arc<dyn DiscoveryClient>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(discovery, clock, DEFAULT_TTL_MS)
    }

    pub fn with_ttl(discovery: Arc<dyn DiscoveryClient>, clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        Self { discovery, clock, ttl_ms, entries: Mutex::new(HashMap::new()) }
    }

    /// All kinds served under an apiVersion, from cache when fresh.
    /// Discovery errors propagate unmodified.
    pub async fn resolve(&self, api_version: &str) -> Result<Vec<ResourceMeta>, CallError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(api_version) {
            let age = self.clock.now_millis().saturating_sub(entry.inserted_ms);
            if age <= self.ttl_ms {
                return Ok(entry.kinds.clone());
            }
        }
        self.fetch_locked(&mut entries, api_version).await
    }

    /// Look up one kind. A miss against fresh cache contents gets a single
    /// forced refresh, covering kinds created after the cache was filled.
    pub async fn resolve_kind(
        &self,
        api_version: &str,
        kind: &str,
    ) -> Result<Option<ResourceMeta>, CallError> {
        let kinds = self.resolve(api_version).await?;
        if let Some(meta) = kinds.iter().find(|m| m.kind == kind) {
            return Ok(Some(meta.clone()));
        }
        debug!(api_version, kind, "kind not in cached discovery, refreshing once");
        let kinds = {
            let mut entries = self.entries.lock().await;
            self.fetch_locked(&mut entries, api_version).await?
        };
        Ok(kinds.iter().find(|m| m.kind == kind).cloned())
    }

    async fn fetch_locked(
        &self,
        entries: &mut HashMap<String, CacheEntry>,
        api_version: &str,
    ) -> Result<Vec<ResourceMeta>, CallError> {
        counter!("vigil_discovery_fetches_total", 1u64);
        let kinds = self.discovery.list_resource_kinds(api_version).await?;
        entries.insert(
            api_version.to_string(),
            CacheEntry { kinds: kinds.clone(), inserted_ms: self.clock.now_millis() },
        );
        Ok(kinds)
    }
}
