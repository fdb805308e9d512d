//! Model registry and metadata provider.
//!
//! Two variants behind one tagged enum: a **static** provider backed by
//! the bundled YAML manifest, and a **dynamic** provider that overlays
//! periodically fetched metadata (prices, context windows, availability)
//! from a remote index. A failed fetch gracefully falls back to static
//! results; lookups never block on the network -- stale descriptors are
//! served while a refresh runs off the hot path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use conclave_types::{CouncilConfig, CouncilError, ModelDescriptor, Result};

/// Bundled manifest, compiled into the binary.
const BUNDLED_MANIFEST: &str = include_str!("../manifests/models.yaml");

/// How long dynamically fetched metadata stays fresh.
const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct Manifest {
    models: Vec<ModelDescriptor>,
}

/// Static provider over a fixed manifest.
#[derive(Debug, Clone)]
pub struct StaticRegistry {
    models: HashMap<String, ModelDescriptor>,
}

impl StaticRegistry {
    /// Parse a YAML manifest.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: Manifest =
            serde_yaml::from_str(yaml).map_err(|e| CouncilError::ConfigInvalid {
                reason: format!("model manifest: {e}"),
            })?;
        Ok(Self {
            models: manifest
                .models
                .into_iter()
                .map(|m| (m.id.clone(), m))
                .collect(),
        })
    }

    /// The manifest bundled with the engine.
    pub fn bundled() -> Self {
        Self::from_yaml(BUNDLED_MANIFEST).expect("bundled manifest is valid")
    }

    /// Look up one model.
    pub fn describe(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.models.get(model_id).cloned()
    }

    /// Every known descriptor.
    pub fn all(&self) -> Vec<ModelDescriptor> {
        let mut models: Vec<ModelDescriptor> = self.models.values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }
}

struct DynamicInner {
    index_url: String,
    ttl: Duration,
    http: reqwest::Client,
    fallback: StaticRegistry,
    cache: RwLock<Option<(Instant, HashMap<String, ModelDescriptor>)>>,
    refresh_in_flight: AtomicBool,
}

/// Dynamic provider that overlays a remote model index over the static
/// manifest.
#[derive(Clone)]
pub struct DynamicRegistry {
    inner: Arc<DynamicInner>,
}

impl DynamicRegistry {
    /// Create a dynamic provider fetching from `index_url`.
    pub fn new(index_url: impl Into<String>, fallback: StaticRegistry) -> Self {
        Self {
            inner: Arc::new(DynamicInner {
                index_url: index_url.into(),
                ttl: DEFAULT_TTL,
                http: reqwest::Client::new(),
                fallback,
                cache: RwLock::new(None),
                refresh_in_flight: AtomicBool::new(false),
            }),
        }
    }

    /// Override the freshness TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        // Arc is still unique right after construction.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.ttl = ttl;
        }
        self
    }

    /// Look up one model, never blocking on the network.
    pub async fn describe(&self, model_id: &str) -> Option<ModelDescriptor> {
        self.maybe_refresh().await;
        let cache = self.inner.cache.read().await;
        if let Some((_, ref models)) = *cache {
            if let Some(d) = models.get(model_id) {
                return Some(d.clone());
            }
        }
        drop(cache);
        self.inner.fallback.describe(model_id)
    }

    /// Every known descriptor: fetched entries overlaid on the manifest.
    pub async fn all(&self) -> Vec<ModelDescriptor> {
        self.maybe_refresh().await;
        let mut merged: HashMap<String, ModelDescriptor> = self
            .inner
            .fallback
            .all()
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        let cache = self.inner.cache.read().await;
        if let Some((_, ref models)) = *cache {
            for (id, d) in models {
                merged.insert(id.clone(), d.clone());
            }
        }
        let mut models: Vec<ModelDescriptor> = merged.into_values().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    /// Kick off a background refresh when the cache is stale. The
    /// caller is never blocked waiting for the fetch.
    async fn maybe_refresh(&self) {
        let stale = {
            let cache = self.inner.cache.read().await;
            match *cache {
                Some((fetched_at, _)) => fetched_at.elapsed() > self.inner.ttl,
                None => true,
            }
        };
        if !stale {
            return;
        }
        if self
            .inner
            .refresh_in_flight
            .swap(true, Ordering::AcqRel)
        {
            return; // another refresh is already running
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match fetch_index(&inner.http, &inner.index_url).await {
                Ok(models) => {
                    debug!(count = models.len(), "model index refreshed");
                    let mut cache = inner.cache.write().await;
                    *cache = Some((Instant::now(), models));
                }
                Err(e) => {
                    // Serve static results until a fetch succeeds.
                    warn!(error = %e, "model index fetch failed, serving static metadata");
                }
            }
            inner.refresh_in_flight.store(false, Ordering::Release);
        });
    }
}

async fn fetch_index(
    http: &reqwest::Client,
    url: &str,
) -> std::result::Result<HashMap<String, ModelDescriptor>, String> {
    let response = http
        .get(url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    let manifest: Manifest = response.json().await.map_err(|e| e.to_string())?;
    Ok(manifest
        .models
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect())
}

/// The metadata provider the engine injects into its components.
///
/// A runtime switch between the two variants, chosen once at startup by
/// [`MetadataProvider::from_config`]; there is no process-wide singleton.
#[derive(Clone)]
pub enum MetadataProvider {
    Static(StaticRegistry),
    Dynamic(DynamicRegistry),
}

impl MetadataProvider {
    /// Provider factory: static when offline or model intelligence is
    /// disabled, dynamic otherwise.
    pub fn from_config(config: &CouncilConfig) -> Self {
        let bundled = StaticRegistry::bundled();
        if config.offline || !config.model_intelligence_enabled {
            MetadataProvider::Static(bundled)
        } else {
            MetadataProvider::Dynamic(DynamicRegistry::new(
                "https://openrouter.ai/api/v1/models",
                bundled,
            ))
        }
    }

    /// Look up one model.
    pub async fn describe(&self, model_id: &str) -> Option<ModelDescriptor> {
        match self {
            MetadataProvider::Static(r) => r.describe(model_id),
            MetadataProvider::Dynamic(r) => r.describe(model_id).await,
        }
    }

    /// Every known descriptor.
    pub async fn all(&self) -> Vec<ModelDescriptor> {
        match self {
            MetadataProvider::Static(r) => r.all(),
            MetadataProvider::Dynamic(r) => r.all().await,
        }
    }
}

impl std::fmt::Debug for MetadataProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataProvider::Static(_) => f.write_str("MetadataProvider::Static"),
            MetadataProvider::Dynamic(r) => f
                .debug_struct("MetadataProvider::Dynamic")
                .field("index_url", &r.inner.index_url)
                .finish(),
        }
    }
}
