//! Unified Cache - composition root
//!
//! Builds one cache per data domain, warms them from the catalog backend,
//! and tears them down on shutdown.

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use unified_cache::persistence::FileStorage;
use unified_cache::{CacheConfig, CacheValue, SetOptions, UnifiedCache};

/// A bookable tour or activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceRecord {
    id: u64,
    name: String,
    category_id: u64,
    price_cents: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Category {
    id: u64,
    name: String,
}

/// Caches owned by the application, one per domain.
struct Caches {
    services: UnifiedCache<Vec<ServiceRecord>>,
    categories: UnifiedCache<Category>,
}

impl Caches {
    fn build() -> anyhow::Result<Self> {
        Ok(Self {
            services: domain_cache("services")?,
            categories: domain_cache("categories")?,
        })
    }

    async fn destroy(&self) {
        self.services.destroy().await;
        self.categories.destroy().await;
    }
}

/// Builds the cache for `domain`, backed by a file when `CACHE_PERSISTENCE_DIR` is set.
fn domain_cache<V: CacheValue>(domain: &str) -> anyhow::Result<UnifiedCache<V>> {
    let config = CacheConfig::for_domain(domain);
    match std::env::var_os("CACHE_PERSISTENCE_DIR") {
        Some(dir) if config.enable_persistence => {
            let path = PathBuf::from(dir).join(format!("{}.json", domain));
            let storage = FileStorage::open(&path)
                .with_context(|| format!("opening cache storage at {}", path.display()))?;
            Ok(UnifiedCache::with_storage(config, Box::new(storage)))
        }
        _ => Ok(UnifiedCache::new(config)),
    }
}

// Stand-ins for the hosted catalog backend.
async fn fetch_category(key: String) -> anyhow::Result<Category> {
    let id: u64 = key
        .rsplit(':')
        .next()
        .and_then(|id| id.parse().ok())
        .with_context(|| format!("malformed category key '{}'", key))?;
    Ok(Category {
        id,
        name: format!("Category {}", id),
    })
}

async fn fetch_featured_services() -> anyhow::Result<Vec<ServiceRecord>> {
    Ok(vec![
        ServiceRecord {
            id: 1,
            name: "Harbour kayak tour".to_string(),
            category_id: 1,
            price_cents: 4_500,
        },
        ServiceRecord {
            id: 2,
            name: "Old town food walk".to_string(),
            category_id: 2,
            price_cents: 6_000,
        },
    ])
}

/// Main entry point.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Build one cache per domain from environment configuration
/// 3. Warm the caches through the deduplicating loader
/// 4. Wait for SIGINT/SIGTERM
/// 5. Destroy every cache
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "unified_cache=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting cache composition root");

    let caches = Caches::build()?;

    let report = caches
        .categories
        .preload((1..=3).map(|id| format!("category:{}", id)), fetch_category)
        .await;
    for (key, err) in &report.failed {
        warn!(key = %key, error = %err, "Category preload failed");
    }

    let featured = caches
        .services
        .get_or_set(
            "services:featured",
            fetch_featured_services,
            SetOptions::new().tags(["services"]),
        )
        .await?;
    info!(count = featured.len(), "Featured services cached");

    let services_stats = caches.services.stats().await;
    let categories_stats = caches.categories.stats().await;
    info!(stats = ?services_stats, "Services cache");
    info!(stats = ?categories_stats, "Categories cache");

    shutdown_signal().await;

    caches.destroy().await;
    info!("Shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
