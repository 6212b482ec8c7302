//! Client for the external tool-registry HTTP service.
//!
//! The optional `search_registry_tools` / `get_server_install_info` core
//! tools consult this service. Responses are cached by URL with a TTL so a
//! chatty client does not hammer the registry.

use crate::config::RegistrySettings;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned HTTP {status}")]
    Status { status: u16 },

    #[error("invalid registry URL: {0}")]
    Url(#[from] url::ParseError),
}

/// TTL-cached GET client for the registry service.
pub struct RegistryClient {
    base_url: Url,
    ttl: Duration,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, (Instant, Value)>>,
}

impl RegistryClient {
    pub fn from_settings(settings: &RegistrySettings) -> Self {
        Self {
            base_url: settings.base_url.clone(),
            ttl: Duration::from_millis(settings.cache_ttl_ms),
            client: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Search the registry's tool index.
    pub async fn search_tools(&self, query: &str) -> Result<Value, RegistryError> {
        let mut url = self.base_url.join("tools")?;
        url.query_pairs_mut().append_pair("q", query);
        self.cached_get(url).await
    }

    /// Install metadata for one registry server.
    pub async fn install_info(&self, server: &str) -> Result<Value, RegistryError> {
        let url = self.base_url.join(&format!("servers/{server}"))?;
        self.cached_get(url).await
    }

    async fn cached_get(&self, url: Url) -> Result<Value, RegistryError> {
        let key = url.to_string();

        {
            let cache = self.cache.lock().await;
            if let Some((fetched_at, value)) = cache.get(&key)
                && fetched_at.elapsed() < self.ttl
            {
                debug!(url = %key, "registry cache hit");
                return Ok(value.clone());
            }
        }

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Status {
                status: response.status().as_u16(),
            });
        }
        let value: Value = response.json().await?;

        self.cache
            .lock()
            .await
            .insert(key, (Instant::now(), value.clone()));
        Ok(value)
    }

    #[cfg(test)]
    async fn prime_cache(&self, url: &Url, value: Value, age: Duration) {
        // An unrepresentable age is left out of the cache entirely; lookups
        // then miss, which the expiry test also accepts.
        if let Some(fetched_at) = Instant::now().checked_sub(age) {
            self.cache.lock().await.insert(url.to_string(), (fetched_at, value));
        }
    }
}
