use reqwest::Url;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use super::UMA_DISCOVERY_PATH;
use crate::error::GatewayError;
use crate::transport::ResilientClient;

#[derive(Debug, Deserialize)]
struct UmaConfiguration {
    #[serde(default)]
    token_endpoint: String,
}

/// An Authorization Server keyed by its base URL, with its token endpoint once discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationServer {
    base_url: String,
    token_endpoint: String,
}

impl AuthorizationServer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token_endpoint: String::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn token_endpoint(&self) -> Option<&str> {
        Some(self.token_endpoint.as_str()).filter(|e| !e.is_empty())
    }

    fn discovery_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), UMA_DISCOVERY_PATH)
    }

    /// Token endpoint, fetched from the UMA discovery document on first use.
    ///
    /// Once resolved the value is kept for the lifetime of this server value.
    pub async fn fetch_token_endpoint(
        &mut self,
        transport: &ResilientClient,
    ) -> Result<String, GatewayError> {
        if let Some(endpoint) = self.token_endpoint() {
            return Ok(endpoint.to_string());
        }

        let url = self.discovery_url();
        let failed = |reason: String| GatewayError::DiscoveryFailed {
            url: url.clone(),
            reason,
        };

        let request = transport
            .client()
            .get(&url)
            .build()
            .map_err(|e| failed(e.to_string()))?;
        let response = transport
            .send(request, "uma discovery")
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("unexpected status {}", response.status())));
        }
        let document: UmaConfiguration = response
            .json()
            .await
            .map_err(|e| failed(format!("could not interpret json response: {e}")))?;
        if document.token_endpoint.is_empty() {
            return Err(failed("blank token endpoint".to_string()));
        }

        debug!(base_url = %self.base_url, token_endpoint = %document.token_endpoint, "discovered token endpoint");
        self.token_endpoint = document.token_endpoint;
        Ok(self.token_endpoint.clone())
    }
}

/// Process-lifetime cache of Authorization Servers, keyed by base URL.
///
/// Discovery runs outside the lock, so two first-time lookups of the same server may
/// both fetch; only the first stored entry is kept and both callers get it back.
#[derive(Debug)]
pub struct AuthServerRegistry {
    transport: Arc<ResilientClient>,
    servers: RwLock<HashMap<String, AuthorizationServer>>,
}

impl AuthServerRegistry {
    pub fn new(transport: Arc<ResilientClient>) -> Self {
        Self {
            transport,
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load(&self, base_url: &str) -> Option<AuthorizationServer> {
        self.servers.read().await.get(base_url).cloned()
    }

    pub async fn store(&self, server: AuthorizationServer) {
        info!(base_url = %server.base_url, "authorization server stored in the cache");
        self.servers
            .write()
            .await
            .insert(server.base_url.clone(), server);
    }

    /// Existing entry if one is present, else `server` is stored.
    /// The flag is true when the entry was loaded rather than stored.
    pub async fn load_or_store(&self, server: AuthorizationServer) -> (AuthorizationServer, bool) {
        let mut servers = self.servers.write().await;
        if let Some(existing) = servers.get(&server.base_url) {
            trace!(base_url = %existing.base_url, "using existing cache entry for authorization server");
            return (existing.clone(), true);
        }
        info!(base_url = %server.base_url, "authorization server stored in the cache");
        servers.insert(server.base_url.clone(), server.clone());
        (server, false)
    }

    /// Cached server for `base_url`, discovering its token endpoint on first sight.
    /// Failed discoveries are not cached.
    pub async fn resolve(&self, base_url: &str) -> Result<AuthorizationServer, GatewayError> {
        if let Some(server) = self.load(base_url).await {
            trace!(base_url, "authorization server cache hit");
            return Ok(server);
        }

        let valid = Url::parse(base_url)
            .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
            .unwrap_or(false);
        if !valid {
            return Err(GatewayError::AuthServerUnavailable(format!(
                "not a usable authorization server url: {base_url:?}"
            )));
        }

        let mut server = AuthorizationServer::new(base_url);
        server.fetch_token_endpoint(&self.transport).await?;
        let (server, _loaded) = self.load_or_store(server).await;
        Ok(server)
    }

    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.servers.read().await.is_empty()
    }
}
