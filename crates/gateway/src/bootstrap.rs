//! Startup: datacenter discovery and state construction.

use crate::error::{GatewayError, GatewayResult};
use crate::keys::{GithubDeployKeys, KeyBackend};
use crate::state::AppState;
use anyhow::Context;
use provis_core::config::{AppConfig, CloudConfig, DirectoryConfig};
use provis_directory::{DirectoryCache, sources_for};
use provis_store::SqliteStore;
use std::collections::BTreeMap;
use std::sync::Arc;

/// HTTP client used against the cloud APIs.
pub fn cloud_client(config: &DirectoryConfig) -> GatewayResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .timeout(config.request_timeout())
        .build()
        .map_err(|e| GatewayError::Internal(format!("building HTTP client: {e}")))
}

/// Datacenter map (name -> API URL) for the account.
///
/// A static `datacenters` map is returned as is. Otherwise the bootstrap
/// endpoint is polled every `retry_delay` until it answers with a non-empty
/// map, or until `max_attempts` attempts have failed.
pub async fn discover_datacenters(
    http: &reqwest::Client,
    cloud: &CloudConfig,
    max_attempts: Option<u32>,
) -> GatewayResult<BTreeMap<String, String>> {
    if let Some(datacenters) = &cloud.datacenters {
        tracing::info!(count = datacenters.len(), "using configured datacenters");
        return Ok(datacenters.clone());
    }
    let Some(bootstrap_url) = cloud.bootstrap_url.as_deref() else {
        return Err(GatewayError::Discovery(
            "neither datacenters nor bootstrap_url configured".to_string(),
        ));
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let error = match fetch_datacenters(http, bootstrap_url, cloud).await {
            Ok(datacenters) if !datacenters.is_empty() => {
                tracing::info!(
                    count = datacenters.len(),
                    datacenters = ?datacenters.keys().collect::<Vec<_>>(),
                    "retrieved list of active datacenters"
                );
                return Ok(datacenters);
            }
            Ok(_) => "empty datacenter list".to_string(),
            Err(e) => e,
        };

        if max_attempts.is_some_and(|max| attempt >= max) {
            return Err(GatewayError::Discovery(format!(
                "giving up after {attempt} attempts: {error}"
            )));
        }
        tracing::warn!(
            attempt,
            error = %error,
            retry_in = ?cloud.retry_delay(),
            "could not retrieve datacenter list"
        );
        tokio::time::sleep(cloud.retry_delay()).await;
    }
}

async fn fetch_datacenters(
    http: &reqwest::Client,
    bootstrap_url: &str,
    cloud: &CloudConfig,
) -> Result<BTreeMap<String, String>, String> {
    let url = format!(
        "{}/{}/datacenters",
        bootstrap_url.trim_end_matches('/'),
        cloud.account
    );
    let mut req = http
        .get(&url)
        .header(reqwest::header::ACCEPT, "application/json");
    if let Some(token) = &cloud.api_token {
        req = req.bearer_auth(token);
    }
    let response = req.send().await.map_err(|e| e.to_string())?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(format!("API error ({status}): {body}"));
    }
    serde_json::from_str(&body).map_err(|e| format!("invalid response: {e}"))
}

/// Directory cache over one HTTP source per datacenter.
pub fn build_directory(
    config: &AppConfig,
    datacenters: &BTreeMap<String, String>,
) -> GatewayResult<DirectoryCache> {
    let sources = sources_for(datacenters, &config.cloud, &config.directory)
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    Ok(DirectoryCache::new(sources, &config.directory))
}

/// Key backend for `config.keys`, if one is configured.
pub fn build_key_backend(config: &AppConfig) -> GatewayResult<Option<Arc<dyn KeyBackend>>> {
    config
        .keys
        .as_ref()
        .map(|keys| GithubDeployKeys::new(keys).map(|b| Arc::new(b) as Arc<dyn KeyBackend>))
        .transpose()
}

/// Validate `config`, discover datacenters and open the database.
pub async fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    config.validate().context("invalid configuration")?;

    let http = cloud_client(&config.directory)?;
    let datacenters = discover_datacenters(&http, &config.cloud, None)
        .await
        .context("failed to discover datacenters")?;
    let directory = build_directory(&config, &datacenters)?;

    let store = SqliteStore::open(&config.storage)
        .await
        .context("failed to open database")?;
    tracing::info!(path = %config.storage.path.display(), "database open");

    let keys = build_key_backend(&config)?;
    Ok(AppState::new(config, Arc::new(store), directory, keys))
}
