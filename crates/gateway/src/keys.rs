//! Key-management backend client.
//!
//! Machine SSH keys are granted read access to a repository by registering
//! them as deploy keys.

use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use provis_core::config::KeysConfig;
use serde::{Deserialize, Serialize};

/// Somewhere machine keys are pushed to once they are accepted.
#[async_trait]
pub trait KeyBackend: Send + Sync {
    /// Register `key` under `title` (the machine id).
    async fn add_key(&self, title: &str, key: &str) -> GatewayResult<()>;
}

#[derive(Debug, Serialize)]
struct CreateDeployKeyRequest<'a> {
    title: &'a str,
    key: &'a str,
}

/// Deploy key as returned by the API.
#[derive(Debug, Deserialize)]
pub struct DeployKey {
    pub id: u64,
    pub title: String,
}

/// Repository deploy keys on a GitHub-compatible API.
#[derive(Clone)]
pub struct GithubDeployKeys {
    http: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
}

impl GithubDeployKeys {
    pub fn new(config: &KeysConfig) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("provisd/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::Internal(format!("building HTTP client: {e}")))?;
        Ok(Self::with_client(config, http))
    }

    pub fn with_client(config: &KeysConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            token: config.token.clone(),
        }
    }

    fn keys_url(&self) -> String {
        format!("{}/repos/{}/{}/keys", self.api_url, self.owner, self.repo)
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> GatewayResult<T> {
        let response = req
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| GatewayError::KeyBackend(e.to_string()))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::KeyBackend(format!(
                "API error ({status}): {body}"
            )));
        }
        serde_json::from_str(&body)
            .map_err(|e| GatewayError::KeyBackend(format!("invalid response: {e}")))
    }
}

#[async_trait]
impl KeyBackend for GithubDeployKeys {
    async fn add_key(&self, title: &str, key: &str) -> GatewayResult<()> {
        let request = CreateDeployKeyRequest {
            title,
            key: key.trim(),
        };
        let created: DeployKey = self
            .send_json(self.http.post(self.keys_url()).json(&request))
            .await?;
        tracing::info!(
            key_id = created.id,
            title = %created.title,
            repo = %format!("{}/{}", self.owner, self.repo),
            "deploy key added"
        );
        Ok(())
    }
}
