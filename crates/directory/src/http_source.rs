//! Datacenter API client backed by reqwest.

use crate::error::SourceError;
use crate::source::MachineSource;
use async_trait::async_trait;
use provis_core::Machine;
use provis_core::config::{CloudConfig, DirectoryConfig};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Machine listing endpoint of one datacenter.
///
/// Requests carry the connect and request timeouts from [`DirectoryConfig`];
/// a datacenter that does not answer in time fails that call.
#[derive(Clone)]
pub struct HttpMachineSource {
    name: String,
    base_url: String,
    account: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpMachineSource {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        account: impl Into<String>,
        token: Option<String>,
        config: &DirectoryConfig,
    ) -> Result<Self, SourceError> {
        let name = name.into();
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SourceError::new(&name, format!("building HTTP client: {e}")))?;
        Ok(Self::with_client(name, base_url, account, token, http))
    }

    pub fn with_client(
        name: impl Into<String>,
        base_url: impl Into<String>,
        account: impl Into<String>,
        token: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            name: name.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            account: account.into(),
            token,
            http,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `{base_url}/{account}/{segments..}`, each segment percent-encoded so
    /// caller-supplied ids stay inside their path segment.
    fn url(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| self.error(format!("invalid API URL {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| self.error(format!("invalid API URL {}", self.base_url)))?
            .pop_if_empty()
            .push(&self.account)
            .extend(segments);
        Ok(url)
    }

    fn error(&self, message: impl Into<String>) -> SourceError {
        SourceError::new(&self.name, message)
    }

    /// Send a GET and decode the JSON body. `Ok(None)` on 404.
    async fn get_json<T: DeserializeOwned>(
        &self,
        what: &str,
        segments: &[&str],
    ) -> Result<Option<T>, SourceError> {
        let mut req = self
            .http
            .get(self.url(segments)?)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| self.error(format!("{what}: {e}")))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response.text().await;
        if !status.is_success() {
            let body = body.unwrap_or_else(|e| format!("<unreadable body: {e}>"));
            return Err(self.error(format!("{what}: API error ({status}): {body}")));
        }
        let body = body.map_err(|e| self.error(format!("{what}: reading response: {e}")))?;
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| self.error(format!("{what}: invalid response: {e}")))
    }
}

#[async_trait]
impl MachineSource for HttpMachineSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self) -> Result<Vec<Machine>, SourceError> {
        let machines: Option<Vec<Machine>> = self.get_json("list machines", &["machines"]).await?;
        machines.ok_or_else(|| self.error("list machines: API error (404 Not Found)"))
    }

    async fn get(&self, id: &str) -> Result<Option<Machine>, SourceError> {
        // Dot segments are dropped when building the URL.
        if id.is_empty() || id == "." || id == ".." {
            return Err(self.error(format!("invalid machine id {id:?}")));
        }
        self.get_json(&format!("get machine {id}"), &["machines", id])
            .await
    }
}

/// Build one source per datacenter in `datacenters` (name -> API URL).
pub fn sources_for(
    datacenters: &BTreeMap<String, String>,
    cloud: &CloudConfig,
    config: &DirectoryConfig,
) -> Result<Vec<Arc<dyn MachineSource>>, SourceError> {
    datacenters
        .iter()
        .map(|(name, url)| {
            HttpMachineSource::new(
                name,
                url,
                &cloud.account,
                cloud.api_token.clone(),
                config,
            )
            .map(|source| Arc::new(source) as Arc<dyn MachineSource>)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_account_and_path() {
        let source = HttpMachineSource::with_client(
            "us-east-1",
            "https://us-east-1.api.example.com/",
            "ops",
            None,
            reqwest::Client::new(),
        );
        assert_eq!(
            source.url(&["machines", "abc"]).unwrap().as_str(),
            "https://us-east-1.api.example.com/ops/machines/abc"
        );
        assert_eq!(source.name(), "us-east-1");
    }

    #[test]
    fn test_url_keeps_base_path_and_escapes_ids() {
        let source = HttpMachineSource::with_client(
            "dc",
            "http://127.0.0.1:8080/cloudapi",
            "ops",
            None,
            reqwest::Client::new(),
        );
        assert_eq!(
            source.url(&["machines", "../keys"]).unwrap().as_str(),
            "http://127.0.0.1:8080/cloudapi/ops/machines/..%2Fkeys"
        );
        assert_eq!(
            source.url(&["machines", "a b?c#d"]).unwrap().as_str(),
            "http://127.0.0.1:8080/cloudapi/ops/machines/a%20b%3Fc%23d"
        );
    }

    #[tokio::test]
    async fn test_get_rejects_dot_segments() {
        let source = HttpMachineSource::with_client(
            "dc",
            "http://127.0.0.1:1",
            "ops",
            None,
            reqwest::Client::new(),
        );
        for id in ["", ".", ".."] {
            let err = source.get(id).await.unwrap_err();
            assert!(err.message.contains("invalid machine id"));
        }
    }
}
