//! Fetch collaborator contract and its HTTP implementation.

use async_trait::async_trait;
use serde_json::Value;

use pal_store::PolicyBundle;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("policy server returned status {0}")]
    Status(u16),
    #[error("fetch request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// External network collaborator the reconciler fetches bundles from.
/// Retry/backoff, if any, lives behind this trait, not in the caller.
#[async_trait]
pub trait PolicyFetcher: Send + Sync {
    /// Fetch a bundle covering `directories`. `Ok(None)` is a valid
    /// result meaning "nothing to apply".
    async fn fetch_policy_bundle(
        &self,
        directories: &[String],
    ) -> Result<Option<PolicyBundle>, FetchError>;

    /// Fetch the base policy data snapshot.
    async fn fetch_base_data(&self) -> Result<Value, FetchError>;
}

pub struct HttpPolicyFetcher {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPolicyFetcher {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token,
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .get(format!("{}{}", self.base_url.trim_end_matches('/'), path));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }
}

#[async_trait]
impl PolicyFetcher for HttpPolicyFetcher {
    async fn fetch_policy_bundle(
        &self,
        directories: &[String],
    ) -> Result<Option<PolicyBundle>, FetchError> {
        let params: Vec<(&str, &str)> =
            directories.iter().map(|d| ("path", d.as_str())).collect();
        let resp = self.get("/policy").query(&params).send().await?;
        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }
        // The server answers null when nothing matched the requested dirs.
        let bundle: Option<PolicyBundle> = resp.json().await?;
        Ok(bundle)
    }

    async fn fetch_base_data(&self) -> Result<Value, FetchError> {
        let resp = self.get("/policy-data").send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }
}
