//! Web-search client exposed to synthesized code.
//!
//! The harness does not implement search itself; it only carries the
//! contract the bootstrap namespace promises: a client handle with a
//! `search(query)` method returning the provider's JSON response. The thin
//! implementation below speaks the Tavily-style POST interface and can be
//! pointed at any compatible endpoint.

use crate::promptloom::clients::common::get_shared_http_client;
use crate::promptloom::error::HarnessError;

/// Handle to a Tavily-compatible search API.
#[derive(Debug, Clone)]
pub struct SearchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SearchClient {
    pub fn new(api_key: &str) -> Self {
        Self::new_with_base_url(api_key, "https://api.tavily.com")
    }

    pub fn new_with_base_url(api_key: &str, base_url: &str) -> Self {
        SearchClient {
            http: get_shared_http_client().clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    /// Run one search and return the provider's JSON response verbatim.
    pub async fn search(&self, query: &str) -> Result<serde_json::Value, HarnessError> {
        let url = format!("{}/search", self.base_url);
        let body = serde_json::json!({
            "api_key": self.api_key,
            "query": query,
        });

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| HarnessError::LmUnavailable(format!("search transport: {}", err)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if log::log_enabled!(log::Level::Error) {
                log::error!("SearchClient::search(...): HTTP {}: {}", status, text);
            }
            return Err(HarnessError::LmUnavailable(format!(
                "search HTTP {} — {}",
                status, text
            )));
        }

        response
            .json()
            .await
            .map_err(|err| HarnessError::LmUnavailable(format!("search response: {}", err)))
    }
}
