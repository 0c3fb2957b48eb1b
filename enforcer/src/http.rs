//! HTTP client for identity fetches and authorization calls.

use std::time::Duration;

use serde_json::Value;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_IDLE: usize = 100;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// A thin wrapper over the shared connection pool: 10 s request
/// budget, bounded idle pool, redirects not followed.
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> Result<HttpClient, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(HttpClient { client })
    }

    /// GET a URL; returns the raw body and the HTTP status.
    pub async fn get(&self, url: &str) -> Result<(Vec<u8>, u16), reqwest::Error> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        Ok((body.to_vec(), status))
    }

    /// POST a JSON body; returns the parsed reply (when the body is
    /// non-empty, valid JSON) and the HTTP status.
    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
    ) -> Result<(Option<Value>, u16), reqwest::Error> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok((None, status));
        }
        Ok((serde_json::from_slice(&bytes).ok(), status))
    }
}
