//! HTTP implementation of [`Fetcher`] on top of `reqwest`.
//!
//! Every request gets the client-wide timeout; timeouts, transport errors, non-2xx
//! statuses and undecodable bodies all map to [`Error::FetchFailed`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, error};

use crate::contract::{Fetcher, Headers, QueryParams, Response};
use crate::error::{Error, Result};
use crate::paginate::LINK_HEADER;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mugalyser/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::FetchFailed {
                url: String::new(),
                status: None,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }
}

fn fetch_failed(url: &str, status: Option<u16>, message: impl Into<String>) -> Error {
    Error::FetchFailed {
        url: url.to_string(),
        status,
        message: message.into(),
    }
}

// reqwest lowercases header names; the pagination contract looks up `Link`.
fn collect_headers(headers: &reqwest::header::HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let value = value.to_str().ok()?.to_string();
            let name = if name.as_str().eq_ignore_ascii_case(LINK_HEADER) {
                LINK_HEADER.to_string()
            } else {
                name.as_str().to_string()
            };
            Some((name, value))
        })
        .collect()
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, params: &QueryParams) -> Result<Response> {
        debug!(url, params = params.len(), "[FETCH] GET");
        let resp = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| {
                error!(error = ?e, url, timeout = e.is_timeout(), "[FETCH] Request failed");
                fetch_failed(url, e.status().map(|s| s.as_u16()), e.to_string())
            })?;

        let status = resp.status();
        let headers = collect_headers(resp.headers());
        let text = resp
            .text()
            .await
            .map_err(|e| fetch_failed(url, Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            error!(status = %status, url, body = %text, "[FETCH] Upstream returned error");
            return Err(fetch_failed(url, Some(status.as_u16()), text));
        }

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).map_err(|e| {
                fetch_failed(url, Some(status.as_u16()), format!("invalid JSON body: {e}"))
            })?
        };
        Ok(Response { headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn link_header_name_is_normalised() {
        let mut map = HeaderMap::new();
        map.insert("link", HeaderValue::from_static(r#"<u>; rel="next""#));
        map.insert("content-type", HeaderValue::from_static("application/json"));
        let headers = collect_headers(&map);
        assert_eq!(headers.get("Link").map(String::as_str), Some(r#"<u>; rel="next""#));
        assert!(headers.contains_key("content-type"));
    }

    #[tokio::test]
    async fn unreachable_host_is_fetch_failure() {
        let fetcher = HttpFetcher::new(Duration::from_millis(200)).unwrap();
        let err = fetcher
            .fetch("http://127.0.0.1:9/nothing", &QueryParams::new())
            .await
            .unwrap_err();
        assert!(err.is_fetch_failure());
    }
}
