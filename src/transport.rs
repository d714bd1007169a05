use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::error::FetchError;

pub const ACTIVITY_ACCEPT: &str =
    "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Retrieves the raw body behind a remote reference.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    max_response_bytes: u64,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("max_response_bytes", &self.max_response_bytes)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(
        user_agent: &str,
        timeout: Duration,
        max_response_bytes: u64,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            http,
            max_response_bytes,
        })
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        Self::new(
            &cfg.fetch.user_agent,
            Duration::from_millis(cfg.fetch.timeout_ms),
            cfg.fetch.max_response_bytes,
        )
    }

    pub fn build_request(&self, url: &str) -> Result<reqwest::Request, FetchError> {
        let url = Url::parse(url)
            .map_err(|e| FetchError::MalformedStructure(format!("invalid url {url}: {e}")))?;
        self.http
            .get(url)
            .header(ACCEPT, ACTIVITY_ACCEPT)
            .build()
            .map_err(|e| FetchError::MalformedStructure(e.to_string()))
    }
}

fn classify_status(status: StatusCode) -> Option<FetchError> {
    if status.is_success() {
        None
    } else if status.is_server_error() {
        Some(FetchError::RequestServer {
            status: status.as_u16(),
        })
    } else {
        Some(FetchError::RequestContent {
            status: status.as_u16(),
        })
    }
}

fn is_json_content_type(value: Option<&HeaderValue>) -> bool {
    match value.and_then(|v| v.to_str().ok()) {
        Some(ct) => ct.to_ascii_lowercase().contains("json"),
        // Servers that omit the header get the benefit of the doubt; parsing decides.
        None => true,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let request = self.build_request(url)?;
        debug!(url = %request.url(), "fetching remote object");
        let mut res = self
            .http
            .execute(request)
            .await
            .map_err(|e| FetchError::RequestNetwork(e.to_string()))?;

        if let Some(err) = classify_status(res.status()) {
            return Err(err);
        }
        if !is_json_content_type(res.headers().get(CONTENT_TYPE)) {
            let ct = res
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            return Err(FetchError::RequestResultNotJson(format!(
                "content-type {ct}"
            )));
        }

        let limit = self.max_response_bytes;
        if res.content_length().is_some_and(|len| len > limit) {
            return Err(FetchError::RequestResultSize { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = res
            .chunk()
            .await
            .map_err(|e| FetchError::RequestNetwork(e.to_string()))?
        {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(FetchError::RequestResultSize { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}
