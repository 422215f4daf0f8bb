//! HTTP client for the hosted WhatsApp API.
//!
//! Two reqwest clients: one carrying the bearer token for the provider, one
//! plain client used to fetch media from arbitrary source URLs. Media
//! uploads are cached per process, keyed by source URL.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::{DispatchError, Result};

pub const MESSAGES_PATH: &str = "/v1/messages";
const MEDIA_PATH: &str = "/v1/media";
const CONTACTS_PATH: &str = "/v1/contacts";

/// A completed media upload.
#[derive(Debug, Clone)]
pub struct MediaRecord {
    pub media_id: String,
    pub content_type: String,
}

#[derive(Debug, Clone)]
pub struct TurnApiConfig {
    pub base_url: Url,
    pub api_token: Option<String>,
    /// Total per-request timeout.
    pub timeout: Duration,
    /// Connection cap, matched to the outbound prefetch.
    pub concurrency: usize,
}

impl TurnApiConfig {
    /// Production configuration against `https://<api_host>`.
    pub fn new(api_host: &str, api_token: Option<String>) -> Result<Self> {
        let base_url = Url::parse(&format!("https://{api_host}"))
            .map_err(|e| DispatchError::Unrenderable(format!("invalid API host: {e}")))?;
        Ok(Self {
            base_url,
            api_token,
            timeout: Duration::from_secs(10),
            concurrency: 50,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

pub struct TurnApiClient {
    http: Client,
    media_http: Client,
    base_url: Url,
    media_cache: DashMap<String, MediaRecord>,
}

impl TurnApiClient {
    pub fn new(config: TurnApiConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        if let Some(token) = &config.api_token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| DispatchError::Unrenderable("API token is not a valid header".into()))?;
            default_headers.insert(AUTHORIZATION, value);
        }

        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.concurrency)
            .default_headers(default_headers)
            .build()?;
        let media_http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.concurrency)
            .build()?;

        Ok(Self {
            http,
            media_http,
            base_url: config.base_url,
            media_cache: DashMap::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| DispatchError::Unrenderable(format!("invalid endpoint {path}: {e}")))
    }

    /// POST a rendered message payload. Non-2xx statuses come back as
    /// [`DispatchError::UpstreamStatus`] for the caller to classify.
    pub async fn post_message(
        &self,
        path: &str,
        headers: HeaderMap,
        body: &Value,
    ) -> Result<()> {
        let endpoint_label = if path.ends_with("/automation") {
            "/v1/messages/{id}/automation"
        } else {
            MESSAGES_PATH
        };
        let url = self.endpoint(path)?;

        let started = Instant::now();
        let response = self
            .http
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await?;
        metrics::histogram!(
            "whatsapp_api_request_latency_seconds",
            "endpoint" => endpoint_label
        )
        .record(started.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::UpstreamStatus {
                status: status.as_u16(),
            });
        }
        Ok(())
    }

    /// Resolve `media_url` to an uploaded media id, going through the
    /// per-process cache. On a miss the source bytes are fetched and passed
    /// through to the provider with the source's content type.
    pub async fn upload_media(&self, media_url: &str) -> Result<MediaRecord> {
        if let Some(record) = self.media_cache.get(media_url) {
            debug!(url = %media_url, "Media cache hit");
            return Ok(record.clone());
        }

        let source = self.media_http.get(media_url).send().await?;
        if !source.status().is_success() {
            return Err(DispatchError::MediaSource {
                url: media_url.to_string(),
                status: source.status().as_u16(),
            });
        }
        let content_type = source
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = source.bytes().await?;

        let started = Instant::now();
        let response = self
            .http
            .post(self.endpoint(MEDIA_PATH)?)
            .header(CONTENT_TYPE, &content_type)
            .body(bytes)
            .send()
            .await?;
        metrics::histogram!(
            "whatsapp_api_request_latency_seconds",
            "endpoint" => MEDIA_PATH
        )
        .record(started.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::UpstreamStatus {
                status: status.as_u16(),
            });
        }
        let payload: Value = response.json().await?;
        let media_id = payload["media"][0]["id"]
            .as_str()
            .ok_or_else(|| DispatchError::BadResponse("media upload returned no id".into()))?
            .to_string();

        let record = MediaRecord {
            media_id,
            content_type,
        };
        info!(url = %media_url, media_id = %record.media_id, "Uploaded media");
        self.media_cache
            .insert(media_url.to_string(), record.clone());
        Ok(record)
    }

    /// Probe the provider for a recipient. Returns whether the contact is
    /// valid for messaging.
    pub async fn check_contact(&self, msisdn: &str) -> Result<bool> {
        let body = json!({
            "blocking": "wait",
            "contacts": [format!("+{}", msisdn.trim_start_matches('+'))],
        });

        let started = Instant::now();
        let response = self
            .http
            .post(self.endpoint(CONTACTS_PATH)?)
            .json(&body)
            .send()
            .await?;
        metrics::histogram!(
            "whatsapp_api_request_latency_seconds",
            "endpoint" => CONTACTS_PATH
        )
        .record(started.elapsed().as_secs_f64());

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::UpstreamStatus {
                status: status.as_u16(),
            });
        }
        let payload: Value = response.json().await?;
        let contact_status = payload["contacts"][0]["status"]
            .as_str()
            .ok_or_else(|| DispatchError::BadResponse("contact check returned no status".into()))?;
        Ok(contact_status == "valid")
    }
}
