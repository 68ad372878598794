// ============================================================================
// CONTROLLER API CLIENT
// ============================================================================
// Narrow interface to the controller's HTTP API plus a reqwest implementation:
// - classic controllers serve `/api/s/<site>/...`
// - UniFi-OS consoles serve the same API under `/proxy/network`
// - every response is a `{"meta": {"rc": ..}, "data": [..]}` envelope
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::COOKIE;
use reqwest::{Client as HttpClient, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use crate::config::ControllerConfig;
use crate::error::{CollectorError, CollectorResult};

/// Kind of appliance hosting the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Standalone network application
    #[default]
    Controller,
    /// UniFi-OS console (UDM, UCG, Cloud Key Gen2+)
    UnifiOs,
}

impl DeviceType {
    /// Prefix in front of every network application path.
    pub fn path_prefix(&self) -> &'static str {
        match self {
            DeviceType::Controller => "",
            DeviceType::UnifiOs => "/proxy/network",
        }
    }
}

// ----------------------------------------------------------------------------
// AppClient Trait
// ----------------------------------------------------------------------------

/// Read access to the controller API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AppClient: Send + Sync {
    /// Raw event records from the last `window_hours`.
    async fn get_events(&self, site: &str, window_hours: u32) -> CollectorResult<Vec<JsonValue>>;

    /// Raw alarm records.
    async fn get_alarms(&self, site: &str) -> CollectorResult<Vec<JsonValue>>;

    fn device_type(&self) -> DeviceType;

    fn base_url(&self) -> String;

    /// Value for the `Cookie` header of an established session.
    fn cookie_header(&self) -> Option<String>;
}

/// Everything the realtime listener needs to open a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub base_url: String,
    pub site: String,
    pub device_type: DeviceType,
    pub cookie: Option<String>,
    pub verify_tls: bool,
}

impl ConnectionParams {
    pub fn from_client(client: &dyn AppClient, site: impl Into<String>, verify_tls: bool) -> Self {
        Self {
            base_url: client.base_url(),
            site: site.into(),
            device_type: client.device_type(),
            cookie: client.cookie_header(),
            verify_tls,
        }
    }

    /// WebSocket URL of the site's event stream.
    pub fn stream_url(&self) -> CollectorResult<String> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            CollectorError::connection_failed(&self.base_url, format!("invalid base URL: {}", e))
        })?;
        let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
        url.set_scheme(scheme).map_err(|_| {
            CollectorError::connection_failed(&self.base_url, "cannot derive stream scheme")
        })?;
        url.set_path(&format!(
            "{}/wss/s/{}/events",
            self.device_type.path_prefix(),
            self.site
        ));
        url.set_query(None);
        Ok(url.to_string())
    }
}

// ----------------------------------------------------------------------------
// HTTP Implementation
// ----------------------------------------------------------------------------

/// Controller API client over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpAppClient {
    client: HttpClient,
    base_url: String,
    device_type: DeviceType,
    cookie: Option<String>,
    timeout: Duration,
}

impl HttpAppClient {
    pub fn new(config: &ControllerConfig) -> CollectorResult<Self> {
        let client = HttpClient::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .pool_max_idle_per_host(2)
            .gzip(true)
            .build()
            .map_err(|e| CollectorError::connection_failed(&config.base_url, e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            device_type: config.device_type,
            cookie: config.cookie.clone(),
            timeout: config.timeout,
        })
    }

    /// Path of a site-scoped API endpoint.
    pub fn api_path(&self, site: &str, endpoint: &str) -> String {
        format!("{}/api/s/{}/{}", self.device_type.path_prefix(), site, endpoint)
    }

    async fn fetch(&self, path: &str) -> CollectorResult<Vec<JsonValue>> {
        let url = format!("{}{}", self.base_url, path);
        trace!(target: "vigil::collector::api", url = %url, "Requesting");

        let mut request = self.client.get(&url);
        if let Some(cookie) = &self.cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CollectorError::timeout(path, self.timeout.as_millis() as u64)
            } else {
                CollectorError::connection_failed(&url, e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CollectorError::AuthenticationFailed {
                service: self.base_url.clone(),
                message: format!("controller returned {}", status),
            });
        }
        if !status.is_success() {
            return Err(CollectorError::invalid_response(
                path,
                format!("controller returned status {}", status),
            ));
        }

        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| CollectorError::invalid_response(path, format!("failed to parse JSON: {}", e)))?;

        let records = parse_envelope(path, &body)?;
        debug!(target: "vigil::collector::api", path = path, records = records.len(), "Fetched");
        Ok(records)
    }
}

#[async_trait]
impl AppClient for HttpAppClient {
    async fn get_events(&self, site: &str, window_hours: u32) -> CollectorResult<Vec<JsonValue>> {
        let path = format!("{}?within={}", self.api_path(site, "stat/event"), window_hours);
        self.fetch(&path).await
    }

    async fn get_alarms(&self, site: &str) -> CollectorResult<Vec<JsonValue>> {
        self.fetch(&self.api_path(site, "list/alarm")).await
    }

    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    fn cookie_header(&self) -> Option<String> {
        self.cookie.clone()
    }
}

/// Unwrap the controller's response envelope.
pub fn parse_envelope(channel: &str, body: &JsonValue) -> CollectorResult<Vec<JsonValue>> {
    let rc = body
        .get("meta")
        .and_then(|m| m.get("rc"))
        .and_then(|rc| rc.as_str());

    match rc {
        Some("ok") => {}
        Some(other) => {
            let msg = body
                .get("meta")
                .and_then(|m| m.get("msg"))
                .and_then(|m| m.as_str())
                .unwrap_or("no message");
            return Err(CollectorError::invalid_response(
                channel,
                format!("rc={} ({})", other, msg),
            ));
        }
        None => {
            return Err(CollectorError::invalid_response(channel, "missing meta.rc"));
        }
    }

    match body.get("data") {
        Some(JsonValue::Array(items)) => Ok(items.clone()),
        Some(_) => Err(CollectorError::invalid_response(channel, "data is not an array")),
        None => Ok(Vec::new()),
    }
}
