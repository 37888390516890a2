//! Public IP and geolocation reporting
//!
//! Geolocation lookups are slow and rate limited, so results are cached in
//! the host's key/value store:
//! - inside the refresh window, the cached blob is resent with no network calls
//! - past it, the public IP is fetched; if it has not changed the cached blob
//!   is reused, otherwise the geolocation page is fetched and the cache
//!   updated
//!
//! Everything here is best effort. Failures are returned to the caller, which
//! logs them; the control connection never waits on this.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nodelink_proto::IpInfoReport;
use tracing::{debug, info};

use crate::agent::AgentError;
use crate::config::IpInfoConfig;
use crate::store::KeyValueStore;

pub const CACHED_IP_KEY: &str = "cached_ip";
pub const CACHED_IP_INFO_KEY: &str = "cached_ip_info";
pub const LAST_IP_CHECK_KEY: &str = "last_ip_check";

/// Longest textual IP address (IPv6 with embedded IPv4)
const MAX_IP_LEN: usize = 45;

const JSON_BLOCK_START: &str = "language-json\">";
const JSON_BLOCK_END: &str = "</code>";

/// External public-IP / geolocation service
#[async_trait]
pub trait IpLookup: Send + Sync {
    /// Caller's public IP as text
    async fn public_ip(&self) -> Result<String, AgentError>;

    /// Geolocation page for `ip`; the JSON block is extracted by the reporter
    async fn details_page(&self, ip: &str) -> Result<String, AgentError>;
}

/// [`IpLookup`] over plain HTTP GETs
#[derive(Debug, Clone)]
pub struct HttpIpLookup {
    client: reqwest::Client,
    ip_url: String,
    info_url_prefix: String,
}

impl HttpIpLookup {
    pub fn new(config: &IpInfoConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent("Mozilla/5.0")
            .build()?;
        Ok(Self {
            client,
            ip_url: config.ip_url.clone(),
            info_url_prefix: config.info_url_prefix.clone(),
        })
    }

    async fn get_text(&self, url: &str) -> Result<String, AgentError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::IpLookup(format!("{} returned HTTP {}", url, status.as_u16())));
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl IpLookup for HttpIpLookup {
    async fn public_ip(&self) -> Result<String, AgentError> {
        self.get_text(&self.ip_url).await
    }

    async fn details_page(&self, ip: &str) -> Result<String, AgentError> {
        let url = format!("{}{}", self.info_url_prefix, ip);
        self.get_text(&url).await
    }
}

/// Pull the JSON block out of the geolocation page and unescape it
pub fn extract_ip_info(page: &str) -> Option<String> {
    let start = page.find(JSON_BLOCK_START)? + JSON_BLOCK_START.len();
    let len = page[start..].find(JSON_BLOCK_END)?;
    Some(unescape_html(page[start..start + len].trim()))
}

fn unescape_html(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&#39;", "'")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Builds `ip_info` reports from the lookup service and the cache
pub struct IpInfoReporter {
    lookup: Arc<dyn IpLookup>,
    store: Arc<dyn KeyValueStore>,
    refresh_interval: Duration,
    node_id: String,
    device_id: String,
    device_model: String,
}

impl IpInfoReporter {
    pub fn new(
        lookup: Arc<dyn IpLookup>,
        store: Arc<dyn KeyValueStore>,
        refresh_interval: Duration,
        node_id: String,
        device_id: String,
        device_model: String,
    ) -> Self {
        Self {
            lookup,
            store,
            refresh_interval,
            node_id,
            device_id,
            device_model,
        }
    }

    /// Produce the report to send for this connection, if any
    pub async fn report(&self) -> Result<Option<IpInfoReport>, AgentError> {
        let now = now_millis();
        let last_check = self
            .store
            .get(LAST_IP_CHECK_KEY)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let cached_ip = self.store.get(CACHED_IP_KEY);
        let cached_info = self
            .store
            .get(CACHED_IP_INFO_KEY)
            .and_then(|v| serde_json::from_str::<serde_json::Value>(&v).ok());

        if let Some(info) = &cached_info {
            if now.saturating_sub(last_check) < self.refresh_interval.as_millis() as u64 {
                debug!("IP check within refresh window, sending cached info");
                return Ok(cached_ip.map(|ip| self.build(ip, None, None, info.clone())));
            }
        }

        let started = Instant::now();
        let ip = self.lookup.public_ip().await?.trim().to_string();
        let ip_fetch_ms = started.elapsed().as_millis() as u64;
        if ip.is_empty() || ip.len() > MAX_IP_LEN {
            return Err(AgentError::IpLookup(format!(
                "unexpected public IP response ({} bytes)",
                ip.len()
            )));
        }
        info!(ip = %ip, ip_fetch_ms, "Fetched public IP");
        self.store.set(LAST_IP_CHECK_KEY, &now.to_string())?;

        if let (Some(previous), Some(info)) = (&cached_ip, &cached_info) {
            if *previous == ip {
                debug!(ip = %ip, "IP unchanged, reusing cached info");
                return Ok(Some(self.build(ip, Some(ip_fetch_ms), Some(0), info.clone())));
            }
        }

        let started = Instant::now();
        let page = self.lookup.details_page(&ip).await?;
        let info_fetch_ms = started.elapsed().as_millis() as u64;

        let raw = extract_ip_info(&page)
            .ok_or_else(|| AgentError::IpLookup("geolocation block not found in page".to_string()))?;
        let info: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| AgentError::IpLookup(format!("invalid geolocation JSON: {}", e)))?;

        info!(ip = %ip, info_fetch_ms, "Fetched IP info");

        self.store.set(CACHED_IP_KEY, &ip)?;
        self.store.set(CACHED_IP_INFO_KEY, &raw)?;

        Ok(Some(self.build(ip, Some(ip_fetch_ms), Some(info_fetch_ms), info)))
    }

    fn build(
        &self,
        ip: String,
        ip_fetch_ms: Option<u64>,
        info_fetch_ms: Option<u64>,
        ip_info: serde_json::Value,
    ) -> IpInfoReport {
        IpInfoReport {
            node_id: self.node_id.clone(),
            device_id: self.device_id.clone(),
            device_model: self.device_model.clone(),
            ip,
            ip_fetch_ms,
            info_fetch_ms,
            ip_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const PAGE: &str = r#"<html><pre><code class="language-json">{
  &quot;ip&quot;: &quot;203.0.113.7&quot;,
  &quot;country_code&quot;: &quot;NL&quot;,
  &quot;as&quot;: &quot;AT&amp;T&quot;
}</code></pre></html>"#;

    struct MockLookup {
        ip: Mutex<String>,
        ip_calls: AtomicUsize,
        page_calls: AtomicUsize,
    }

    impl MockLookup {
        fn new(ip: &str) -> Arc<Self> {
            Arc::new(Self {
                ip: Mutex::new(ip.to_string()),
                ip_calls: AtomicUsize::new(0),
                page_calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> (usize, usize) {
            (
                self.ip_calls.load(Ordering::SeqCst),
                self.page_calls.load(Ordering::SeqCst),
            )
        }
    }

    #[async_trait]
    impl IpLookup for MockLookup {
        async fn public_ip(&self) -> Result<String, AgentError> {
            self.ip_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}\n", self.ip.lock().unwrap()))
        }

        async fn details_page(&self, _ip: &str) -> Result<String, AgentError> {
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PAGE.to_string())
        }
    }

    fn reporter(
        lookup: Arc<MockLookup>,
        store: Arc<MemoryStore>,
        refresh: Duration,
    ) -> IpInfoReporter {
        IpInfoReporter::new(
            lookup,
            store,
            refresh,
            "node-1".to_string(),
            "device-1".to_string(),
            "Pixel 8".to_string(),
        )
    }

    #[test]
    fn test_extract_ip_info() {
        let raw = extract_ip_info(PAGE).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["country_code"], "NL");
        assert_eq!(value["as"], "AT&T");

        assert_eq!(extract_ip_info("<html>nothing</html>"), None);
        assert_eq!(extract_ip_info("language-json\">{ unterminated"), None);
    }

    #[tokio::test]
    async fn test_first_fetch_then_cached_within_window() {
        let lookup = MockLookup::new("203.0.113.7");
        let store = Arc::new(MemoryStore::new());
        let reporter = reporter(lookup.clone(), store.clone(), Duration::from_secs(3600));

        let report = reporter.report().await.unwrap().unwrap();
        assert_eq!(report.ip, "203.0.113.7");
        assert_eq!(report.device_id, "device-1");
        assert_eq!(report.ip_info["country_code"], json!("NL"));
        assert!(report.info_fetch_ms.is_some());
        assert_eq!(lookup.calls(), (1, 1));
        assert_eq!(store.get(CACHED_IP_KEY).as_deref(), Some("203.0.113.7"));
        assert!(store.get(LAST_IP_CHECK_KEY).is_some());

        let report = reporter.report().await.unwrap().unwrap();
        assert_eq!(report.ip, "203.0.113.7");
        assert_eq!(report.ip_fetch_ms, None);
        assert_eq!(lookup.calls(), (1, 1));
    }

    #[tokio::test]
    async fn test_unchanged_ip_reuses_cached_info() {
        let lookup = MockLookup::new("203.0.113.7");
        let store = Arc::new(MemoryStore::new());
        let reporter = reporter(lookup.clone(), store, Duration::ZERO);

        reporter.report().await.unwrap();
        let report = reporter.report().await.unwrap().unwrap();
        assert_eq!(report.info_fetch_ms, Some(0));
        assert_eq!(lookup.calls(), (2, 1));

        *lookup.ip.lock().unwrap() = "198.51.100.1".to_string();
        let report = reporter.report().await.unwrap().unwrap();
        assert_eq!(report.ip, "198.51.100.1");
        assert_eq!(lookup.calls(), (3, 2));
    }

    #[tokio::test]
    async fn test_bad_ip_response_is_an_error() {
        let lookup = MockLookup::new("");
        let store = Arc::new(MemoryStore::new());
        let reporter = reporter(lookup.clone(), store.clone(), Duration::from_secs(3600));

        assert!(matches!(reporter.report().await, Err(AgentError::IpLookup(_))));
        assert_eq!(lookup.calls(), (1, 0));
        assert_eq!(store.get(CACHED_IP_KEY), None);
    }
}
