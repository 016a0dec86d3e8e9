//! Optional third-party IP geolocation, memoized per address for a whole run.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

pub const IPAPI_BASE_URL: &str = "https://ipapi.co";

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("geolocation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("geolocation service returned status {0}")]
    Status(u16),
    #[error("geolocation service error: {0}")]
    Service(String),
}

/// Something that can name the country an address is served from.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// Lower-case two-letter country code, or `None` when the service has no answer.
    async fn country_code(&self, ip: IpAddr) -> Result<Option<String>, GeoError>;
}

/// ipapi.co JSON endpoint (`/{ip}/json/`).
#[derive(Debug, Clone)]
pub struct IpApiLocator {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct IpApiResponse {
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    error: bool,
    #[serde(default)]
    reason: Option<String>,
}

impl IpApiLocator {
    pub fn new(timeout: Duration) -> Result<Self, GeoError> {
        Self::with_base_url(IPAPI_BASE_URL, timeout)
    }

    pub fn with_base_url(base_url: impl Into<String>, timeout: Duration) -> Result<Self, GeoError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("edge-scan-rs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GeoLocator for IpApiLocator {
    async fn country_code(&self, ip: IpAddr) -> Result<Option<String>, GeoError> {
        let url = format!("{}/{}/json/", self.base_url, ip);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(GeoError::Status(resp.status().as_u16()));
        }
        let body: IpApiResponse = resp.json().await?;
        if body.error {
            return Err(GeoError::Service(
                body.reason.unwrap_or_else(|| "unknown error".into()),
            ));
        }
        Ok(body
            .country_code
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty()))
    }
}

/// Per-address memo in front of a `GeoLocator`.
///
/// Each distinct address is looked up at most once, even when several tasks ask
/// concurrently; failures are remembered as `None`.
pub struct GeoCache {
    locator: Arc<dyn GeoLocator>,
    entries: Mutex<HashMap<IpAddr, Arc<OnceCell<Option<String>>>>>,
}

impl GeoCache {
    pub fn new(locator: Arc<dyn GeoLocator>) -> Self {
        Self {
            locator,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, ip: IpAddr) -> Option<String> {
        let cell = {
            let mut entries = self.entries.lock().await;
            entries.entry(ip).or_default().clone()
        };
        cell.get_or_init(|| async {
            match self.locator.country_code(ip).await {
                Ok(code) => code,
                Err(e) => {
                    debug!(%ip, "geolocation lookup failed: {e}");
                    None
                }
            }
        })
        .await
        .clone()
    }

    pub async fn cached_addresses(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl std::fmt::Debug for GeoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoCache").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLocator {
        calls: AtomicUsize,
        answer: Option<&'static str>,
    }

    #[async_trait]
    impl GeoLocator for CountingLocator {
        async fn country_code(&self, _ip: IpAddr) -> Result<Option<String>, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            match self.answer {
                Some(a) => Ok(Some(a.to_string())),
                None => Err(GeoError::Status(429)),
            }
        }
    }

    #[tokio::test]
    async fn concurrent_lookups_hit_service_once() {
        let locator = Arc::new(CountingLocator { calls: AtomicUsize::new(0), answer: Some("de") });
        let cache = Arc::new(GeoCache::new(locator.clone()));
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.lookup(ip).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().as_deref(), Some("de"));
        }
        assert_eq!(locator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_memoized() {
        let locator = Arc::new(CountingLocator { calls: AtomicUsize::new(0), answer: None });
        let cache = GeoCache::new(locator.clone());
        let ip = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));
        assert_eq!(cache.lookup(ip).await, None);
        assert_eq!(cache.lookup(ip).await, None);
        assert_eq!(locator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.cached_addresses().await, 1);
    }
}
