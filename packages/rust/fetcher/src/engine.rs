//! HTTP fetcher: resolves a source's adapter, downloads its payload, and
//! applies the watermark and per-source item cap.

use std::net::IpAddr;

use async_trait::async_trait;
use biothreat_shared::{DocumentCandidate, FetchConfig, ForecastError, Result, Source};
use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::SourceFetcher;
use crate::adapters::AdapterRegistry;

/// User-Agent string for fetch requests.
const USER_AGENT: &str = concat!("biothreat-forecaster/", env!("CARGO_PKG_VERSION"));

/// reqwest-backed [`SourceFetcher`].
pub struct HttpFetcher {
    config: FetchConfig,
    client: Client,
    registry: AdapterRegistry,
}

impl HttpFetcher {
    /// Create a fetcher with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self> {
        Self::with_registry(config, AdapterRegistry::new())
    }

    pub fn with_registry(config: FetchConfig, registry: AdapterRegistry) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ForecastError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            client,
            registry,
        })
    }

    async fn fetch_inner(
        &self,
        source: &Source,
        since: Option<DateTime<Utc>>,
    ) -> std::result::Result<Vec<DocumentCandidate>, String> {
        let adapter = self
            .registry
            .for_kind(source.kind)
            .ok_or_else(|| format!("no adapter for kind '{}'", source.kind))?;

        let url = adapter
            .request_url(source, self.config.max_items_per_source)
            .map_err(|e| e.to_string())?;

        if !self.config.allow_private_hosts && is_ssrf_target(&url) {
            return Err(format!("SSRF protection: blocked {url}"));
        }

        debug!(%url, adapter = adapter.name(), "fetching source");
        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    format!("timed out after {:?}", self.config.timeout)
                } else {
                    format!("request failed: {e}")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }

        let body = response
            .text()
            .await
            .map_err(|e| format!("body read failed: {e}"))?;

        let entries = adapter.parse(&body).map_err(|e| e.to_string())?;
        Ok(select_candidates(
            entries,
            since,
            self.config.max_items_per_source,
        ))
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    #[instrument(skip_all, fields(source = %source.name, kind = %source.kind))]
    async fn fetch(
        &self,
        source: &Source,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<DocumentCandidate>> {
        match self.fetch_inner(source, since).await {
            Ok(candidates) => {
                info!(count = candidates.len(), "source fetched");
                Ok(candidates)
            }
            Err(reason) => {
                warn!(%reason, "source unavailable");
                Err(ForecastError::source_unavailable(&source.name, reason))
            }
        }
    }
}

/// Drop entries at or before `since` (undated entries are kept), then cap.
pub(crate) fn select_candidates(
    entries: Vec<DocumentCandidate>,
    since: Option<DateTime<Utc>>,
    max_items: usize,
) -> Vec<DocumentCandidate> {
    entries
        .into_iter()
        .filter(|c| match (since, c.published_at) {
            (Some(mark), Some(published)) => published > mark,
            _ => true,
        })
        .take(max_items)
        .collect()
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a private/internal network (SSRF protection).
fn is_ssrf_target(url: &Url) -> bool {
    // Block non-HTTP schemes
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}
