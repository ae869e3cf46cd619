use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RANGE;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Probes stop looking past this build number.
pub const DEFAULT_MAX_SEARCH: u64 = 100;

const PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// One discovered patch step on the CDN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchInfo {
    pub from_build: u64,
    pub to_build: u64,
    pub url: String,
    pub is_full: bool,
}

/// Existence check against the CDN. Implementations must not download file
/// bodies.
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    /// Whether the URL answers 2xx.
    async fn exists(&self, url: &str) -> bool;
}

/// HEAD-first probe; falls back to a single-byte ranged GET for origins that
/// reject HEAD.
pub struct HttpProbeTransport {
    client: Client,
}

impl HttpProbeTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProbeTransport for HttpProbeTransport {
    async fn exists(&self, url: &str) -> bool {
        match self.client.head(url).send().await {
            // A status is a definitive answer either way; only a failed
            // request falls back to the ranged GET.
            Ok(response) => return response.status().is_success(),
            Err(e) => {
                log::debug!("HEAD {} failed ({e}), retrying with ranged GET", url);
            }
        }

        match self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                log::debug!("ranged GET {} failed: {e}", url);
                false
            }
        }
    }
}

/// Discovers the highest available base build and the next incremental patch
/// for a channel's CDN tree.
pub struct VersionProbe {
    base_url: String,
    transport: Arc<dyn ProbeTransport>,
    max_search: u64,
}

impl VersionProbe {
    /// `base_url` is the channel prefix produced by
    /// [`crate::cdn::channel_base_url`].
    pub fn new(base_url: String, transport: Arc<dyn ProbeTransport>) -> Self {
        Self {
            base_url,
            transport,
            max_search: DEFAULT_MAX_SEARCH,
        }
    }

    pub fn with_max_search(mut self, max_search: u64) -> Self {
        self.max_search = max_search.max(1);
        self
    }

    /// URL of the patch that transforms build `from` into build `to`.
    pub fn patch_url(&self, from: u64, to: u64) -> String {
        format!("{}{}/{}.pwr", self.base_url, from, to)
    }

    /// The incremental patch out of `current`, if published.
    pub async fn find_next_patch(&self, current: u64) -> Option<PatchInfo> {
        let url = self.patch_url(current, current + 1);
        if self.transport.exists(&url).await {
            Some(PatchInfo {
                from_build: current,
                to_build: current + 1,
                url,
                is_full: false,
            })
        } else {
            None
        }
    }

    /// The highest build with a full (`0 -> N`) payload, found by binary
    /// search over `[1, max_search]`.
    pub async fn find_latest_base(&self) -> Option<PatchInfo> {
        // Sanity probe: no 0/1.pwr means the tree is empty (or the channel
        // does not exist).
        if !self.transport.exists(&self.patch_url(0, 1)).await {
            return None;
        }

        // Largest N with 0/N.pwr present. 1 is known to exist.
        let mut lo = 1u64;
        let mut hi = self.max_search;
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.transport.exists(&self.patch_url(0, mid)).await {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        let url = self.patch_url(0, lo);
        Some(PatchInfo {
            from_build: 0,
            to_build: lo,
            url,
            is_full: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// CDN where exactly builds `0..=highest` exist, counting probes.
    struct FakeCdn {
        highest: u64,
        probes: Arc<AtomicU64>,
    }

    impl FakeCdn {
        fn new(highest: u64) -> Self {
            Self {
                highest,
                probes: Arc::new(AtomicU64::new(0)),
            }
        }
    }

    #[async_trait]
    impl ProbeTransport for FakeCdn {
        async fn exists(&self, url: &str) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            // Parse ".../<from>/<to>.pwr".
            let mut parts = url.rsplitn(3, '/');
            let to: u64 = parts
                .next()
                .unwrap()
                .trim_end_matches(".pwr")
                .parse()
                .unwrap();
            let from: u64 = parts.next().unwrap().parse().unwrap();
            from <= self.highest && to <= self.highest && from < to
        }
    }

    fn probe_with(highest: u64, max_search: u64) -> VersionProbe {
        VersionProbe::new(
            "https://cdn.example/windows/x64/release/".into(),
            Arc::new(FakeCdn::new(highest)),
        )
        .with_max_search(max_search)
    }

    #[test]
    fn patch_url_shape() {
        let probe = probe_with(1, 100);
        assert_eq!(
            probe.patch_url(6, 7),
            "https://cdn.example/windows/x64/release/6/7.pwr"
        );
    }

    #[tokio::test]
    async fn finds_exact_latest_base() {
        for highest in [1, 2, 7, 50, 99, 100] {
            let probe = probe_with(highest, 100);
            let info = probe.find_latest_base().await.unwrap();
            assert_eq!(info.to_build, highest, "highest={highest}");
            assert_eq!(info.from_build, 0);
            assert!(info.is_full);
        }
    }

    #[tokio::test]
    async fn empty_tree_yields_none() {
        let probe = VersionProbe::new(
            "https://cdn.example/r/".into(),
            Arc::new(FakeCdn::new(0)),
        );
        assert!(probe.find_latest_base().await.is_none());
    }

    #[tokio::test]
    async fn probe_count_is_logarithmic() {
        let transport = FakeCdn::new(37);
        let probes = transport.probes.clone();
        let probe = VersionProbe::new("https://cdn.example/r/".into(), Arc::new(transport))
            .with_max_search(100);

        let info = probe.find_latest_base().await.unwrap();
        assert_eq!(info.to_build, 37);

        // Sanity probe + ceil(log2(100)) search probes.
        let count = probes.load(Ordering::SeqCst);
        assert!(count <= 1 + 8, "used {count} probes");
    }

    #[tokio::test]
    async fn next_patch_present_and_absent() {
        let probe = probe_with(8, 100);
        let next = probe.find_next_patch(7).await.unwrap();
        assert_eq!(next.from_build, 7);
        assert_eq!(next.to_build, 8);
        assert!(!next.is_full);
        assert!(probe.find_next_patch(8).await.is_none());
    }
}
