use std::sync::LazyLock;
use std::time::Duration;

use regex_lite::Regex;
use reqwest::header::{HeaderMap, ACCEPT, LINK};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cache::{ArtifactNames, VersionCache};
use crate::error::{DistError, Result};
use crate::version::K3sVersion;

/// Oldest k3s release the installer knows how to drive.
pub const MINIMUM_VERSION: &str = "1.15.0";

const RATE_LIMIT_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChannelList {
    data: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
struct Channel {
    name: String,
    latest: String,
}

/// The subset of a GitHub release object that matters here.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub assets: Vec<GithubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubAsset {
    pub name: String,
}

/// What [`process_release`] did with one release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// A new version (or a newer build of a known one) was recorded.
    Added,
    /// The exact version was already in the cache; older pages are known too.
    AlreadyKnown,
    /// Not usable on this architecture, too old, or not a release.
    Skipped,
}

// ---------------------------------------------------------------------------
// ReleaseClient
// ---------------------------------------------------------------------------

/// HTTP client for the k3s channel server and the GitHub releases API.
pub struct ReleaseClient {
    client: reqwest::Client,
    channels_url: String,
    releases_url: String,
    rate_limit_wait: Duration,
}

impl ReleaseClient {
    pub fn new(channels_url: String, releases_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("k3s-dist/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            channels_url,
            releases_url,
            rate_limit_wait: Duration::from_secs(1),
        })
    }

    /// Override the delay used after a rate-limited response.
    pub fn with_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetch the channel list, returning `(channel name, latest version)` pairs.
    /// Channels whose `latest` does not parse are dropped.
    pub async fn fetch_channels(&self) -> Result<Vec<(String, K3sVersion)>> {
        let resp = self.client.get(&self.channels_url).send().await?;
        if !resp.status().is_success() {
            return Err(DistError::Catalog(format!(
                "GET {} returned {}",
                self.channels_url,
                resp.status()
            )));
        }
        let list: ChannelList = resp.json().await?;
        let channels = list
            .data
            .into_iter()
            .filter_map(|ch| match K3sVersion::parse(&ch.latest) {
                Ok(version) => Some((ch.name, version)),
                Err(_) => {
                    debug!(channel = %ch.name, latest = %ch.latest, "ignoring channel");
                    None
                }
            })
            .collect();
        Ok(channels)
    }

    /// Walk the paginated release list, recording usable versions in `cache`.
    /// Paging stops after the first page that contains an already-known
    /// version.  Returns the number of versions added.
    pub async fn fetch_releases(
        &self,
        cache: &mut VersionCache,
        names: &ArtifactNames,
    ) -> Result<usize> {
        let minimum = K3sVersion::parse(MINIMUM_VERSION)?;
        let mut url = Some(self.releases_url.clone());
        let mut added = 0;

        while let Some(page_url) = url.take() {
            let (releases, next) = self.fetch_page(&page_url).await?;
            let mut seen_known = false;
            for release in &releases {
                match process_release(release, cache, names, &minimum) {
                    ReleaseOutcome::Added => added += 1,
                    ReleaseOutcome::AlreadyKnown => seen_known = true,
                    ReleaseOutcome::Skipped => {}
                }
            }
            if seen_known {
                debug!(url = %page_url, "reached known releases, stopping");
                break;
            }
            url = next;
        }

        info!(added, total = cache.len(), "k3s release catalog updated");
        Ok(added)
    }

    async fn fetch_page(&self, url: &str) -> Result<(Vec<GithubRelease>, Option<String>)> {
        let mut attempt = 0;
        loop {
            let resp = self
                .client
                .get(url)
                .header(ACCEPT, "application/vnd.github.v3+json")
                .send()
                .await?;
            let status = resp.status();

            if status == StatusCode::FORBIDDEN && is_rate_limited(resp.headers()) {
                attempt += 1;
                if attempt > RATE_LIMIT_RETRIES {
                    return Err(DistError::Catalog(format!("GET {} is rate limited", url)));
                }
                warn!(url, attempt, "rate limited by release server, waiting");
                tokio::time::sleep(self.rate_limit_wait).await;
                continue;
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(DistError::Catalog(format!(
                    "GET {} returned {}: {}",
                    url, status, body
                )));
            }

            let next = resp
                .headers()
                .get(LINK)
                .and_then(|v| v.to_str().ok())
                .and_then(next_link);
            let releases: Vec<GithubRelease> = resp.json().await?;
            return Ok((releases, next));
        }
    }
}

fn is_rate_limited(headers: &HeaderMap) -> bool {
    headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false)
}

/// Extract the `rel="next"` target from a `Link` header.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| {
            let p = p.trim();
            p == "rel=\"next\"" || p == "rel=next"
        });
        if !is_next {
            return None;
        }
        let url = target.strip_prefix('<')?.strip_suffix('>')?;
        Some(url.to_string())
    })
}

/// Decide whether `release` is installable and record it in `cache`.
///
/// Keeps only the highest `k3sN` build of each release.
pub fn process_release(
    release: &GithubRelease,
    cache: &mut VersionCache,
    names: &ArtifactNames,
    minimum: &K3sVersion,
) -> ReleaseOutcome {
    if release.draft || release.prerelease {
        return ReleaseOutcome::Skipped;
    }
    if !TAG_PATTERN.is_match(&release.tag_name) {
        debug!(tag = %release.tag_name, "skipping release with unexpected tag");
        return ReleaseOutcome::Skipped;
    }
    let version = match K3sVersion::parse(&release.tag_name) {
        Ok(v) => v,
        Err(_) => return ReleaseOutcome::Skipped,
    };
    if version.is_prerelease() || version.precedence(minimum) == std::cmp::Ordering::Less {
        return ReleaseOutcome::Skipped;
    }

    if let Some(existing) = cache.get(&version.short()) {
        if existing.version == version {
            return ReleaseOutcome::AlreadyKnown;
        }
        if existing.version > version {
            return ReleaseOutcome::Skipped;
        }
    }

    let has = |name: &str| release.assets.iter().any(|a| a.name == name);
    if !has(names.exe) || !has(names.checksum) || !names.images.iter().any(|n| has(n)) {
        debug!(tag = %release.tag_name, "release lacks assets for this architecture");
        return ReleaseOutcome::Skipped;
    }

    cache.insert(version);
    ReleaseOutcome::Added
}

static TAG_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v?[0-9.]+(?:-rc\d+)?\+k3s\d+$").expect("valid tag regex"));

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
