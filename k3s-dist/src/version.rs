use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DistError, Result};

// ---------------------------------------------------------------------------
// K3sVersion
// ---------------------------------------------------------------------------

/// A k3s release version such as `v1.27.3+k3s1` or `v1.28.0-rc1+k3s2`.
///
/// Ordering follows semantic-version precedence (a release sorts after its
/// release candidates) and then the numeric `k3sN` build suffix, so sorting a
/// list puts the newest build of the newest release last.  Use
/// [`K3sVersion::precedence`] when build numbers must not matter.
#[derive(Debug, Clone)]
pub struct K3sVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Prerelease label without the leading `-` (e.g. `rc1`).
    pub pre: Option<String>,
    /// Numeric part of the `+k3sN` build suffix.
    pub build: Option<u64>,
    raw: String,
}

impl K3sVersion {
    /// Parse a version string; a leading `v` is optional.
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        let body = raw.strip_prefix('v').unwrap_or(raw);
        if body.is_empty() {
            return Err(DistError::InvalidVersion(input.to_string()));
        }

        let (core, build) = match body.split_once('+') {
            Some((core, build)) => (core, Some(build)),
            None => (body, None),
        };
        let (numbers, pre) = match core.split_once('-') {
            Some((numbers, pre)) if !pre.is_empty() => (numbers, Some(pre.to_string())),
            Some(_) => return Err(DistError::InvalidVersion(input.to_string())),
            None => (core, None),
        };

        let parts: Vec<&str> = numbers.split('.').collect();
        if parts.len() != 3 {
            return Err(DistError::InvalidVersion(input.to_string()));
        }
        let mut nums = [0u64; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| DistError::InvalidVersion(input.to_string()))?;
        }

        let build = match build {
            Some(b) => Some(parse_build(b).ok_or_else(|| DistError::InvalidVersion(input.to_string()))?),
            None => None,
        };

        Ok(Self {
            major: nums[0],
            minor: nums[1],
            patch: nums[2],
            pre,
            build,
            raw: raw.to_string(),
        })
    }

    /// The version as published upstream, e.g. `v1.27.3+k3s1`.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The user-facing version without `v` prefix or build suffix, e.g. `1.27.3`.
    pub fn short(&self) -> String {
        match &self.pre {
            Some(pre) => format!("{}.{}.{}-{}", self.major, self.minor, self.patch, pre),
            None => format!("{}.{}.{}", self.major, self.minor, self.patch),
        }
    }

    /// Whether this is a prerelease (release candidate, alpha, ...).
    pub fn is_prerelease(&self) -> bool {
        self.pre.is_some()
    }

    /// Semantic-version precedence, ignoring the build suffix.
    pub fn precedence(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| compare_pre(self.pre.as_deref(), other.pre.as_deref()))
    }

    /// `true` when `self` is strictly newer than `other` by precedence.
    pub fn newer_than(&self, other: &Self) -> bool {
        self.precedence(other) == Ordering::Greater
    }

    /// Numeric build, treating a missing suffix as zero.
    pub fn build_number(&self) -> u64 {
        self.build.unwrap_or(0)
    }
}

fn parse_build(build: &str) -> Option<u64> {
    let digits = build.strip_prefix("k3s")?;
    digits.parse().ok()
}

/// A release sorts after every prerelease of the same version; prerelease
/// labels compare by their trailing number when both have one (`rc2 < rc10`).
fn compare_pre(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let split = |s: &str| -> (String, Option<u64>) {
                let idx = s.trim_end_matches(|c: char| c.is_ascii_digit()).len();
                let (word, num) = s.split_at(idx);
                (word.to_string(), num.parse().ok())
            };
            let (aw, an) = split(a);
            let (bw, bn) = split(b);
            aw.cmp(&bw).then_with(|| an.cmp(&bn))
        }
    }
}

impl PartialEq for K3sVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for K3sVersion {}

impl PartialOrd for K3sVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for K3sVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.precedence(other)
            .then_with(|| self.build_number().cmp(&other.build_number()))
    }
}

impl fmt::Display for K3sVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for K3sVersion {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for K3sVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for K3sVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        K3sVersion::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// VersionEntry
// ---------------------------------------------------------------------------

/// One installable version plus the upstream channels that currently point at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: K3sVersion,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<String>,
}

impl VersionEntry {
    pub fn new(version: K3sVersion) -> Self {
        Self {
            version,
            channels: Vec::new(),
        }
    }
}

/// Sort channel labels: `stable` first, then words alphabetically, then
/// `vX.Y` branch channels.
pub fn compare_channels(a: &str, b: &str) -> Ordering {
    let is_branch = |s: &str| {
        let rest = match s.strip_prefix('v') {
            Some(rest) => rest,
            None => return false,
        };
        let mut it = rest.splitn(3, '.');
        let major = it.next().unwrap_or("");
        let minor = it.next().unwrap_or("");
        let minor_digits: String = minor.chars().take_while(|c| c.is_ascii_digit()).collect();
        !major.is_empty()
            && major.chars().all(|c| c.is_ascii_digit())
            && !minor_digits.is_empty()
    };

    if a == "stable" || b == "stable" {
        return match (a == "stable", b == "stable") {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            _ => Ordering::Greater,
        };
    }
    match (is_branch(a), is_branch(b)) {
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
        _ => a.cmp(b),
    }
}

/// Pick the cached version closest to `desired`.
///
/// Only the highest build of each release is considered.  Returns the oldest
/// candidate that is at least as new as `desired`, or the newest candidate
/// when every cached version is older.
pub fn select_closest(desired: &K3sVersion, candidates: &[K3sVersion]) -> Result<K3sVersion> {
    if candidates.is_empty() {
        return Err(DistError::NoCachedVersions);
    }
    let mut sorted = candidates.to_vec();
    sorted.sort();
    let highest_builds: Vec<K3sVersion> = sorted
        .iter()
        .enumerate()
        .filter(|(i, v)| match sorted.get(i + 1) {
            Some(next) => v.precedence(next) == Ordering::Less,
            None => true,
        })
        .map(|(_, v)| v.clone())
        .collect();

    let found = highest_builds
        .iter()
        .find(|v| v.precedence(desired) != Ordering::Less)
        .or_else(|| highest_builds.last())
        .cloned();
    found.ok_or(DistError::NoCachedVersions)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> K3sVersion {
        K3sVersion::parse(s).unwrap()
    }

    #[test]
    fn parse_full_tag() {
        let ver = v("v1.27.3+k3s1");
        assert_eq!((ver.major, ver.minor, ver.patch), (1, 27, 3));
        assert_eq!(ver.build, Some(1));
        assert_eq!(ver.raw(), "v1.27.3+k3s1");
        assert_eq!(ver.short(), "1.27.3");
        assert!(!ver.is_prerelease());
    }

    #[test]
    fn parse_release_candidate() {
        let ver = v("v1.28.0-rc1+k3s2");
        assert_eq!(ver.pre.as_deref(), Some("rc1"));
        assert_eq!(ver.build, Some(2));
        assert_eq!(ver.short(), "1.28.0-rc1");
    }

    #[test]
    fn parse_short_form() {
        let ver = v("1.25.0");
        assert_eq!(ver.build, None);
        assert_eq!(ver.short(), "1.25.0");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(K3sVersion::parse("").is_err());
        assert!(K3sVersion::parse("v1.2").is_err());
        assert!(K3sVersion::parse("v1.2.x").is_err());
        assert!(K3sVersion::parse("v1.2.3+rke2r1").is_err());
    }

    #[test]
    fn release_sorts_after_candidate() {
        assert!(v("v1.28.0+k3s1") > v("v1.28.0-rc1+k3s1"));
        assert!(v("v1.28.0-rc10+k3s1") > v("v1.28.0-rc2+k3s1"));
    }

    #[test]
    fn build_breaks_ties_but_not_precedence() {
        let a = v("v1.27.3+k3s1");
        let b = v("v1.27.3+k3s2");
        assert!(b > a);
        assert_eq!(a.precedence(&b), Ordering::Equal);
        assert!(!b.newer_than(&a));
        assert!(v("v1.27.4+k3s1").newer_than(&b));
    }

    #[test]
    fn channels_sort_stable_first() {
        let mut channels = vec!["v1.27", "testing", "latest", "stable", "v1.26"];
        channels.sort_by(|a, b| compare_channels(a, b));
        assert_eq!(channels, vec!["stable", "latest", "testing", "v1.26", "v1.27"]);
    }

    #[test]
    fn closest_prefers_oldest_newer_version() {
        let cached = vec![v("v1.25.3+k3s1"), v("v1.27.1+k3s1"), v("v1.26.2+k3s1")];
        let picked = select_closest(&v("v1.26.0+k3s1"), &cached).unwrap();
        assert_eq!(picked.raw(), "v1.26.2+k3s1");
    }

    #[test]
    fn closest_falls_back_to_newest() {
        let cached = vec![v("v1.25.3+k3s1"), v("v1.24.1+k3s1")];
        let picked = select_closest(&v("v1.27.0+k3s1"), &cached).unwrap();
        assert_eq!(picked.raw(), "v1.25.3+k3s1");
    }

    #[test]
    fn closest_keeps_highest_build() {
        let cached = vec![v("v1.26.2+k3s1"), v("v1.26.2+k3s3"), v("v1.26.2+k3s2")];
        let picked = select_closest(&v("v1.26.0+k3s1"), &cached).unwrap();
        assert_eq!(picked.raw(), "v1.26.2+k3s3");
    }

    #[test]
    fn closest_with_nothing_cached() {
        let err = select_closest(&v("v1.26.0+k3s1"), &[]).unwrap_err();
        assert!(matches!(err, DistError::NoCachedVersions));
    }

    #[test]
    fn serde_uses_raw_string() {
        let json = serde_json::to_string(&v("v1.27.3+k3s1")).unwrap();
        assert_eq!(json, "\"v1.27.3+k3s1\"");
        let back: K3sVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back.raw(), "v1.27.3+k3s1");
    }
}
