//! Ecosystem adapters: one registry client per supported ecosystem behind
//! a uniform contract.
//!
//! Shared scoring helpers live here as free functions parameterized by the
//! ecosystem's maxima and tier cutoffs, so each adapter expresses only its
//! policy, not the arithmetic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::anomalies::Anomaly;
use crate::github::RepoFacts;
use crate::http::FetchError;
use crate::scoring::TrustSignal;
use crate::types::Ecosystem;

pub mod gomod;
pub mod pypi;
pub mod rubygems;

/// One published version of a package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    /// Publication timestamp, when the registry exposes one
    pub created_at: Option<DateTime<Utc>>,
    pub yanked: bool,
}

/// Everything an adapter learned about a package in one metadata fetch.
///
/// `metadata` is the ecosystem-native attribute bag; only the owning
/// adapter interprets it.
#[derive(Debug, Clone)]
pub struct PackageData {
    pub metadata: serde_json::Value,
    pub versions: Vec<VersionRecord>,
    /// Standard-library-equivalent module; short-circuits scoring
    pub stdlib: bool,
}

/// A source repository reference on the code host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

/// Entry in an ecosystem's popular-package list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopularPackage {
    pub name: String,
    /// Zero when the registry publishes no download counts
    #[serde(default)]
    pub downloads: u64,
}

/// The per-ecosystem registry contract.
///
/// Absence from `fetch_metadata` means the package does not exist in the
/// ecosystem; absence anywhere else means the signal is unavailable.
#[allow(async_fn_in_trait)]
pub trait EcosystemAdapter: Send + Sync {
    fn ecosystem(&self) -> Ecosystem;

    /// Canonical existence probe: metadata plus the version list
    async fn fetch_metadata(&self, name: &str) -> Result<Option<PackageData>, FetchError>;

    /// Basic-signal scoring from already-fetched metadata; no further
    /// network calls
    fn calculate_trust(&self, name: &str, data: &PackageData, now: DateTime<Utc>) -> Vec<TrustSignal>;

    /// Reverse-dependency count, where the registry has such an API
    async fn fetch_dependents_count(&self, name: &str) -> Result<Option<u64>, FetchError>;

    /// Extract (and if needed resolve) the source repository
    async fn resolve_source_repo(
        &self,
        name: &str,
        data: &PackageData,
    ) -> Result<Option<RepoRef>, FetchError>;

    /// The ecosystem's popular-package list, fetched once per scan and
    /// long-TTL cached
    async fn popular_packages(&self) -> Result<Vec<PopularPackage>, FetchError>;

    /// Ecosystem-specific pattern checks; the popular list is passed in
    /// so detectors never recompute it
    async fn detect_anomalies(
        &self,
        name: &str,
        data: &PackageData,
        popular: &[PopularPackage],
        now: DateTime<Utc>,
    ) -> Vec<Anomaly>;

    /// Stage-2 tier ladder: dependents count to points
    fn dependents_points(&self, count: u64) -> i32 {
        match count {
            c if c > 1000 => 10,
            c if c > 100 => 6,
            c if c > 10 => 3,
            _ => 0,
        }
    }

    /// Stage-3 star-tier ceiling
    fn source_host_stars_max(&self) -> i32 {
        10
    }

    /// Stage-3 bonus for organization-owned repositories
    fn source_host_org_bonus(&self) -> i32 {
        5
    }
}

/// Download tier cutoffs for ecosystems that publish counts
#[derive(Debug, Clone, Copy)]
pub struct DownloadTiers {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl Default for DownloadTiers {
    fn default() -> Self {
        Self {
            critical: 100_000_000,
            high: 10_000_000,
            medium: 1_000_000,
            low: 100_000,
        }
    }
}

/// Score total downloads against the tier ladder
pub fn score_downloads(downloads: u64, tiers: &DownloadTiers, max: i32) -> Option<TrustSignal> {
    let points = if downloads >= tiers.critical {
        max
    } else if downloads >= tiers.high {
        max * 2 / 3
    } else if downloads >= tiers.medium {
        max / 3
    } else if downloads >= tiers.low {
        max / 6
    } else {
        return None;
    };

    Some(TrustSignal::new(
        "downloads",
        points,
        format!("{} total downloads", downloads),
    ))
}

/// Score package age from the oldest version timestamp
pub fn score_age(versions: &[VersionRecord], now: DateTime<Utc>, max: i32) -> Option<TrustSignal> {
    let oldest = versions.iter().filter_map(|v| v.created_at).min()?;
    let age_days = now.signed_duration_since(oldest).num_days();

    let points = if age_days >= 730 {
        max
    } else if age_days >= 365 {
        max * 2 / 3
    } else if age_days >= 180 {
        max / 3
    } else {
        return None;
    };

    Some(TrustSignal::new(
        "package_age",
        points,
        format!("first published {} days ago", age_days),
    ))
}

/// Score the number of non-yanked releases
pub fn score_version_count(versions: &[VersionRecord], max: i32) -> Option<TrustSignal> {
    let count = versions.iter().filter(|v| !v.yanked).count();

    let points = if count > 20 {
        max
    } else if count > 10 {
        max * 2 / 3
    } else if count > 5 {
        max / 3
    } else {
        return None;
    };

    Some(TrustSignal::new(
        "version_count",
        points,
        format!("{} published versions", count),
    ))
}

/// Score source-host facts: a star tier plus an organization bonus
pub fn score_source_host(facts: &RepoFacts, stars_max: i32, org_bonus: i32) -> Vec<TrustSignal> {
    let mut signals = Vec::new();

    let star_points = if facts.stars >= 10_000 {
        stars_max
    } else if facts.stars >= 1_000 {
        stars_max * 2 / 3
    } else if facts.stars >= 100 {
        stars_max / 3
    } else {
        0
    };

    if star_points > 0 {
        signals.push(TrustSignal::new(
            "source_repo_stars",
            star_points,
            format!("{} repository stars", facts.stars),
        ));
    }

    if facts.owner_is_org && org_bonus > 0 {
        signals.push(TrustSignal::new(
            "source_repo_org",
            org_bonus,
            "repository owned by an organization".to_string(),
        ));
    }

    signals
}

/// Parse `https://github.com/{owner}/{repo}[...]` into a repo reference
pub fn parse_github_url(url: &str) -> Option<RepoRef> {
    let rest = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .strip_prefix("github.com/")?;

    let mut segments = rest.split('/').filter(|s| !s.is_empty());
    let owner = segments.next()?;
    let repo = segments.next()?.trim_end_matches(".git");

    if owner.is_empty() || repo.is_empty() {
        return None;
    }

    Some(RepoRef {
        owner: owner.to_string(),
        repo: repo.to_string(),
    })
}
