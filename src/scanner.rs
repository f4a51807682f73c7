//! Concurrent scan orchestration.
//!
//! One worker per package, bounded by a semaphore. Workers are internally
//! sequential: score, then (for low scorers) detect anomalies, then derive
//! the action. The only cross-worker coordination is the HTTP token bucket
//! and the sticky fatal-rate-limit flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::adapters::gomod::{GoModAdapter, DEPS_DEV_URL, GO_PROXY_URL};
use crate::adapters::pypi::{PyPiAdapter, PYPI_URL};
use crate::adapters::rubygems::{RubyGemsAdapter, RUBYGEMS_URL};
use crate::adapters::EcosystemAdapter;
use crate::anomalies::{Anomaly, Severity};
use crate::cache::DiskCache;
use crate::config::Config;
use crate::github::{GitHubClient, GITHUB_API};
use crate::http::{FetchError, HttpFetcher};
use crate::scoring::{self, TrustLevel, TrustResult};
use crate::types::{Ecosystem, PackageRef};

/// Scores below this run adapter-specific anomaly detection
const ANOMALY_GATE: i32 = 60;

/// Post-penalty score at or above which a package is verified
const VERIFIED_MIN: i32 = 60;

/// Post-penalty score below which flagged packages escalate toward BLOCK
const BLOCK_BELOW: i32 = 40;

/// Terminal disposition for one package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Verified,
    Warn,
    Block,
    NotFound,
}

impl Action {
    /// Sort rank, most severe first
    fn rank(&self) -> u8 {
        match self {
            Action::Block => 0,
            Action::NotFound => 1,
            Action::Warn => 2,
            Action::Verified => 3,
        }
    }
}

/// Terminal output for one package
#[derive(Debug, Clone, Serialize)]
pub struct PackageVerdict {
    pub package: PackageRef,
    pub trust: TrustResult,
    pub anomalies: Vec<Anomaly>,
    pub action: Action,
    /// Set when the worker failed unexpectedly; the action is WARN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate scan output
#[derive(Debug, Serialize)]
pub struct ScanSummary {
    pub total: usize,
    pub verified: usize,
    pub suspicious: usize,
    pub high_risk: usize,
    pub not_found: usize,
    /// True when a fatal rate limit stopped the scan early
    pub partial: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_notice: Option<String>,
    pub results: Vec<PackageVerdict>,
}

/// Registry endpoints; overridable for tests
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub rubygems: String,
    pub pypi: String,
    pub go_proxy: String,
    pub deps_dev: String,
    pub github_api: String,
    /// Test override routing vanity lookups through a mock server
    pub go_vanity_base: Option<String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            rubygems: RUBYGEMS_URL.to_string(),
            pypi: PYPI_URL.to_string(),
            go_proxy: GO_PROXY_URL.to_string(),
            deps_dev: DEPS_DEV_URL.to_string(),
            github_api: GITHUB_API.to_string(),
            go_vanity_base: None,
        }
    }
}

struct ScannerInner {
    github: GitHubClient,
    rubygems: RubyGemsAdapter,
    pypi: PyPiAdapter,
    gomod: GoModAdapter,
    profile: bool,
}

/// Drives a whole scan: services wiring, dispatch, aggregation
pub struct Scanner {
    inner: Arc<ScannerInner>,
    workers: usize,
}

impl Scanner {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        Self::with_endpoints(config, Endpoints::default())
    }

    pub fn with_endpoints(config: Config, endpoints: Endpoints) -> anyhow::Result<Self> {
        let github_host = authority_of(&endpoints.github_api)
            .ok_or_else(|| anyhow::anyhow!("invalid source-host API URL: {}", endpoints.github_api))?;

        let http = Arc::new(HttpFetcher::new(config.github_token.clone(), &github_host)?);
        let cache = Arc::new(match &config.cache_root {
            Some(root) => DiskCache::with_root(root.clone())?,
            None => DiskCache::new()?,
        });

        let inner = ScannerInner {
            github: GitHubClient::new(Arc::clone(&http), Arc::clone(&cache), &endpoints.github_api),
            rubygems: RubyGemsAdapter::new(Arc::clone(&http), Arc::clone(&cache), &endpoints.rubygems),
            pypi: PyPiAdapter::new(Arc::clone(&http), Arc::clone(&cache), &endpoints.pypi),
            gomod: GoModAdapter::new(
                Arc::clone(&http),
                Arc::clone(&cache),
                &endpoints.go_proxy,
                &endpoints.deps_dev,
                endpoints.go_vanity_base.clone(),
            ),
            profile: config.profile,
        };

        Ok(Self {
            inner: Arc::new(inner),
            workers: config.workers.max(1),
        })
    }

    /// Evaluate every package concurrently and aggregate the verdicts.
    ///
    /// Input is expected pre-deduplicated; unsupported ecosystems are
    /// filtered by the reference parser before reaching the scanner.
    pub async fn scan(&self, packages: Vec<PackageRef>) -> ScanSummary {
        let total = packages.len();
        let now = Utc::now();
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let fatal = Arc::new(AtomicBool::new(false));
        let notice: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let mut handles = Vec::with_capacity(total);
        for package in packages {
            let inner = Arc::clone(&self.inner);
            let semaphore = Arc::clone(&semaphore);
            let fatal = Arc::clone(&fatal);
            let notice = Arc::clone(&notice);
            let tracked = package.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                if fatal.load(Ordering::SeqCst) {
                    return None;
                }

                match process_package(&inner, &package, now).await {
                    Ok(verdict) => Some(verdict),
                    Err(err @ FetchError::RateLimitExhausted { .. }) => {
                        fatal.store(true, Ordering::SeqCst);
                        let mut notice = notice.lock().expect("notice lock poisoned");
                        notice.get_or_insert_with(|| err.to_string());
                        None
                    }
                }
            });
            handles.push((tracked, handle));
        }

        let mut results = Vec::with_capacity(total);
        for (package, handle) in handles {
            match handle.await {
                Ok(Some(verdict)) => results.push(verdict),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(package = %package, %err, "scan worker failed");
                    results.push(error_verdict(package, err.to_string()));
                }
            }
        }

        let partial = fatal.load(Ordering::SeqCst);
        if partial {
            tracing::warn!(
                completed = results.len(),
                total,
                "scan aborted early by source-host rate limit"
            );
        }

        aggregate(total, partial, notice.lock().ok().and_then(|n| n.clone()), results)
    }
}

async fn process_package(
    inner: &ScannerInner,
    package: &PackageRef,
    now: DateTime<Utc>,
) -> Result<PackageVerdict, FetchError> {
    match package.ecosystem {
        Ecosystem::RubyGems => evaluate_with(&inner.rubygems, inner, package, now).await,
        Ecosystem::PyPi => evaluate_with(&inner.pypi, inner, package, now).await,
        Ecosystem::GoModule => evaluate_with(&inner.gomod, inner, package, now).await,
    }
}

async fn evaluate_with<A: EcosystemAdapter>(
    adapter: &A,
    inner: &ScannerInner,
    package: &PackageRef,
    now: DateTime<Utc>,
) -> Result<PackageVerdict, FetchError> {
    let (mut trust, data) =
        scoring::evaluate(adapter, &inner.github, &package.name, now, inner.profile).await?;

    let mut anomalies = Vec::new();
    if trust.level != TrustLevel::NotFound && trust.score < ANOMALY_GATE {
        if let Some(data) = &data {
            let popular = adapter.popular_packages().await?;
            anomalies = adapter.detect_anomalies(&package.name, data, &popular, now).await;

            for anomaly in &anomalies {
                trust.score += anomaly.penalty();
            }
            trust.reclamp();
        }
    }

    let action = derive_action(&trust, &anomalies);
    Ok(PackageVerdict {
        package: package.clone(),
        trust,
        anomalies,
        action,
        error: None,
    })
}

/// Map the post-penalty score and anomaly severities to an action
fn derive_action(trust: &TrustResult, anomalies: &[Anomaly]) -> Action {
    if trust.level == TrustLevel::NotFound {
        return Action::NotFound;
    }
    if trust.score >= VERIFIED_MIN {
        return Action::Verified;
    }

    let has_high = anomalies.iter().any(|a| a.severity == Severity::High);
    let below_block = trust.score < BLOCK_BELOW;

    match (below_block, has_high) {
        (true, true) => Action::Block,
        (true, false) | (false, true) => Action::Warn,
        // Some ecosystems structurally score in [40, 60)
        (false, false) => Action::Verified,
    }
}

fn error_verdict(package: PackageRef, error: String) -> PackageVerdict {
    PackageVerdict {
        package,
        trust: TrustResult {
            score: 0,
            level: TrustLevel::Untrusted,
            breakdown: Vec::new(),
            stage: 1,
        },
        anomalies: Vec::new(),
        action: Action::Warn,
        error: Some(error),
    }
}

fn aggregate(
    total: usize,
    partial: bool,
    rate_limit_notice: Option<String>,
    mut results: Vec<PackageVerdict>,
) -> ScanSummary {
    results.sort_by(|a, b| {
        a.action
            .rank()
            .cmp(&b.action.rank())
            .then_with(|| a.package.name.cmp(&b.package.name))
    });

    let count = |action: Action| results.iter().filter(|v| v.action == action).count();

    ScanSummary {
        total,
        verified: count(Action::Verified),
        suspicious: count(Action::Warn),
        high_risk: count(Action::Block),
        not_found: count(Action::NotFound),
        partial,
        rate_limit_notice,
        results,
    }
}

/// `host[:port]` of a URL, for fatal-rate-limit host matching
fn authority_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
