//! Adapter for the PyPI registry.
//!
//! PyPI publishes no download counts and has no dependents API, so age
//! and version history carry more scoring weight here, topped up by the
//! trove classifiers (maturity, license, Python 3 support).
//!
//! Names are normalized per PEP 503: case-insensitive, with `_`, `-` and
//! `.` all equivalent; the canonical form is lowercase with `-`.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

use crate::adapters::{
    parse_github_url, score_age, score_version_count, EcosystemAdapter, PackageData,
    PopularPackage, RepoRef, VersionRecord,
};
use crate::anomalies::{growth, names, ownership, Anomaly};
use crate::cache::{DiskCache, TTL_METADATA};
use crate::http::{FetchError, HttpFetcher};
use crate::scoring::TrustSignal;
use crate::types::Ecosystem;

pub const PYPI_URL: &str = "https://pypi.org";

const AGE_MAX: i32 = 25;
const VERSION_COUNT_MAX: i32 = 20;
const LICENSE_BONUS: i32 = 5;
const PYTHON3_BONUS: i32 = 5;

/// Common squat targets on PyPI. The registry publishes no download
/// counts, so the list carries names only.
const POPULAR_PYPI: &[&str] = &[
    "requests", "flask", "django", "numpy", "pandas", "scipy", "boto3", "pytest", "setuptools",
    "pip", "urllib3", "certifi", "six", "python-dateutil", "pyyaml", "click", "jinja2",
    "cryptography", "sqlalchemy", "rich", "httpx", "pydantic", "pillow", "typing-extensions",
    "packaging",
];

/// Framework brands whose namespace attracts squatters
const MAGNET_NAMESPACES: &[&str] = &[
    "django", "flask", "pytest", "numpy", "pandas", "aws", "google", "azure", "openai",
];

/// Normalize a package name per PEP 503
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(['_', '.'], "-")
}

/// Client for the PyPI registry
pub struct PyPiAdapter {
    http: Arc<HttpFetcher>,
    cache: Arc<DiskCache>,
    base_url: String,
}

impl PyPiAdapter {
    pub fn new(http: Arc<HttpFetcher>, cache: Arc<DiskCache>, base_url: &str) -> Self {
        Self {
            http,
            cache,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn classifiers(data: &PackageData) -> Vec<String> {
        data.metadata["info"]["classifiers"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|c| c.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Maturity bonus from the development-status classifier
    fn maturity_signal(classifiers: &[String]) -> Option<TrustSignal> {
        if classifiers.iter().any(|c| c.contains("Development Status :: 7 - Inactive")) {
            return None;
        }

        let (points, label) = if classifiers.iter().any(|c| {
            c.contains("Development Status :: 5 - Production/Stable")
                || c.contains("Development Status :: 6 - Mature")
        }) {
            (10, "production/stable")
        } else if classifiers.iter().any(|c| c.contains("Development Status :: 4 - Beta")) {
            (5, "beta")
        } else if classifiers.iter().any(|c| c.contains("Development Status :: 3 - Alpha")) {
            (2, "alpha")
        } else {
            return None;
        };

        Some(TrustSignal::new(
            "maturity",
            points,
            format!("declared development status: {}", label),
        ))
    }

    fn maintainer(data: &PackageData) -> Option<String> {
        ["author", "maintainer"]
            .iter()
            .filter_map(|field| data.metadata["info"][field].as_str())
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .map(|s| s.to_string())
    }
}

/// Versions from the releases map: each release's timestamp is the first
/// file's upload time, and a release is yanked when every file is.
fn parse_releases(releases: &Value) -> Vec<VersionRecord> {
    let Some(map) = releases.as_object() else {
        return Vec::new();
    };

    map.iter()
        .map(|(version, files)| {
            let files = files.as_array().cloned().unwrap_or_default();
            let created_at = files
                .first()
                .and_then(|f| f["upload_time"].as_str())
                .and_then(parse_pypi_datetime);
            let yanked = !files.is_empty()
                && files.iter().all(|f| f["yanked"].as_bool().unwrap_or(false));

            VersionRecord {
                version: version.clone(),
                created_at,
                yanked,
            }
        })
        .collect()
}

/// PyPI timestamps are ISO 8601 without a timezone, assumed UTC
fn parse_pypi_datetime(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

impl EcosystemAdapter for PyPiAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::PyPi
    }

    async fn fetch_metadata(&self, name: &str) -> Result<Option<PackageData>, FetchError> {
        let normalized = normalize_name(name);
        let key = format!("meta:python:{}", normalized);
        let url = format!("{}/pypi/{}/json", self.base_url, normalized);
        let http = Arc::clone(&self.http);

        let value = self
            .cache
            .fetch(&key, TTL_METADATA, || async move { http.get_json(&url).await })
            .await?;

        let Some(value) = value else {
            return Ok(None);
        };

        let versions = parse_releases(&value["releases"]);
        Ok(Some(PackageData {
            metadata: value,
            versions,
            stdlib: false,
        }))
    }

    fn calculate_trust(&self, _name: &str, data: &PackageData, now: DateTime<Utc>) -> Vec<TrustSignal> {
        let mut signals = Vec::new();

        if let Some(signal) = score_age(&data.versions, now, AGE_MAX) {
            signals.push(signal);
        }
        if let Some(signal) = score_version_count(&data.versions, VERSION_COUNT_MAX) {
            signals.push(signal);
        }

        let classifiers = Self::classifiers(data);
        if let Some(signal) = Self::maturity_signal(&classifiers) {
            signals.push(signal);
        }

        let has_license = data.metadata["info"]["license"]
            .as_str()
            .map(|l| !l.trim().is_empty())
            .unwrap_or(false)
            || classifiers.iter().any(|c| c.starts_with("License ::"));
        if has_license {
            signals.push(TrustSignal::new(
                "license",
                LICENSE_BONUS,
                "license declared".to_string(),
            ));
        }

        if classifiers.iter().any(|c| c.starts_with("Programming Language :: Python :: 3")) {
            signals.push(TrustSignal::new(
                "python3_support",
                PYTHON3_BONUS,
                "declares Python 3 support".to_string(),
            ));
        }

        signals
    }

    /// PyPI has no reverse-dependency API
    async fn fetch_dependents_count(&self, _name: &str) -> Result<Option<u64>, FetchError> {
        Ok(None)
    }

    async fn resolve_source_repo(
        &self,
        _name: &str,
        data: &PackageData,
    ) -> Result<Option<RepoRef>, FetchError> {
        let info = &data.metadata["info"];

        let from_project_urls = info["project_urls"].as_object().and_then(|urls| {
            ["Repository", "Source", "Source Code", "GitHub"]
                .iter()
                .filter_map(|key| urls.get(*key).and_then(|u| u.as_str()))
                .find_map(parse_github_url)
        });

        Ok(from_project_urls
            .or_else(|| info["home_page"].as_str().and_then(parse_github_url)))
    }

    async fn popular_packages(&self) -> Result<Vec<PopularPackage>, FetchError> {
        Ok(POPULAR_PYPI
            .iter()
            .map(|name| PopularPackage {
                name: name.to_string(),
                downloads: 0,
            })
            .collect())
    }

    async fn detect_anomalies(
        &self,
        name: &str,
        data: &PackageData,
        popular: &[PopularPackage],
        now: DateTime<Utc>,
    ) -> Vec<Anomaly> {
        let normalized = normalize_name(name);
        let mut findings = Vec::new();

        findings.extend(names::detect_typosquat(&normalized, None, popular));
        findings.extend(names::detect_homoglyph(&normalized, popular));
        findings.extend(names::detect_namespace_squat(
            &normalized,
            None,
            popular,
            MAGNET_NAMESPACES,
        ));
        findings.extend(growth::detect_version_spike(&data.versions, now));
        findings.extend(growth::detect_new_package(&data.versions, now));
        findings.extend(growth::detect_rapid_versioning(&data.versions, now));

        if let Some(maintainer) = Self::maintainer(data) {
            findings.extend(ownership::detect_ownership_change(
                &self.cache,
                Ecosystem::PyPi,
                &normalized,
                &maintainer,
                None,
            ));
        }

        findings
    }
}
