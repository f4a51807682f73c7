//! Adapter for the RubyGems registry.
//!
//! RubyGems is the richest of the supported registries: it publishes
//! download counts, version timestamps and reverse dependencies, so every
//! scoring signal and every detector applies here.
//! API documentation: https://guides.rubygems.org/rubygems-org-api/

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::adapters::{
    parse_github_url, score_age, score_downloads, score_version_count, DownloadTiers,
    EcosystemAdapter, PackageData, PopularPackage, RepoRef, VersionRecord,
};
use crate::anomalies::{growth, names, ownership, Anomaly};
use crate::cache::{DiskCache, TTL_FACTS, TTL_METADATA};
use crate::http::{FetchError, HttpFetcher};
use crate::scoring::TrustSignal;
use crate::types::Ecosystem;

pub const RUBYGEMS_URL: &str = "https://rubygems.org";

const DOWNLOADS_MAX: i32 = 30;
const AGE_MAX: i32 = 15;
const VERSION_COUNT_MAX: i32 = 10;

/// Gems whose names are common squat targets. Their live download counts
/// are fetched once and the assembled list cached for a week.
const POPULAR_GEMS: &[&str] = &[
    "rails", "rake", "rack", "json", "bundler", "nokogiri", "rspec", "activesupport", "thor",
    "i18n", "sinatra", "puma", "devise", "sidekiq", "redis", "pg", "faraday", "rubocop",
    "minitest", "capybara", "pry", "webmock", "simplecov", "mail", "bootsnap",
];

/// Response for `GET /api/v1/versions/{gem}.json`
#[derive(Debug, Deserialize)]
struct GemVersionResponse {
    number: String,
    created_at: Option<String>,
}

/// Client for the RubyGems registry
pub struct RubyGemsAdapter {
    http: Arc<HttpFetcher>,
    cache: Arc<DiskCache>,
    base_url: String,
}

impl RubyGemsAdapter {
    pub fn new(http: Arc<HttpFetcher>, cache: Arc<DiskCache>, base_url: &str) -> Self {
        Self {
            http,
            cache,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch (or read back) the raw gem metadata document
    async fn gem_metadata(&self, name: &str) -> Result<Option<serde_json::Value>, FetchError> {
        let key = format!("meta:ruby:{}", name);
        let url = format!("{}/api/v1/gems/{}.json", self.base_url, name);
        let http = Arc::clone(&self.http);

        self.cache
            .fetch(&key, TTL_METADATA, || async move { http.get_json(&url).await })
            .await
    }

    async fn gem_versions(&self, name: &str) -> Result<Vec<VersionRecord>, FetchError> {
        let key = format!("versions:ruby:{}", name);
        let url = format!("{}/api/v1/versions/{}.json", self.base_url, name);
        let http = Arc::clone(&self.http);

        let value = self
            .cache
            .fetch(&key, TTL_FACTS, || async move { http.get_json(&url).await })
            .await?;

        let Some(value) = value else {
            return Ok(Vec::new());
        };

        let parsed: Vec<GemVersionResponse> = match serde_json::from_value(value) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(gem = name, %err, "unexpected version list shape");
                return Ok(Vec::new());
            }
        };

        Ok(parsed
            .into_iter()
            .map(|v| VersionRecord {
                version: v.number,
                created_at: v
                    .created_at
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc)),
                yanked: false,
            })
            .collect())
    }

    fn downloads(data: &PackageData) -> Option<u64> {
        data.metadata.get("downloads").and_then(|d| d.as_u64())
    }
}

impl EcosystemAdapter for RubyGemsAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::RubyGems
    }

    async fn fetch_metadata(&self, name: &str) -> Result<Option<PackageData>, FetchError> {
        let Some(metadata) = self.gem_metadata(name).await? else {
            return Ok(None);
        };
        let versions = self.gem_versions(name).await?;

        Ok(Some(PackageData {
            metadata,
            versions,
            stdlib: false,
        }))
    }

    fn calculate_trust(&self, _name: &str, data: &PackageData, now: DateTime<Utc>) -> Vec<TrustSignal> {
        let mut signals = Vec::new();

        if let Some(downloads) = Self::downloads(data) {
            if let Some(signal) = score_downloads(downloads, &DownloadTiers::default(), DOWNLOADS_MAX) {
                signals.push(signal);
            }
        }
        if let Some(signal) = score_age(&data.versions, now, AGE_MAX) {
            signals.push(signal);
        }
        if let Some(signal) = score_version_count(&data.versions, VERSION_COUNT_MAX) {
            signals.push(signal);
        }

        signals
    }

    async fn fetch_dependents_count(&self, name: &str) -> Result<Option<u64>, FetchError> {
        let key = format!("dependents:ruby:{}", name);
        let url = format!("{}/api/v1/gems/{}/reverse_dependencies.json", self.base_url, name);
        let http = Arc::clone(&self.http);

        let value = self
            .cache
            .fetch(&key, TTL_FACTS, || async move {
                let response = http.get_json(&url).await?;
                Ok(response.map(|v| json!(v.as_array().map(|a| a.len()).unwrap_or(0))))
            })
            .await?;

        Ok(value.and_then(|v| v.as_u64()))
    }

    async fn resolve_source_repo(
        &self,
        _name: &str,
        data: &PackageData,
    ) -> Result<Option<RepoRef>, FetchError> {
        let repo = ["source_code_uri", "homepage_uri"]
            .iter()
            .filter_map(|field| data.metadata.get(*field).and_then(|u| u.as_str()))
            .find_map(parse_github_url);

        Ok(repo)
    }

    async fn popular_packages(&self) -> Result<Vec<PopularPackage>, FetchError> {
        if let Some(cached) = self.cache.get("popular:ruby", TTL_FACTS) {
            if let Ok(list) = serde_json::from_value::<Vec<PopularPackage>>(cached) {
                return Ok(list);
            }
        }

        let mut list = Vec::with_capacity(POPULAR_GEMS.len());
        for name in POPULAR_GEMS {
            let downloads = self
                .gem_metadata(name)
                .await?
                .and_then(|meta| meta.get("downloads").and_then(|d| d.as_u64()))
                .unwrap_or(0);
            list.push(PopularPackage {
                name: name.to_string(),
                downloads,
            });
        }

        if let Ok(serialized) = serde_json::to_value(&list) {
            self.cache.set("popular:ruby", &serialized, TTL_FACTS);
        }
        Ok(list)
    }

    async fn detect_anomalies(
        &self,
        name: &str,
        data: &PackageData,
        popular: &[PopularPackage],
        now: DateTime<Utc>,
    ) -> Vec<Anomaly> {
        let downloads = Self::downloads(data);
        let mut findings = Vec::new();

        findings.extend(names::detect_typosquat(name, downloads, popular));
        findings.extend(names::detect_homoglyph(name, popular));
        findings.extend(names::detect_namespace_squat(name, downloads, popular, &[]));
        if let Some(downloads) = downloads {
            findings.extend(growth::detect_download_inflation(downloads, &data.versions, now));
        }
        findings.extend(growth::detect_version_spike(&data.versions, now));
        findings.extend(growth::detect_new_package(&data.versions, now));
        findings.extend(growth::detect_rapid_versioning(&data.versions, now));

        if let Some(authors) = data.metadata.get("authors").and_then(|a| a.as_str()) {
            findings.extend(ownership::detect_ownership_change(
                &self.cache,
                Ecosystem::RubyGems,
                name,
                authors,
                downloads,
            ));
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;
    use tempfile::tempdir;

    fn adapter(server: &MockServer, dir: &tempfile::TempDir) -> RubyGemsAdapter {
        let http = Arc::new(HttpFetcher::new(None, "api.github.com").unwrap());
        let cache = Arc::new(DiskCache::with_root(dir.path().to_path_buf()).unwrap());
        RubyGemsAdapter::new(http, cache, &server.base_url())
    }

    fn mock_gem(server: &MockServer, name: &str, downloads: u64) {
        let body = json!({
            "name": name,
            "downloads": downloads,
            "version": "7.1.0",
            "authors": "David Heinemeier Hansson",
            "info": "Full-stack web framework",
            "licenses": ["MIT"],
            "homepage_uri": format!("https://{}.example.org", name),
            "source_code_uri": format!("https://github.com/{}/{}", name, name),
        });
        server.mock(|when, then| {
            when.method("GET").path(format!("/api/v1/gems/{}.json", name));
            then.status(200).body(body.to_string());
        });
    }

    fn mock_versions(server: &MockServer, name: &str, entries: &[(&str, &str)]) {
        let body: Vec<_> = entries
            .iter()
            .map(|(number, created)| json!({"number": number, "created_at": created}))
            .collect();
        server.mock(|when, then| {
            when.method("GET").path(format!("/api/v1/versions/{}.json", name));
            then.status(200).body(json!(body).to_string());
        });
    }

    #[tokio::test]
    async fn test_fetch_metadata_found() {
        let server = MockServer::start();
        mock_gem(&server, "rails", 500_000_000);
        mock_versions(
            &server,
            "rails",
            &[
                ("7.1.0", "2023-10-05T00:00:00.000Z"),
                ("7.0.0", "2021-12-15T00:00:00.000Z"),
                ("6.0.0", "2019-08-16T00:00:00.000Z"),
            ],
        );

        let dir = tempdir().unwrap();
        let data = adapter(&server, &dir)
            .fetch_metadata("rails")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(data.metadata["downloads"], 500_000_000u64);
        assert_eq!(data.versions.len(), 3);
        assert!(data.versions[0].created_at.is_some());
        assert!(!data.stdlib);
    }

    #[tokio::test]
    async fn test_fetch_metadata_missing_gem() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/api/v1/gems/nonexistent-package-xyz.json");
            then.status(404);
        });

        let dir = tempdir().unwrap();
        let data = adapter(&server, &dir)
            .fetch_metadata("nonexistent-package-xyz")
            .await
            .unwrap();
        assert!(data.is_none());
    }

    #[tokio::test]
    async fn test_calculate_trust_established_gem() {
        let server = MockServer::start();
        mock_gem(&server, "rails", 500_000_000);
        mock_versions(
            &server,
            "rails",
            &[
                ("7.1.0", "2023-10-05T00:00:00.000Z"),
                ("7.0.0", "2021-12-15T00:00:00.000Z"),
                ("6.1.0", "2020-12-09T00:00:00.000Z"),
                ("6.0.0", "2019-08-16T00:00:00.000Z"),
                ("5.2.0", "2018-04-09T00:00:00.000Z"),
                ("5.1.0", "2017-04-27T00:00:00.000Z"),
                ("5.0.0", "2016-06-30T00:00:00.000Z"),
            ],
        );

        let dir = tempdir().unwrap();
        let adapter = adapter(&server, &dir);
        let data = adapter.fetch_metadata("rails").await.unwrap().unwrap();
        let signals = adapter.calculate_trust("rails", &data, Utc::now());

        let score: i32 = signals.iter().map(|s| s.points).sum();
        // 30 (downloads) + 15 (age) + 3 (7 versions)
        assert_eq!(score, 48);
        assert!(signals.iter().any(|s| s.signal == "downloads" && s.points == 30));
        assert!(signals.iter().any(|s| s.signal == "package_age" && s.points == 15));
    }

    #[tokio::test]
    async fn test_dependents_count() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method("GET").path("/api/v1/gems/rack/reverse_dependencies.json");
            then.status(200).body(r#"["rails","sinatra","puma"]"#);
        });

        let dir = tempdir().unwrap();
        let count = adapter(&server, &dir)
            .fetch_dependents_count("rack")
            .await
            .unwrap();
        assert_eq!(count, Some(3));
    }

    #[tokio::test]
    async fn test_resolve_source_repo_prefers_source_code_uri() {
        let server = MockServer::start();
        let dir = tempdir().unwrap();
        let adapter = adapter(&server, &dir);

        let data = PackageData {
            metadata: json!({
                "source_code_uri": "https://github.com/rails/rails",
                "homepage_uri": "https://rubyonrails.org",
            }),
            versions: Vec::new(),
            stdlib: false,
        };
        let repo = adapter.resolve_source_repo("rails", &data).await.unwrap().unwrap();
        assert_eq!(repo.owner, "rails");
        assert_eq!(repo.repo, "rails");
    }

    #[tokio::test]
    async fn test_resolve_source_repo_falls_back_to_homepage() {
        let server = MockServer::start();
        let dir = tempdir().unwrap();
        let adapter = adapter(&server, &dir);

        let data = PackageData {
            metadata: json!({
                "source_code_uri": null,
                "homepage_uri": "https://github.com/sinatra/sinatra",
            }),
            versions: Vec::new(),
            stdlib: false,
        };
        let repo = adapter.resolve_source_repo("sinatra", &data).await.unwrap().unwrap();
        assert_eq!(repo.owner, "sinatra");
    }

    #[tokio::test]
    async fn test_popular_list_is_cached() {
        let server = MockServer::start();
        for name in POPULAR_GEMS {
            mock_gem(&server, name, 100_000_000);
        }

        let dir = tempdir().unwrap();
        let adapter = adapter(&server, &dir);

        let list = adapter.popular_packages().await.unwrap();
        assert_eq!(list.len(), POPULAR_GEMS.len());
        assert!(list.iter().all(|p| p.downloads == 100_000_000));

        // Second call reads the assembled list back from the cache
        let cached = adapter.cache.get("popular:ruby", TTL_FACTS);
        assert!(cached.is_some());
        let again = adapter.popular_packages().await.unwrap();
        assert_eq!(again.len(), list.len());
    }
}
