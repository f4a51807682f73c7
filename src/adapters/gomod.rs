//! Adapter for Go modules.
//!
//! There is no central Go registry: modules are addressed by host path.
//! Existence and the version list come from the module proxy, package and
//! project facts (timestamps, licenses, advisories, OpenSSF scorecard)
//! from the deps.dev aggregator, and custom import paths resolve through
//! the vanity-domain `?go-get=1` meta tag.

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};

use crate::adapters::{
    score_age, score_version_count, EcosystemAdapter, PackageData, PopularPackage, RepoRef,
    VersionRecord,
};
use crate::anomalies::{growth, names, Anomaly};
use crate::cache::{DiskCache, TTL_FACTS, TTL_METADATA};
use crate::http::{FetchError, HttpFetcher};
use crate::scoring::TrustSignal;
use crate::types::Ecosystem;

pub const GO_PROXY_URL: &str = "https://proxy.golang.org";
pub const DEPS_DEV_URL: &str = "https://api.deps.dev";

const STDLIB_SCORE: i32 = 95;
const SCORECARD_MAX: i32 = 20;
const AGE_MAX: i32 = 10;
const VERSION_COUNT_MAX: i32 = 5;
const LICENSE_BONUS: i32 = 5;
const REPO_QUALITY_BONUS: i32 = 5;
const ADVISORY_PENALTY: i32 = -15;
const ADVISORY_PENALTY_FLOOR: i32 = -30;

/// Module prefixes maintained by the language project itself
const STDLIB_PREFIXES: &[&str] = &["golang.org/x/"];

/// Widely-imported modules used as squat-comparison targets
const POPULAR_MODULES: &[&str] = &[
    "github.com/gin-gonic/gin",
    "github.com/spf13/cobra",
    "github.com/stretchr/testify",
    "github.com/gorilla/mux",
    "github.com/sirupsen/logrus",
    "github.com/spf13/viper",
    "github.com/pkg/errors",
    "github.com/google/uuid",
    "github.com/go-chi/chi",
    "github.com/prometheus/client_golang",
];

/// Brand prefixes that attract namespace squats
const MAGNET_NAMESPACES: &[&str] = &["golang", "kubernetes", "docker", "grpc", "gin", "aws"];

static GO_IMPORT_META: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<meta\s+name="go-import"\s+content="([^"]+)""#).unwrap()
});

/// Adapter for module-path packages
pub struct GoModAdapter {
    http: Arc<HttpFetcher>,
    cache: Arc<DiskCache>,
    proxy_url: String,
    deps_dev_url: String,
    /// Scheme+host prefix for vanity lookups; production uses `https://`
    /// in front of the module path itself
    vanity_base: Option<String>,
}

impl GoModAdapter {
    pub fn new(
        http: Arc<HttpFetcher>,
        cache: Arc<DiskCache>,
        proxy_url: &str,
        deps_dev_url: &str,
        vanity_base: Option<String>,
    ) -> Self {
        Self {
            http,
            cache,
            proxy_url: proxy_url.trim_end_matches('/').to_string(),
            deps_dev_url: deps_dev_url.trim_end_matches('/').to_string(),
            vanity_base,
        }
    }

    fn is_stdlib(module: &str) -> bool {
        STDLIB_PREFIXES.iter().any(|prefix| module.starts_with(prefix))
    }

    /// Version names from the module proxy `@v/list` endpoint
    async fn proxy_versions(&self, module: &str) -> Result<Option<Vec<String>>, FetchError> {
        let key = format!("versions:go:{}", module);
        let url = format!("{}/{}/@v/list", self.proxy_url, encode_module_path(module));
        let http = Arc::clone(&self.http);

        let value = self
            .cache
            .fetch(&key, TTL_FACTS, || async move {
                let text = http.get_text(&url).await?;
                Ok(text.map(|t| {
                    json!(t
                        .lines()
                        .map(|l| l.trim().to_string())
                        .filter(|l| !l.is_empty())
                        .collect::<Vec<_>>())
                }))
            })
            .await?;

        Ok(value.map(|v| {
            v.as_array()
                .map(|list| {
                    list.iter()
                        .filter_map(|e| e.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    /// Package facts from the deps aggregator: per-version timestamps and
    /// the default version
    async fn aggregator_package(&self, module: &str) -> Result<Option<Value>, FetchError> {
        let key = format!("pkg:go:{}", module);
        let url = format!(
            "{}/v3alpha/systems/GO/packages/{}",
            self.deps_dev_url,
            encode_path_segment(module)
        );
        let http = Arc::clone(&self.http);

        self.cache
            .fetch(&key, TTL_METADATA, || async move { http.get_json(&url).await })
            .await
    }

    /// Per-version facts: licenses and advisories
    async fn aggregator_version(&self, module: &str, version: &str) -> Result<Option<Value>, FetchError> {
        let key = format!("pkgver:go:{}@{}", module, version);
        let url = format!(
            "{}/v3alpha/systems/GO/packages/{}/versions/{}",
            self.deps_dev_url,
            encode_path_segment(module),
            version
        );
        let http = Arc::clone(&self.http);

        self.cache
            .fetch(&key, TTL_METADATA, || async move { http.get_json(&url).await })
            .await
    }

    /// Direct dependency count for a version
    async fn aggregator_dependencies(
        &self,
        module: &str,
        version: &str,
    ) -> Result<Option<u64>, FetchError> {
        let key = format!("pkgdeps:go:{}@{}", module, version);
        let url = format!(
            "{}/v3alpha/systems/GO/packages/{}/versions/{}:dependencies",
            self.deps_dev_url,
            encode_path_segment(module),
            version
        );
        let http = Arc::clone(&self.http);

        let value = self
            .cache
            .fetch(&key, TTL_FACTS, || async move {
                let response = http.get_json(&url).await?;
                // The node list includes the module itself
                Ok(response.map(|v| {
                    json!(v["nodes"]
                        .as_array()
                        .map(|nodes| nodes.len().saturating_sub(1))
                        .unwrap_or(0))
                }))
            })
            .await?;

        Ok(value.and_then(|v| v.as_u64()))
    }

    /// Project facts for the backing repository (scorecard, description)
    async fn aggregator_project(&self, repo: &RepoRef) -> Result<Option<Value>, FetchError> {
        let project_id = format!("github.com/{}/{}", repo.owner, repo.repo);
        let key = format!("proj:go:{}", project_id);
        let url = format!(
            "{}/v3alpha/projects/{}",
            self.deps_dev_url,
            encode_path_segment(&project_id)
        );
        let http = Arc::clone(&self.http);

        self.cache
            .fetch(&key, TTL_FACTS, || async move { http.get_json(&url).await })
            .await
    }

    /// Resolve a module path to its backing repository.
    ///
    /// `github.com/owner/repo[/...]` splits literally; anything else goes
    /// through the vanity `?go-get=1` meta-tag lookup, cached long-TTL.
    async fn resolve_repo(&self, module: &str) -> Result<Option<RepoRef>, FetchError> {
        if let Some(rest) = module.strip_prefix("github.com/") {
            let mut segments = rest.split('/').filter(|s| !s.is_empty());
            if let (Some(owner), Some(repo)) = (segments.next(), segments.next()) {
                return Ok(Some(RepoRef {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                }));
            }
            return Ok(None);
        }

        let key = format!("vanity:go:{}", module);
        if let Some(cached) = self.cache.get(&key, TTL_FACTS) {
            return Ok(serde_json::from_value::<(String, String)>(cached)
                .ok()
                .map(|(owner, repo)| RepoRef { owner, repo }));
        }

        let url = match &self.vanity_base {
            Some(base) => format!("{}/{}?go-get=1", base.trim_end_matches('/'), module),
            None => format!("https://{}?go-get=1", module),
        };

        let Some(html) = self.http.get_text(&url).await? else {
            return Ok(None);
        };

        let repo = parse_go_import_meta(&html);
        if let Some(repo) = &repo {
            let _ = serde_json::to_value((&repo.owner, &repo.repo))
                .map(|v| self.cache.set(&key, &v, TTL_FACTS));
        }
        Ok(repo)
    }
}

impl EcosystemAdapter for GoModAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::GoModule
    }

    async fn fetch_metadata(&self, name: &str) -> Result<Option<PackageData>, FetchError> {
        if Self::is_stdlib(name) {
            return Ok(Some(PackageData {
                metadata: json!({ "module": name }),
                versions: Vec::new(),
                stdlib: true,
            }));
        }

        let proxy_list = self.proxy_versions(name).await?;
        let package = self.aggregator_package(name).await?;

        if proxy_list.is_none() && package.is_none() {
            return Ok(None);
        }

        // Timestamps and the default version come from the aggregator
        let mut published: std::collections::HashMap<String, DateTime<Utc>> =
            std::collections::HashMap::new();
        let mut default_version = None;
        if let Some(package) = &package {
            if let Some(entries) = package["versions"].as_array() {
                for entry in entries {
                    let Some(version) = entry["versionKey"]["version"].as_str() else {
                        continue;
                    };
                    if entry["isDefault"].as_bool().unwrap_or(false) {
                        default_version = Some(version.to_string());
                    }
                    if let Some(ts) = entry["publishedAt"]
                        .as_str()
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    {
                        published.insert(version.to_string(), ts.with_timezone(&Utc));
                    }
                }
            }
        }

        let version_names: Vec<String> = match proxy_list {
            Some(list) if !list.is_empty() => list,
            _ => published.keys().cloned().collect(),
        };

        let versions: Vec<VersionRecord> = version_names
            .iter()
            .map(|v| VersionRecord {
                version: v.clone(),
                created_at: published.get(v).copied(),
                yanked: false,
            })
            .collect();

        let probe_version = default_version.or_else(|| version_names.last().cloned());

        let mut licenses = Vec::new();
        let mut advisory_count = 0u64;
        let mut dependency_count = None;
        if let Some(version) = &probe_version {
            if let Some(detail) = self.aggregator_version(name, version).await? {
                if let Some(list) = detail["licenses"].as_array() {
                    licenses = list
                        .iter()
                        .filter_map(|l| l.as_str().map(|s| s.to_string()))
                        .collect();
                }
                advisory_count = detail["advisoryKeys"]
                    .as_array()
                    .map(|a| a.len() as u64)
                    .unwrap_or(0);
            }
            dependency_count = self.aggregator_dependencies(name, version).await?;
        }

        let repo = self.resolve_repo(name).await?;
        let mut scorecard = None;
        let mut repo_described = false;
        if let Some(repo) = &repo {
            if let Some(project) = self.aggregator_project(repo).await? {
                scorecard = project["scorecard"]["overallScore"].as_f64();
                repo_described = project["description"]
                    .as_str()
                    .map(|d| !d.is_empty())
                    .unwrap_or(false);
            }
        }

        let metadata = json!({
            "module": name,
            "latest": probe_version,
            "licenses": licenses,
            "advisory_count": advisory_count,
            "dependency_count": dependency_count,
            "scorecard": scorecard,
            "repo": repo.as_ref().map(|r| json!({"owner": r.owner, "repo": r.repo})),
            "repo_described": repo_described,
        });

        Ok(Some(PackageData {
            metadata,
            versions,
            stdlib: false,
        }))
    }

    fn calculate_trust(&self, _name: &str, data: &PackageData, now: DateTime<Utc>) -> Vec<TrustSignal> {
        if data.stdlib {
            return vec![TrustSignal::new(
                "standard_library",
                STDLIB_SCORE,
                "maintained by the language project".to_string(),
            )];
        }

        let mut signals = Vec::new();

        if let Some(score) = data.metadata["scorecard"].as_f64() {
            let points = ((score * 2.0).round() as i32).clamp(0, SCORECARD_MAX);
            if points > 0 {
                signals.push(TrustSignal::new(
                    "scorecard",
                    points,
                    format!("OpenSSF scorecard {:.1}/10", score),
                ));
            }
        }

        if let Some(signal) = score_age(&data.versions, now, AGE_MAX) {
            signals.push(signal);
        }
        if let Some(signal) = score_version_count(&data.versions, VERSION_COUNT_MAX) {
            signals.push(signal);
        }

        let has_license = data.metadata["licenses"]
            .as_array()
            .map(|l| !l.is_empty())
            .unwrap_or(false);
        if has_license {
            signals.push(TrustSignal::new(
                "license",
                LICENSE_BONUS,
                "license declared".to_string(),
            ));
        }

        if let Some(deps) = data.metadata["dependency_count"].as_u64() {
            let points = match deps {
                d if d < 5 => 5,
                d if d < 20 => 3,
                d if d < 50 => 1,
                _ => 0,
            };
            if points > 0 {
                signals.push(TrustSignal::new(
                    "dependency_count",
                    points,
                    format!("{} direct dependencies", deps),
                ));
            }
        }

        if !data.metadata["repo"].is_null() && data.metadata["repo_described"].as_bool() == Some(true) {
            signals.push(TrustSignal::new(
                "repo_quality",
                REPO_QUALITY_BONUS,
                "described, resolvable source repository".to_string(),
            ));
        }

        let advisories = data.metadata["advisory_count"].as_u64().unwrap_or(0);
        if advisories > 0 {
            let penalty = (ADVISORY_PENALTY * advisories as i32).max(ADVISORY_PENALTY_FLOOR);
            signals.push(TrustSignal::new(
                "advisories",
                penalty,
                format!("{} known security advisories", advisories),
            ));
        }

        signals
    }

    /// Module paths have no reverse-dependency endpoint
    async fn fetch_dependents_count(&self, _name: &str) -> Result<Option<u64>, FetchError> {
        Ok(None)
    }

    async fn resolve_source_repo(
        &self,
        name: &str,
        data: &PackageData,
    ) -> Result<Option<RepoRef>, FetchError> {
        let from_metadata = data.metadata["repo"].as_object().and_then(|r| {
            Some(RepoRef {
                owner: r.get("owner")?.as_str()?.to_string(),
                repo: r.get("repo")?.as_str()?.to_string(),
            })
        });

        match from_metadata {
            Some(repo) => Ok(Some(repo)),
            None => self.resolve_repo(name).await,
        }
    }

    async fn popular_packages(&self) -> Result<Vec<PopularPackage>, FetchError> {
        Ok(POPULAR_MODULES
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
        let mut findings = Vec::new();

        findings.extend(names::detect_typosquat(name, None, popular));
        findings.extend(names::detect_name_patterns(name));

        let repo_name = name.rsplit('/').next().unwrap_or(name);
        findings.extend(names::detect_namespace_squat(
            repo_name,
            None,
            &[],
            MAGNET_NAMESPACES,
        ));

        findings.extend(growth::detect_version_spike(&data.versions, now));
        findings.extend(growth::detect_new_package(&data.versions, now));
        findings.extend(growth::detect_rapid_versioning(&data.versions, now));

        findings
    }

    /// Module-path scoring leans on the scorecard, so stars weigh more
    fn source_host_stars_max(&self) -> i32 {
        20
    }

    fn source_host_org_bonus(&self) -> i32 {
        0
    }
}

/// Case-encode a module path for proxy URLs: uppercase letters become
/// `!` followed by the lowercase letter
fn encode_module_path(path: &str) -> String {
    let mut result = String::with_capacity(path.len());
    for ch in path.chars() {
        if ch.is_ascii_uppercase() {
            result.push('!');
            result.push(ch.to_ascii_lowercase());
        } else {
            result.push(ch);
        }
    }
    result
}

/// Percent-encode a value used as a single path segment
fn encode_path_segment(s: &str) -> String {
    s.replace('%', "%25").replace('/', "%2F")
}

/// Extract the backing repository from a vanity page's go-import meta tag
fn parse_go_import_meta(html: &str) -> Option<RepoRef> {
    let content = GO_IMPORT_META.captures(html)?.get(1)?.as_str();
    let mut fields = content.split_whitespace();
    let _prefix = fields.next()?;
    let _vcs = fields.next()?;
    let repo_url = fields.next()?;
    crate::adapters::parse_github_url(repo_url)
}
