//! End-to-end scans against mock registries.

use chrono::{Duration, Utc};
use httpmock::MockServer;
use serde_json::json;
use tempfile::TempDir;

use slopguard::scanner::Endpoints;
use slopguard::scoring::TrustLevel;
use slopguard::{Action, Config, Ecosystem, PackageRef, Scanner};

fn scanner(server: &MockServer, cache_dir: &TempDir, workers: usize) -> Scanner {
    let config = Config {
        github_token: None,
        debug: false,
        profile: false,
        workers,
        cache_root: Some(cache_dir.path().to_path_buf()),
    };
    let endpoints = Endpoints {
        rubygems: server.base_url(),
        pypi: server.base_url(),
        go_proxy: server.base_url(),
        deps_dev: server.base_url(),
        github_api: server.base_url(),
        go_vanity_base: Some(server.base_url()),
    };
    Scanner::with_endpoints(config, endpoints).unwrap()
}

fn ruby(name: &str, version: &str) -> PackageRef {
    PackageRef::new(Ecosystem::RubyGems, name, version).unwrap()
}

fn python(name: &str, version: &str) -> PackageRef {
    PackageRef::new(Ecosystem::PyPi, name, version).unwrap()
}

fn gomod(name: &str, version: &str) -> PackageRef {
    PackageRef::new(Ecosystem::GoModule, name, version).unwrap()
}

/// A mature gem: 500M downloads, 25 versions back to 2016, GitHub repo
fn mock_rails(server: &MockServer) {
    server.mock(|when, then| {
        when.method("GET").path("/api/v1/gems/rails.json");
        then.status(200).body(
            json!({
                "name": "rails",
                "downloads": 500_000_000u64,
                "version": "7.1.0",
                "authors": "David Heinemeier Hansson",
                "info": "Full-stack web framework",
                "licenses": ["MIT"],
                "homepage_uri": "https://rubyonrails.org",
                "source_code_uri": "https://github.com/rails/rails",
            })
            .to_string(),
        );
    });

    let versions: Vec<_> = (0..25)
        .map(|i| {
            json!({
                "number": format!("6.{}.0", i),
                "created_at": format!("{}-06-01T00:00:00.000Z", 2016 + (i % 8)),
            })
        })
        .collect();
    server.mock(|when, then| {
        when.method("GET").path("/api/v1/versions/rails.json");
        then.status(200).body(json!(versions).to_string());
    });

    let dependents: Vec<_> = (0..1001).map(|i| format!("dependent-{}", i)).collect();
    server.mock(|when, then| {
        when.method("GET").path("/api/v1/gems/rails/reverse_dependencies.json");
        then.status(200).body(json!(dependents).to_string());
    });

    server.mock(|when, then| {
        when.method("GET").path("/repos/rails/rails");
        then.status(200).body(
            json!({
                "stargazers_count": 55_000,
                "owner": {"type": "Organization", "login": "rails"},
            })
            .to_string(),
        );
    });
}

/// A young, unknown gem with a handful of downloads
fn mock_young_gem(server: &MockServer, name: &str, downloads: u64, age_days: i64) {
    server.mock({
        let name = name.to_string();
        move |when, then| {
            when.method("GET").path(format!("/api/v1/gems/{}.json", name));
            then.status(200).body(
                json!({
                    "name": name,
                    "downloads": downloads,
                    "version": "1.0.0",
                    "authors": "anon",
                    "info": "a gem",
                    "homepage_uri": null,
                    "source_code_uri": null,
                })
                .to_string(),
            );
        }
    });

    let created = (Utc::now() - Duration::days(age_days)).to_rfc3339();
    server.mock({
        let name = name.to_string();
        move |when, then| {
            when.method("GET").path(format!("/api/v1/versions/{}.json", name));
            then.status(200)
                .body(json!([{"number": "1.0.0", "created_at": created}]).to_string());
        }
    });
}

/// A mature PyPI project: 22 releases back to 2015, stable classifiers
fn mock_django(server: &MockServer) {
    let mut releases = serde_json::Map::new();
    for i in 0..22 {
        releases.insert(
            format!("4.{}.0", i),
            json!([{
                "upload_time": format!("{}-04-01T10:00:00", 2015 + (i % 10)),
                "yanked": false,
            }]),
        );
    }

    server.mock(move |when, then| {
        when.method("GET").path("/pypi/django/json");
        then.status(200).body(
            json!({
                "info": {
                    "name": "Django",
                    "version": "5.0.1",
                    "author": "Django Software Foundation",
                    "license": "BSD-3-Clause",
                    "home_page": "https://www.djangoproject.com/",
                    "project_urls": {"Source": "https://github.com/django/django"},
                    "classifiers": [
                        "Development Status :: 5 - Production/Stable",
                        "License :: OSI Approved :: BSD License",
                        "Programming Language :: Python :: 3",
                    ],
                },
                "releases": releases,
            })
            .to_string(),
        );
    });

    server.mock(|when, then| {
        when.method("GET").path("/repos/django/django");
        then.status(200).body(
            json!({
                "stargazers_count": 70_000,
                "owner": {"type": "Organization", "login": "django"},
            })
            .to_string(),
        );
    });
}

/// A healthy Go module: good scorecard, old history, starred repo
fn mock_gin(server: &MockServer) {
    let versions: Vec<String> = (0..25).map(|i| format!("v1.{}.0", i)).collect();
    server.mock({
        let body = versions.join("\n");
        move |when, then| {
            when.method("GET").path("/github.com/gin-gonic/gin/@v/list");
            then.status(200).body(body.clone());
        }
    });

    server.mock(|when, then| {
        when.method("GET")
            .path("/v3alpha/systems/GO/packages/github.com%2Fgin-gonic%2Fgin");
        then.status(200).body(
            json!({
                "versions": [
                    {"versionKey": {"version": "v1.24.0"}, "publishedAt": "2023-06-01T00:00:00Z", "isDefault": true},
                    {"versionKey": {"version": "v1.0.0"}, "publishedAt": "2016-04-01T00:00:00Z"},
                ]
            })
            .to_string(),
        );
    });

    server.mock(|when, then| {
        when.method("GET")
            .path("/v3alpha/systems/GO/packages/github.com%2Fgin-gonic%2Fgin/versions/v1.24.0");
        then.status(200)
            .body(json!({"licenses": ["MIT"], "advisoryKeys": []}).to_string());
    });

    server.mock(|when, then| {
        when.method("GET").path(
            "/v3alpha/systems/GO/packages/github.com%2Fgin-gonic%2Fgin/versions/v1.24.0:dependencies",
        );
        then.status(200)
            .body(json!({"nodes": [{}, {}, {}, {}]}).to_string());
    });

    server.mock(|when, then| {
        when.method("GET").path("/v3alpha/projects/github.com%2Fgin-gonic%2Fgin");
        then.status(200).body(
            json!({
                "starsCount": 75_000,
                "description": "HTTP web framework written in Go",
                "scorecard": {"overallScore": 8.8},
            })
            .to_string(),
        );
    });

    server.mock(|when, then| {
        when.method("GET").path("/repos/gin-gonic/gin");
        then.status(200).body(
            json!({
                "stargazers_count": 75_000,
                "owner": {"type": "User", "login": "gin-gonic"},
            })
            .to_string(),
        );
    });
}

#[tokio::test]
async fn scan_established_gem_is_verified() {
    let server = MockServer::start();
    mock_rails(&server);

    let cache_dir = TempDir::new().unwrap();
    let summary = scanner(&server, &cache_dir, 3)
        .scan(vec![ruby("rails", "7.1.0")])
        .await;

    assert_eq!(summary.total, 1);
    assert_eq!(summary.verified, 1);
    assert_eq!(summary.not_found, 0);
    assert!(!summary.partial);

    let verdict = &summary.results[0];
    assert_eq!(verdict.action, Action::Verified);
    assert!(verdict.trust.score >= 80, "score was {}", verdict.trust.score);
    assert!(matches!(
        verdict.trust.level,
        TrustLevel::High | TrustLevel::Critical
    ));
    assert!(verdict.anomalies.is_empty());
}

#[tokio::test]
async fn scan_nonexistent_gem_is_not_found() {
    let server = MockServer::start();

    let cache_dir = TempDir::new().unwrap();
    let summary = scanner(&server, &cache_dir, 3)
        .scan(vec![ruby("nonexistent-package-xyz", "0.1.0")])
        .await;

    assert_eq!(summary.total, 1);
    assert_eq!(summary.not_found, 1);

    let verdict = &summary.results[0];
    assert_eq!(verdict.action, Action::NotFound);
    assert_eq!(verdict.trust.score, 0);
    assert_eq!(verdict.trust.stage, 0);
    assert_eq!(verdict.trust.level, TrustLevel::NotFound);
}

#[tokio::test]
async fn scan_typosquat_gem_is_blocked() {
    let server = MockServer::start();
    // "rails" must be live so the popular list carries its downloads
    mock_rails(&server);
    mock_young_gem(&server, "rai1s", 420, 30);

    let cache_dir = TempDir::new().unwrap();
    let summary = scanner(&server, &cache_dir, 3)
        .scan(vec![ruby("rai1s", "1.0.0")])
        .await;

    let verdict = &summary.results[0];
    assert_eq!(verdict.action, Action::Block);

    let typosquat = verdict
        .anomalies
        .iter()
        .find(|a| a.kind == slopguard::anomalies::AnomalyKind::Typosquat)
        .expect("typosquat finding");
    assert_eq!(typosquat.target_package.as_deref(), Some("rails"));
}

#[tokio::test]
async fn scan_namespace_squat_gem_is_blocked() {
    let server = MockServer::start();
    mock_rails(&server);
    mock_young_gem(&server, "rails-backdoor", 500, 20);

    let cache_dir = TempDir::new().unwrap();
    let summary = scanner(&server, &cache_dir, 3)
        .scan(vec![ruby("rails-backdoor", "1.0.0")])
        .await;

    let verdict = &summary.results[0];
    assert_eq!(verdict.action, Action::Block);

    let squat = verdict
        .anomalies
        .iter()
        .find(|a| a.kind == slopguard::anomalies::AnomalyKind::NamespaceSquat)
        .expect("namespace squat finding");
    assert_eq!(squat.target_package.as_deref(), Some("rails"));
}

#[tokio::test]
async fn scan_stdlib_module_short_circuits() {
    let server = MockServer::start();

    let cache_dir = TempDir::new().unwrap();
    let summary = scanner(&server, &cache_dir, 3)
        .scan(vec![gomod("golang.org/x/crypto", "v0.14.0")])
        .await;

    let verdict = &summary.results[0];
    assert_eq!(verdict.action, Action::Verified);
    assert_eq!(verdict.trust.score, 95);
    assert_eq!(verdict.trust.stage, 1);
    assert_eq!(verdict.trust.breakdown.len(), 1);
    assert_eq!(verdict.trust.breakdown[0].signal, "standard_library");
}

#[tokio::test]
async fn scan_mixed_ecosystems() {
    let server = MockServer::start();
    mock_rails(&server);
    mock_django(&server);
    mock_gin(&server);

    let cache_dir = TempDir::new().unwrap();
    let summary = scanner(&server, &cache_dir, 5)
        .scan(vec![
            ruby("rails", "7.1.0"),
            python("django", "5.0.1"),
            gomod("github.com/gin-gonic/gin", "v1.9.1"),
            ruby("fake-xyz", "1.0.0"),
            gomod("github.com/fake/hallucinated", "v0.1.0"),
        ])
        .await;

    assert_eq!(summary.total, 5);
    assert!(summary.verified >= 3, "verified was {}", summary.verified);
    assert_eq!(summary.not_found, 2);
    assert_eq!(summary.high_risk, 0);

    for name in ["rails", "django", "github.com/gin-gonic/gin"] {
        let verdict = summary
            .results
            .iter()
            .find(|v| v.package.name == name)
            .unwrap();
        assert_ne!(verdict.action, Action::Block, "{} must not be blocked", name);
    }

    // Deterministic ordering: NOT_FOUND entries precede VERIFIED ones
    let order: Vec<&str> = summary
        .results
        .iter()
        .map(|v| v.package.name.as_str())
        .collect();
    assert_eq!(
        order,
        vec![
            "fake-xyz",
            "github.com/fake/hallucinated",
            "django",
            "github.com/gin-gonic/gin",
            "rails",
        ]
    );
}

#[tokio::test]
async fn warm_cache_scan_is_deterministic() {
    let server = MockServer::start();
    mock_rails(&server);
    mock_young_gem(&server, "rails-backdoor", 500, 20);

    let cache_dir = TempDir::new().unwrap();
    let scanner = scanner(&server, &cache_dir, 3);
    let packages = vec![ruby("rails", "7.1.0"), ruby("rails-backdoor", "1.0.0")];

    let first = scanner.scan(packages.clone()).await;
    let second = scanner.scan(packages).await;

    let shape = |summary: &slopguard::ScanSummary| {
        summary
            .results
            .iter()
            .map(|v| {
                (
                    v.package.name.clone(),
                    v.action,
                    v.trust.score,
                    v.trust.stage,
                    v.anomalies.iter().map(|a| a.kind).collect::<Vec<_>>(),
                )
            })
            .collect::<Vec<_>>()
    };

    assert_eq!(shape(&first), shape(&second));
    assert_eq!(first.verified, second.verified);
    assert_eq!(first.high_risk, second.high_risk);
}

#[tokio::test]
async fn fatal_rate_limit_yields_partial_summary() {
    let server = MockServer::start();
    mock_rails(&server);

    // A weak gem whose stage-3 lookup hits the exhausted quota
    server.mock(|when, then| {
        when.method("GET").path("/api/v1/gems/obscure-gem.json");
        then.status(200).body(
            json!({
                "name": "obscure-gem",
                "downloads": 12,
                "version": "0.1.0",
                "authors": "anon",
                "source_code_uri": "https://github.com/obscure/obscure-gem",
            })
            .to_string(),
        );
    });
    server.mock(|when, then| {
        when.method("GET").path("/api/v1/versions/obscure-gem.json");
        then.status(200).body("[]");
    });
    server.mock(|when, then| {
        when.method("GET").path("/repos/obscure/obscure-gem");
        then.status(403).header("x-ratelimit-remaining", "0");
    });

    let cache_dir = TempDir::new().unwrap();
    let summary = scanner(&server, &cache_dir, 1)
        .scan(vec![ruby("rails", "7.1.0"), ruby("obscure-gem", "0.1.0")])
        .await;

    assert!(summary.partial);
    assert!(summary.results.len() < summary.total);
    let notice = summary.rate_limit_notice.expect("quota notice");
    assert!(notice.contains("GITHUB_TOKEN"), "notice was: {}", notice);
}

#[tokio::test]
async fn every_verdict_respects_score_bounds() {
    let server = MockServer::start();
    mock_rails(&server);
    mock_young_gem(&server, "rai1s", 420, 30);
    mock_young_gem(&server, "rails-backdoor", 500, 20);

    let cache_dir = TempDir::new().unwrap();
    let summary = scanner(&server, &cache_dir, 3)
        .scan(vec![
            ruby("rails", "7.1.0"),
            ruby("rai1s", "1.0.0"),
            ruby("rails-backdoor", "1.0.0"),
            ruby("fake-xyz", "1.0.0"),
        ])
        .await;

    for verdict in &summary.results {
        assert!((0..=100).contains(&verdict.trust.score));

        // NOT_FOUND, stage 0 and action NOT_FOUND travel together
        let not_found = verdict.trust.level == TrustLevel::NotFound;
        assert_eq!(not_found, verdict.trust.stage == 0);
        assert_eq!(not_found, verdict.action == Action::NotFound);

        // Breakdown signal names are unique within a verdict
        let mut signals: Vec<&str> = verdict
            .trust
            .breakdown
            .iter()
            .map(|s| s.signal.as_str())
            .collect();
        signals.sort_unstable();
        signals.dedup();
        assert_eq!(signals.len(), verdict.trust.breakdown.len());
    }
}
