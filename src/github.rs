//! Source-host repository facts.
//!
//! Stars and owner type are the stage-3 trust signals; they are the most
//! expensive to obtain (anonymous quota is 60 requests/hour), so results
//! are cached for a week and the lookup only runs for packages that did
//! not clear the earlier stages.

use std::sync::Arc;

use serde::Deserialize;

use crate::cache::{DiskCache, TTL_FACTS};
use crate::http::{FetchError, HttpFetcher};

pub const GITHUB_API: &str = "https://api.github.com";

/// Facts about a source repository
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepoFacts {
    pub stars: u64,
    pub owner_is_org: bool,
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    stargazers_count: u64,
    owner: Option<RepoOwner>,
}

#[derive(Debug, Deserialize)]
struct RepoOwner {
    #[serde(rename = "type")]
    owner_type: String,
}

/// Client for the source-code-host repository API
pub struct GitHubClient {
    http: Arc<HttpFetcher>,
    cache: Arc<DiskCache>,
    base_url: String,
}

impl GitHubClient {
    pub fn new(http: Arc<HttpFetcher>, cache: Arc<DiskCache>, base_url: &str) -> Self {
        Self {
            http,
            cache,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Fetch stars and owner type for a repository.
    ///
    /// Absent means the repository does not exist or the signal is
    /// unavailable; quota exhaustion propagates as the fatal condition.
    pub async fn repo_facts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Option<RepoFacts>, FetchError> {
        let key = format!("gh:repo:{}/{}", owner, repo);
        let url = format!("{}/repos/{}/{}", self.base_url, owner, repo);
        let http = Arc::clone(&self.http);

        let value = self
            .cache
            .fetch(&key, TTL_FACTS, || async move { http.get_json(&url).await })
            .await?;

        let Some(value) = value else {
            return Ok(None);
        };

        let parsed: RepoResponse = match serde_json::from_value(value) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!(owner, repo, %err, "unexpected repository payload shape");
                return Ok(None);
            }
        };

        Ok(Some(RepoFacts {
            stars: parsed.stargazers_count,
            owner_is_org: parsed
                .owner
                .map(|o| o.owner_type == "Organization")
                .unwrap_or(false),
        }))
    }
}
