//! Staged trust scoring.
//!
//! The scorer drives an adapter lazily across three stages, stopping as
//! soon as the accumulated score demonstrates enough confidence. Most
//! legitimate packages clear stage 1 from registry metadata alone; only
//! the long tail pays for dependents and source-host lookups.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::adapters::{score_source_host, EcosystemAdapter, PackageData};
use crate::github::GitHubClient;
use crate::http::FetchError;

/// Accumulated score at which a stage may finalize early
const CONFIDENCE_THRESHOLD: i32 = 70;

/// One scored signal in a trust breakdown
#[derive(Debug, Clone, Serialize)]
pub struct TrustSignal {
    pub signal: String,
    pub points: i32,
    pub reason: String,
}

impl TrustSignal {
    pub fn new(signal: &str, points: i32, reason: String) -> Self {
        Self {
            signal: signal.to_string(),
            points,
            reason,
        }
    }
}

/// Trust level derived from the final clamped score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLevel {
    Critical,
    High,
    Medium,
    Low,
    Untrusted,
    NotFound,
}

/// The outcome of scoring one package
#[derive(Debug, Clone, Serialize)]
pub struct TrustResult {
    /// Clamped to [0, 100]
    pub score: i32,
    pub level: TrustLevel,
    pub breakdown: Vec<TrustSignal>,
    /// Which stage produced the verdict; 0 means the package was not found
    pub stage: u8,
}

impl TrustResult {
    fn not_found() -> Self {
        Self {
            score: 0,
            level: TrustLevel::NotFound,
            breakdown: Vec::new(),
            stage: 0,
        }
    }

    /// Re-clamp the score and refresh the level after a mutation
    pub fn reclamp(&mut self) {
        self.score = self.score.clamp(0, 100);
        if self.level != TrustLevel::NotFound {
            self.level = level_for(self.score);
        }
    }
}

fn level_for(score: i32) -> TrustLevel {
    match score {
        s if s >= 95 => TrustLevel::Critical,
        s if s >= 80 => TrustLevel::High,
        s if s >= 60 => TrustLevel::Medium,
        s if s >= 40 => TrustLevel::Low,
        _ => TrustLevel::Untrusted,
    }
}

/// Running breakdown that enforces one entry per signal name
struct Accumulator {
    breakdown: Vec<TrustSignal>,
    score: i32,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            breakdown: Vec::new(),
            score: 0,
        }
    }

    fn add(&mut self, signal: TrustSignal) {
        if self.breakdown.iter().any(|s| s.signal == signal.signal) {
            tracing::debug!(signal = %signal.signal, "dropping duplicate trust signal");
            return;
        }
        self.score += signal.points;
        self.breakdown.push(signal);
    }

    fn finalize(self, stage: u8) -> TrustResult {
        let score = self.score.clamp(0, 100);
        TrustResult {
            score,
            level: level_for(score),
            breakdown: self.breakdown,
            stage,
        }
    }
}

/// Score one package, fetching lazily.
///
/// Returns the metadata alongside the result so anomaly detection can
/// reuse it without refetching.
pub async fn evaluate<A: EcosystemAdapter>(
    adapter: &A,
    github: &GitHubClient,
    name: &str,
    now: DateTime<Utc>,
    profile: bool,
) -> Result<(TrustResult, Option<PackageData>), FetchError> {
    let started = Instant::now();
    let data = adapter.fetch_metadata(name).await?;
    if profile {
        tracing::info!(package = name, stage = "fetch", elapsed_ms = started.elapsed().as_millis() as u64);
    }

    let Some(data) = data else {
        return Ok((TrustResult::not_found(), None));
    };

    // Stage 1: basic signals from metadata already in hand
    let started = Instant::now();
    let mut acc = Accumulator::new();
    for signal in adapter.calculate_trust(name, &data, now) {
        acc.add(signal);
    }
    if profile {
        tracing::info!(package = name, stage = "basic", elapsed_ms = started.elapsed().as_millis() as u64);
    }
    if acc.score >= CONFIDENCE_THRESHOLD {
        return Ok((acc.finalize(1), Some(data)));
    }

    // Stage 2: reverse-dependency adoption
    let started = Instant::now();
    if let Some(count) = adapter.fetch_dependents_count(name).await? {
        let points = adapter.dependents_points(count);
        if points > 0 {
            acc.add(TrustSignal::new(
                "dependents",
                points,
                format!("{} dependent packages", count),
            ));
        }
    }
    if profile {
        tracing::info!(package = name, stage = "dependents", elapsed_ms = started.elapsed().as_millis() as u64);
    }
    if acc.score >= CONFIDENCE_THRESHOLD {
        return Ok((acc.finalize(2), Some(data)));
    }

    // Stage 3: source-host reputation
    let started = Instant::now();
    if let Some(repo) = adapter.resolve_source_repo(name, &data).await? {
        if let Some(facts) = github.repo_facts(&repo.owner, &repo.repo).await? {
            for signal in score_source_host(
                &facts,
                adapter.source_host_stars_max(),
                adapter.source_host_org_bonus(),
            ) {
                acc.add(signal);
            }
        }
    }
    if profile {
        tracing::info!(package = name, stage = "source_host", elapsed_ms = started.elapsed().as_millis() as u64);
    }

    Ok((acc.finalize(3), Some(data)))
}
