//! Name-similarity and namespace detectors.
//!
//! All of these compare the subject's name against the ecosystem's popular
//! package list, which callers fetch once per scan and pass in.

use std::sync::LazyLock;

use levenshtein::levenshtein;
use regex::Regex;

use crate::adapters::PopularPackage;
use crate::anomalies::{Anomaly, AnomalyKind, Severity};

/// Adoption ratio below which an edit-distance-1 neighbor is suspicious
const TYPOSQUAT_ADOPTION_RATIO: f64 = 0.001;

/// Minimum base-package downloads for the namespace-squat ratio check
const NAMESPACE_BASE_FLOOR: u64 = 10_000_000;

/// Confusable pairs, visually-similar form first. Deliberately small and
/// Latin-centric; widening it needs a wider test surface.
const HOMOGLYPH_PAIRS: &[(&str, &str)] = &[("0", "o"), ("1", "l"), ("1", "i"), ("rn", "m"), ("vv", "w")];

/// Flag a package one edit away from a popular package it has not earned
/// adoption next to.
///
/// Subjects with no download signal cannot demonstrate adoption, so the
/// ratio test is treated as failed for them.
pub fn detect_typosquat(
    name: &str,
    downloads: Option<u64>,
    popular: &[PopularPackage],
) -> Option<Anomaly> {
    let name = name.to_lowercase();

    // The subject being popular itself rules out impersonation entirely;
    // popular packages routinely sit one edit apart (rack/rake).
    if popular.iter().any(|p| p.name == name) {
        return None;
    }

    for candidate in popular {
        if levenshtein(&name, &candidate.name) != 1 {
            continue;
        }

        let negligible = match (downloads, candidate.downloads) {
            (Some(subject), target) if target > 0 => {
                (subject as f64) < (target as f64) * TYPOSQUAT_ADOPTION_RATIO
            }
            _ => true,
        };

        if negligible {
            return Some(
                Anomaly::new(
                    AnomalyKind::Typosquat,
                    Severity::High,
                    format!(
                        "'{}' is one edit away from popular package '{}' with negligible adoption",
                        name, candidate.name
                    ),
                )
                .with_target(&candidate.name),
            );
        }
    }

    None
}

/// Flag names that become a popular package under confusable substitution
pub fn detect_homoglyph(name: &str, popular: &[PopularPackage]) -> Option<Anomaly> {
    let name = name.to_lowercase();

    for (lookalike, canonical) in HOMOGLYPH_PAIRS {
        if !name.contains(lookalike) {
            continue;
        }
        let substituted = name.replace(lookalike, canonical);
        if substituted == name {
            continue;
        }
        if let Some(target) = popular.iter().find(|p| p.name == substituted) {
            return Some(
                Anomaly::new(
                    AnomalyKind::Homoglyph,
                    Severity::High,
                    format!(
                        "'{}' imitates '{}' using confusable characters ('{}' for '{}')",
                        name, target.name, lookalike, canonical
                    ),
                )
                .with_target(&target.name),
            );
        }
    }

    None
}

/// Flag a package riding a popular package's name as its prefix.
///
/// With download counts available the check is adoption-relative; without
/// them, any prefix match against the magnet namespace list flags.
pub fn detect_namespace_squat(
    name: &str,
    downloads: Option<u64>,
    popular: &[PopularPackage],
    magnet_namespaces: &[&str],
) -> Option<Anomaly> {
    let name = name.to_lowercase();
    let prefix = name.split(['-', '_']).next().unwrap_or(&name);
    if prefix == name {
        return None;
    }

    if let Some(base) = popular
        .iter()
        .find(|p| p.name == prefix && p.downloads >= NAMESPACE_BASE_FLOOR)
    {
        let subject = downloads.unwrap_or(0);
        let share = subject as f64 / base.downloads as f64;

        let severity = if subject < 1_000 {
            Some(Severity::High)
        } else if share < 0.01 {
            Some(Severity::Medium)
        } else {
            None
        };

        if let Some(severity) = severity {
            return Some(
                Anomaly::new(
                    AnomalyKind::NamespaceSquat,
                    severity,
                    format!(
                        "'{}' squats the '{}' namespace with {} downloads against the base's {}",
                        name, base.name, subject, base.downloads
                    ),
                )
                .with_target(&base.name),
            );
        }
        return None;
    }

    if magnet_namespaces.contains(&prefix) {
        return Some(
            Anomaly::new(
                AnomalyKind::NamespaceSquat,
                Severity::High,
                format!("'{}' squats the '{}' framework namespace", name, prefix),
            )
            .with_target(prefix),
        );
    }

    None
}

static TRAILING_GO: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-go$").unwrap());
static LEADING_GOLANG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^golang-").unwrap());
static TRAILING_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{2,}$").unwrap());

/// Module-path repository names shaped like common squat patterns
pub fn detect_name_patterns(module_path: &str) -> Option<Anomaly> {
    let repo = module_path.rsplit('/').next().unwrap_or(module_path).to_lowercase();

    let suspicious = TRAILING_GO.is_match(&repo)
        || LEADING_GOLANG.is_match(&repo)
        || TRAILING_DIGITS.is_match(&repo)
        || has_tripled_letter(&repo);

    suspicious.then(|| {
        Anomaly::new(
            AnomalyKind::NamePattern,
            Severity::Medium,
            format!("repository name '{}' matches a common squat pattern", repo),
        )
    })
}

fn has_tripled_letter(s: &str) -> bool {
    let chars: Vec<char> = s.chars().collect();
    chars
        .windows(3)
        .any(|w| w[0].is_ascii_alphabetic() && w[0] == w[1] && w[1] == w[2])
}
