//! Growth and timing detectors.
//!
//! Each takes the observation time as a parameter so the outcome is a
//! pure function of its inputs.

use chrono::{DateTime, Duration, Utc};

use crate::adapters::VersionRecord;
use crate::anomalies::{Anomaly, AnomalyKind, Severity};

/// Downloads above this are established packages; inflation does not apply
const INFLATION_WATERMARK: u64 = 50_000_000;

/// Flag download counts inconsistent with package age.
///
/// Skipped for very popular packages, packages younger than a week and
/// packages without version timestamps.
pub fn detect_download_inflation(
    downloads: u64,
    versions: &[VersionRecord],
    now: DateTime<Utc>,
) -> Option<Anomaly> {
    if downloads >= INFLATION_WATERMARK {
        return None;
    }

    let age_days = package_age_days(versions, now)?;
    if age_days < 7 {
        return None;
    }

    let ratio = downloads as f64 / (age_days as f64 * 1000.0);

    let severity = if ratio > 100.0 && age_days < 30 {
        Some(Severity::High)
    } else if ratio > 50.0 && age_days < 14 {
        Some(Severity::Medium)
    } else {
        None
    };

    severity.map(|severity| {
        Anomaly::new(
            AnomalyKind::DownloadInflation,
            severity,
            format!(
                "{} downloads over {} days ({:.0} per day per thousand) suggests inflation",
                downloads, age_days, ratio
            ),
        )
    })
}

/// Flag bursts of version publishing
pub fn detect_version_spike(versions: &[VersionRecord], now: DateTime<Utc>) -> Option<Anomaly> {
    let last_day = versions_within(versions, now, Duration::hours(24));
    if last_day >= 5 {
        return Some(Anomaly::new(
            AnomalyKind::VersionSpike,
            Severity::High,
            format!("{} versions published in the last 24 hours", last_day),
        ));
    }

    let last_week = versions_within(versions, now, Duration::days(7));
    if last_week >= 10 {
        return Some(Anomaly::new(
            AnomalyKind::VersionSpike,
            Severity::Medium,
            format!("{} versions published in the last 7 days", last_week),
        ));
    }

    None
}

/// Flag packages younger than 90 days
pub fn detect_new_package(versions: &[VersionRecord], now: DateTime<Utc>) -> Option<Anomaly> {
    let age_days = package_age_days(versions, now)?;
    (age_days < 90).then(|| {
        Anomaly::new(
            AnomalyKind::NewPackage,
            Severity::Low,
            format!("first version published {} days ago", age_days),
        )
    })
}

/// Flag more than 20 versions inside a 30-day window
pub fn detect_rapid_versioning(versions: &[VersionRecord], now: DateTime<Utc>) -> Option<Anomaly> {
    let last_month = versions_within(versions, now, Duration::days(30));
    (last_month > 20).then(|| {
        Anomaly::new(
            AnomalyKind::RapidVersioning,
            Severity::Medium,
            format!("{} versions published in the last 30 days", last_month),
        )
    })
}

/// Whole days from the oldest version timestamp to now
fn package_age_days(versions: &[VersionRecord], now: DateTime<Utc>) -> Option<i64> {
    let oldest = versions.iter().filter_map(|v| v.created_at).min()?;
    let age = now.signed_duration_since(oldest).num_days();
    (age >= 0).then_some(age)
}

fn versions_within(versions: &[VersionRecord], now: DateTime<Utc>, window: Duration) -> usize {
    let cutoff = now - window;
    versions
        .iter()
        .filter_map(|v| v.created_at)
        .filter(|created| *created > cutoff && *created <= now)
        .count()
}
