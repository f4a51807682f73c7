//! Stateful ownership-change detection.
//!
//! The detector compares the currently published maintainer identity to
//! the one recorded on a previous scan, then records the current identity.
//! It depends on the cache directly: the last-seen record IS its state,
//! shared with every other scan on the machine.

use serde_json::json;

use crate::anomalies::{Anomaly, AnomalyKind, Severity};
use crate::cache::{DiskCache, TTL_OWNERSHIP};
use crate::types::Ecosystem;

/// Compare and record the maintainer identity for a package.
///
/// Severity scales with blast radius: a takeover of a package with 100M+
/// downloads penalizes −40, 10M+ −20, anything else −10.
pub fn detect_ownership_change(
    cache: &DiskCache,
    ecosystem: Ecosystem,
    name: &str,
    current_owner: &str,
    downloads: Option<u64>,
) -> Option<Anomaly> {
    if current_owner.is_empty() {
        return None;
    }

    let key = format!("owner:{}:{}", ecosystem.as_str(), name);
    let previous = cache
        .get(&key, TTL_OWNERSHIP)
        .and_then(|v| v.as_str().map(|s| s.to_string()));

    cache.set(&key, &json!(current_owner), TTL_OWNERSHIP);

    let previous = previous?;
    if previous == current_owner {
        return None;
    }

    let downloads = downloads.unwrap_or(0);
    let (severity, penalty_override) = if downloads >= 100_000_000 {
        (Severity::High, Some(-40))
    } else if downloads >= 10_000_000 {
        (Severity::High, None)
    } else {
        (Severity::Medium, None)
    };

    let mut anomaly = Anomaly::new(
        AnomalyKind::OwnershipChange,
        severity,
        format!(
            "recorded maintainer of '{}' changed from '{}' to '{}'",
            name, previous, current_owner
        ),
    );
    anomaly.penalty_override = penalty_override;
    Some(anomaly)
}
