//! Severity-tagged findings that modify trust and gate the final action.
//!
//! Detectors are independent and each produces zero or one finding. All of
//! them are deterministic given their inputs; the ownership detector is
//! the only one that touches shared state (its last-seen record in the
//! cache).

use serde::Serialize;

pub mod growth;
pub mod names;
pub mod ownership;

/// Finding severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Default score penalty for a finding of this severity
    pub fn penalty(&self) -> i32 {
        match self {
            Severity::High => -20,
            Severity::Medium => -10,
            Severity::Low => -5,
        }
    }
}

/// Detector family that produced a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Typosquat,
    Homoglyph,
    NamespaceSquat,
    DownloadInflation,
    VersionSpike,
    NewPackage,
    RapidVersioning,
    OwnershipChange,
    NamePattern,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Typosquat => "typosquat",
            AnomalyKind::Homoglyph => "homoglyph",
            AnomalyKind::NamespaceSquat => "namespace_squat",
            AnomalyKind::DownloadInflation => "download_inflation",
            AnomalyKind::VersionSpike => "version_spike",
            AnomalyKind::NewPackage => "new_package",
            AnomalyKind::RapidVersioning => "rapid_versioning",
            AnomalyKind::OwnershipChange => "ownership_change",
            AnomalyKind::NamePattern => "name_pattern",
        }
    }
}

/// A single detector finding
#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub description: String,
    /// The legitimate package this one appears to impersonate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_package: Option<String>,
    /// Penalty replacing the severity default (ownership changes on very
    /// popular packages penalize harder than a plain HIGH finding)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_override: Option<i32>,
}

impl Anomaly {
    pub fn new(kind: AnomalyKind, severity: Severity, description: String) -> Self {
        Self {
            kind,
            severity,
            description,
            target_package: None,
            penalty_override: None,
        }
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target_package = Some(target.to_string());
        self
    }

    /// The score penalty this finding applies, exactly once
    pub fn penalty(&self) -> i32 {
        self.penalty_override.unwrap_or_else(|| self.severity.penalty())
    }
}
