//! Package references shared between the SBOM extractor and the scanner.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum accepted package name length.
const MAX_NAME_LEN: usize = 200;

/// Maximum accepted version string length.
const MAX_VERSION_LEN: usize = 50;

/// Supported package ecosystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ecosystem {
    /// Ruby gems (rubygems.org)
    #[serde(rename = "ruby")]
    RubyGems,
    /// Python packages (PyPI)
    #[serde(rename = "python")]
    PyPi,
    /// Go modules (addressed by host path, e.g. github.com/org/repo)
    #[serde(rename = "go")]
    GoModule,
}

impl Ecosystem {
    /// Canonical lowercase tag used in cache keys and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::RubyGems => "ruby",
            Ecosystem::PyPi => "python",
            Ecosystem::GoModule => "go",
        }
    }
}

impl Display for Ecosystem {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ecosystem {
    type Err = anyhow::Error;

    /// Parse an ecosystem tag, normalizing common aliases
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "ruby" | "gem" | "rubygems" => Ok(Ecosystem::RubyGems),
            "python" | "pypi" | "pip" => Ok(Ecosystem::PyPi),
            "go" | "golang" | "module-path" => Ok(Ecosystem::GoModule),
            other => anyhow::bail!("unsupported ecosystem: {}", other),
        }
    }
}

/// A single declared dependency, as extracted from an SBOM.
///
/// Construction validates the name and version against the character sets
/// the upstream extractor promises, so malformed input fails at the
/// boundary instead of inside a scan worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    /// Target ecosystem
    pub ecosystem: Ecosystem,
    /// Canonical package name
    pub name: String,
    /// Declared version string
    pub version: String,
}

impl PackageRef {
    /// Create a validated package reference
    pub fn new(ecosystem: Ecosystem, name: &str, version: &str) -> anyhow::Result<Self> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            anyhow::bail!("package name must be 1-{} characters", MAX_NAME_LEN);
        }
        if version.is_empty() || version.len() > MAX_VERSION_LEN {
            anyhow::bail!("package version must be 1-{} characters", MAX_VERSION_LEN);
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '@' | '-'))
        {
            anyhow::bail!("package name contains invalid characters: {}", name);
        }
        if !version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'))
        {
            anyhow::bail!("package version contains invalid characters: {}", version);
        }

        Ok(Self {
            ecosystem,
            name: name.to_string(),
            version: version.to_string(),
        })
    }
}

impl Display for PackageRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}@{}", self.ecosystem, self.name, self.version)
    }
}
