//! Slopguard - SBOM dependency trust scanner
//!
//! Evaluates every declared package dependency against public registry
//! metadata and decides whether it is trustworthy, suspicious, blocked or
//! nonexistent. Built to catch slopsquatting: attackers preregistering
//! package names that AI code assistants hallucinate.
//!
//! The typical entry point is [`scanner::Scanner::scan`], which takes the
//! `(ecosystem, name, version)` triples an SBOM extractor produced and
//! returns a [`scanner::ScanSummary`] for the caller's reporter.

pub mod adapters;
pub mod anomalies;
pub mod cache;
pub mod config;
pub mod github;
pub mod http;
pub mod scanner;
pub mod scoring;
pub mod types;

pub use config::Config;
pub use scanner::{Action, PackageVerdict, ScanSummary, Scanner};
pub use types::{Ecosystem, PackageRef};
