//! Environment configuration for the scanner

use std::path::PathBuf;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default number of concurrent scan workers
const DEFAULT_WORKERS: usize = 5;

/// Scanner configuration, read once from the environment
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// GitHub API token; raises the anonymous hourly rate limit
    pub github_token: Option<String>,
    /// Verbose logging toggle
    pub debug: bool,
    /// Emit per-stage timing for each scored package
    pub profile: bool,
    /// Concurrent scan workers
    pub workers: usize,
    /// Override for the on-disk cache root (tests)
    pub cache_root: Option<PathBuf>,
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Self {
        Self {
            github_token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
            debug: env_flag("SLOPGUARD_DEBUG"),
            profile: env_flag("SLOPGUARD_PROFILE"),
            workers: std::env::var("SLOPGUARD_WORKERS")
                .ok()
                .and_then(|w| w.parse().ok())
                .filter(|w| *w > 0)
                .unwrap_or(DEFAULT_WORKERS),
            cache_root: None,
        }
    }

    /// Initialize the tracing stack.
    ///
    /// `RUST_LOG` wins when set; otherwise the debug toggle selects
    /// between `debug` and `warn` for this crate.
    pub fn init_logging(&self) {
        let default_filter = if self.debug {
            "slopguard=debug"
        } else {
            "slopguard=warn"
        };

        let _ = tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}
